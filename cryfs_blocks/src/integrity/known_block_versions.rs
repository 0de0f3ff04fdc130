//! Persistent record of the block versions this client has seen.
//!
//! The version map is keyed by (writer client id, block id): each client
//! numbers its own writes, so clients never race on a counter. The
//! last-writer map remembers which client updated a block most recently and
//! doubles as the "ever seen" set; a deleted block keeps an entry with the
//! reserved client id 0.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use cryfs_core::{BlockId, IntegrityViolationError, block_id::BLOCK_ID_LEN};

/// Reserved writer id marking a block we deleted ourselves. Never handed
/// out as a real client id.
pub const CLIENT_ID_FOR_DELETED_BLOCK: u32 = 0;

const FORMAT_HEADER: &[u8] = b"cryfs.integritydata;1\0";

/// Versions last seen per (client, block), the last writer per block, and
/// the taint bit. Loaded from and saved to the local state directory.
#[derive(Debug)]
pub struct KnownBlockVersions {
    path: Option<PathBuf>,
    known_versions: HashMap<(u32, BlockId), u64>,
    last_update_client: HashMap<BlockId, u32>,
    known_clients: HashSet<u32>,
    tainted: bool,
}

impl KnownBlockVersions {
    /// Purely in-memory state that is never persisted; used by tests.
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            known_versions: HashMap::new(),
            last_update_client: HashMap::new(),
            known_clients: HashSet::new(),
            tainted: false,
        }
    }

    /// Loads the state file at `path`, or starts empty if there is none.
    pub fn load_or_create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::File::open(&path) {
            Ok(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Self::deserialize(&data, path)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self {
                path: Some(path),
                known_versions: HashMap::new(),
                last_update_client: HashMap::new(),
                known_clients: HashSet::new(),
                tainted: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Writes the state back to its file. No-op for in-memory state.
    pub fn persist(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.serialize())?;
        file.sync_all()
    }

    /// Deletes the state file, clearing the taint with it.
    pub fn delete_state_file(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Next version number for a write of `id` by `client`; records the
    /// client as the block's last writer.
    pub fn increment_version(&mut self, client: u32, id: BlockId) -> u64 {
        let version = self
            .known_versions
            .get(&(client, id))
            .copied()
            .unwrap_or(0)
            + 1;
        self.known_versions.insert((client, id), version);
        self.last_update_client.insert(id, client);
        self.known_clients.insert(client);
        version
    }

    /// Validates a loaded header against what we have seen and, if it is
    /// acceptable, records it. A version may repeat only if the same client
    /// is still the block's last writer; anything older is a rollback, and
    /// a block we deleted must not come back at all.
    pub fn check_and_update(
        &mut self,
        client: u32,
        id: BlockId,
        version: u64,
    ) -> Result<(), IntegrityViolationError> {
        let known = self.known_versions.get(&(client, id)).copied();
        let last_writer = self.last_update_client.get(&id).copied();

        let acceptable = match known {
            None => true, // trust on first use
            Some(k) if version > k => true,
            Some(k) => version == k && last_writer == Some(client),
        };
        if !acceptable {
            if last_writer == Some(CLIENT_ID_FOR_DELETED_BLOCK) {
                return Err(IntegrityViolationError::DeletedBlockReappeared { id });
            }
            return Err(IntegrityViolationError::RollBack {
                id,
                client_id: client,
                expected: known.unwrap_or(0),
                seen: version,
            });
        }

        self.known_versions.insert((client, id), version);
        self.last_update_client.insert(id, client);
        self.known_clients.insert(client);
        Ok(())
    }

    /// Remembers that we deleted `id`, so it reappearing is a violation.
    pub fn mark_block_as_deleted(&mut self, id: BlockId) {
        self.last_update_client
            .insert(id, CLIENT_ID_FOR_DELETED_BLOCK);
    }

    /// Whether we ever saw this block and have not deleted it ourselves.
    pub fn block_should_exist(&self, id: &BlockId) -> bool {
        match self.last_update_client.get(id) {
            Some(&client) => client != CLIENT_ID_FOR_DELETED_BLOCK,
            None => false,
        }
    }

    pub fn is_known_client(&self, client: u32) -> bool {
        self.known_clients.contains(&client)
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn set_tainted(&mut self) {
        self.tainted = true;
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            FORMAT_HEADER.len()
                + 1
                + 8
                + self.known_versions.len() * (4 + BLOCK_ID_LEN + 8)
                + 8
                + self.last_update_client.len() * (BLOCK_ID_LEN + 4),
        );
        out.extend_from_slice(FORMAT_HEADER);
        out.push(self.tainted as u8);
        out.extend_from_slice(&(self.known_versions.len() as u64).to_le_bytes());
        for (&(client, id), &version) in &self.known_versions {
            out.extend_from_slice(&client.to_le_bytes());
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&version.to_le_bytes());
        }
        out.extend_from_slice(&(self.last_update_client.len() as u64).to_le_bytes());
        for (id, &client) in &self.last_update_client {
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&client.to_le_bytes());
        }
        out
    }

    fn deserialize(data: &[u8], path: PathBuf) -> io::Result<Self> {
        fn take<'a>(reader: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
            if reader.len() < n {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed integrity state",
                ));
            }
            let (head, tail) = reader.split_at(n);
            *reader = tail;
            Ok(head)
        }
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed integrity state");
        let rest = data
            .strip_prefix(FORMAT_HEADER)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown state file format"))?;

        let mut reader = rest;

        let tainted = take(&mut reader, 1)?[0] != 0;

        let num_versions = u64::from_le_bytes(take(&mut reader, 8)?.try_into().unwrap());
        let mut known_versions = HashMap::new();
        let mut known_clients = HashSet::new();
        for _ in 0..num_versions {
            let client = u32::from_le_bytes(take(&mut reader, 4)?.try_into().unwrap());
            let id =
                BlockId::from_slice(take(&mut reader, BLOCK_ID_LEN)?).map_err(|_| malformed())?;
            let version = u64::from_le_bytes(take(&mut reader, 8)?.try_into().unwrap());
            known_versions.insert((client, id), version);
            known_clients.insert(client);
        }

        let num_writers = u64::from_le_bytes(take(&mut reader, 8)?.try_into().unwrap());
        let mut last_update_client = HashMap::new();
        for _ in 0..num_writers {
            let id =
                BlockId::from_slice(take(&mut reader, BLOCK_ID_LEN)?).map_err(|_| malformed())?;
            let client = u32::from_le_bytes(take(&mut reader, 4)?.try_into().unwrap());
            last_update_client.insert(id, client);
        }

        if !reader.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            path: Some(path),
            known_versions,
            last_update_client,
            known_clients,
            tainted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_start_at_one_and_increment() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        assert_eq!(1, state.increment_version(5, id));
        assert_eq!(2, state.increment_version(5, id));
        assert_eq!(1, state.increment_version(6, id));
    }

    #[test]
    fn accepts_increasing_versions() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 1).unwrap();
        state.check_and_update(5, id, 2).unwrap();
        state.check_and_update(5, id, 10).unwrap();
    }

    #[test]
    fn accepts_same_version_from_same_last_writer() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 3).unwrap();
        state.check_and_update(5, id, 3).unwrap();
    }

    #[test]
    fn rejects_same_version_after_other_client_wrote() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 3).unwrap();
        state.check_and_update(6, id, 1).unwrap();
        assert!(matches!(
            state.check_and_update(5, id, 3),
            Err(IntegrityViolationError::RollBack { .. })
        ));
    }

    #[test]
    fn rejects_version_rollback() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 7).unwrap();
        assert!(matches!(
            state.check_and_update(5, id, 6),
            Err(IntegrityViolationError::RollBack {
                expected: 7,
                seen: 6,
                ..
            })
        ));
    }

    #[test]
    fn rejects_deleted_block_reappearing() {
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 3).unwrap();
        state.mark_block_as_deleted(id);
        assert!(!state.block_should_exist(&id));
        assert!(matches!(
            state.check_and_update(5, id, 3),
            Err(IntegrityViolationError::DeletedBlockReappeared { .. })
        ));
    }

    #[test]
    fn newer_version_resurrects_deleted_block() {
        // A legitimate client may recreate a block id it deleted earlier.
        let mut state = KnownBlockVersions::new_in_memory();
        let id = BlockId::new_random();
        state.check_and_update(5, id, 3).unwrap();
        state.mark_block_as_deleted(id);
        state.check_and_update(5, id, 4).unwrap();
        assert!(state.block_should_exist(&id));
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integritydata");
        let id = BlockId::new_random();
        let deleted = BlockId::new_random();

        let mut state = KnownBlockVersions::load_or_create(&path).unwrap();
        state.check_and_update(5, id, 3).unwrap();
        state.mark_block_as_deleted(deleted);
        state.set_tainted();
        state.persist().unwrap();

        let mut restored = KnownBlockVersions::load_or_create(&path).unwrap();
        assert!(restored.is_tainted());
        assert!(restored.block_should_exist(&id));
        assert!(!restored.block_should_exist(&deleted));
        assert!(restored.is_known_client(5));
        assert!(matches!(
            restored.check_and_update(5, id, 2),
            Err(IntegrityViolationError::RollBack { .. })
        ));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = KnownBlockVersions::load_or_create(dir.path().join("integritydata")).unwrap();
        assert!(!state.is_tainted());
    }

    #[test]
    fn rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integritydata");
        std::fs::write(&path, b"not a state file").unwrap();
        assert!(KnownBlockVersions::load_or_create(&path).is_err());
    }
}
