//! The directory entry table and its byte codec.
//!
//! Serialized entry layout (entries are concatenated with no separator):
//!
//! ```text
//! kind (u8: 1 = file, 2 = dir, 3 = symlink)
//! name bytes || 0x00
//! target blob id (16 bytes)
//! mode (u32 LE) || uid (u32 LE) || gid (u32 LE)
//! atime (i64 LE sec, u32 LE nsec) || mtime (i64, u32) || ctime (i64, u32)
//! ```
//!
//! Entries are kept sorted by name, which makes lookups binary searches
//! and serialized directories deterministic.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cryfs_core::{BlockId, block_id::BLOCK_ID_LEN};

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    File = 1,
    Dir = 2,
    Symlink = 3,
}

impl EntryKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::File),
            2 => Some(Self::Dir),
            3 => Some(Self::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub name: String,
    pub blob_id: BlockId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl DirEntry {
    pub fn new(kind: EntryKind, name: String, blob_id: BlockId, mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            name,
            blob_id,
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn serialized_size(&self) -> usize {
        1 + self.name.len() + 1 + BLOCK_ID_LEN + 3 * 4 + 3 * 12
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.blob_id.as_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        serialize_time(out, self.atime);
        serialize_time(out, self.mtime);
        serialize_time(out, self.ctime);
    }
}

fn serialize_time(out: &mut Vec<u8>, time: SystemTime) {
    let (sec, nsec) = match time.duration_since(UNIX_EPOCH) {
        Ok(since) => (since.as_secs() as i64, since.subsec_nanos()),
        Err(e) => {
            let before = e.duration();
            // Round pre-epoch times down to whole negative seconds.
            let mut sec = -(before.as_secs() as i64);
            let mut nsec = before.subsec_nanos();
            if nsec != 0 {
                sec -= 1;
                nsec = 1_000_000_000 - nsec;
            }
            (sec, nsec)
        }
    };
    out.extend_from_slice(&sec.to_le_bytes());
    out.extend_from_slice(&nsec.to_le_bytes());
}

fn deserialize_time(data: &[u8]) -> SystemTime {
    let sec = i64::from_le_bytes(data[..8].try_into().unwrap());
    let nsec = u32::from_le_bytes(data[8..12].try_into().unwrap());
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0) + Duration::new(0, nsec)
    }
}

/// A directory's entries, sorted by name.
#[derive(Debug, Default, Clone)]
pub struct DirEntryList {
    entries: Vec<DirEntry>,
}

impl DirEntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    fn index_of(&self, name: &str) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.index_of(name).ok().map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DirEntry> {
        match self.index_of(name) {
            Ok(i) => Some(&mut self.entries[i]),
            Err(_) => None,
        }
    }

    /// Inserts a new entry; fails if the name is taken.
    pub fn add(&mut self, entry: DirEntry) -> FsResult<()> {
        match self.index_of(&entry.name) {
            Ok(_) => Err(FsError::AlreadyExists),
            Err(i) => {
                self.entries.insert(i, entry);
                Ok(())
            }
        }
    }

    /// Removes and returns the entry with this name.
    pub fn remove(&mut self, name: &str) -> FsResult<DirEntry> {
        match self.index_of(name) {
            Ok(i) => Ok(self.entries.remove(i)),
            Err(_) => Err(FsError::NotFound),
        }
    }

    /// Renames an entry in place, keeping the list sorted. Any existing
    /// entry under the new name must have been removed by the caller.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> FsResult<()> {
        let mut entry = self.remove(old_name)?;
        entry.name = new_name.to_string();
        entry.ctime = SystemTime::now();
        self.add(entry)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let size: usize = self.entries.iter().map(DirEntry::serialized_size).sum();
        let mut out = Vec::with_capacity(size);
        for entry in &self.entries {
            entry.serialize_into(&mut out);
        }
        out
    }

    pub fn deserialize(mut data: &[u8]) -> FsResult<Self> {
        let corrupt = |what: &str| FsError::Io(format!("corrupt directory blob: {what}"));
        let mut entries = Vec::new();
        while !data.is_empty() {
            let kind = EntryKind::from_byte(data[0]).ok_or_else(|| corrupt("entry kind"))?;
            data = &data[1..];

            let name_end = data
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| corrupt("unterminated name"))?;
            let name = std::str::from_utf8(&data[..name_end])
                .map_err(|_| corrupt("name is not UTF-8"))?
                .to_string();
            data = &data[name_end + 1..];

            let fixed_len = BLOCK_ID_LEN + 3 * 4 + 3 * 12;
            if data.len() < fixed_len {
                return Err(corrupt("truncated entry"));
            }
            let blob_id = BlockId::from_slice(&data[..BLOCK_ID_LEN]).unwrap();
            let mode = u32::from_le_bytes(data[16..20].try_into().unwrap());
            let uid = u32::from_le_bytes(data[20..24].try_into().unwrap());
            let gid = u32::from_le_bytes(data[24..28].try_into().unwrap());
            let atime = deserialize_time(&data[28..40]);
            let mtime = deserialize_time(&data[40..52]);
            let ctime = deserialize_time(&data[52..64]);
            data = &data[fixed_len..];

            entries.push(DirEntry {
                kind,
                name,
                blob_id,
                mode,
                uid,
                gid,
                atime,
                mtime,
                ctime,
            });
        }
        // Stored directories are sorted; tolerate anything else by
        // re-sorting rather than rejecting the blob.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> DirEntry {
        DirEntry::new(kind, name.to_string(), BlockId::new_random(), 0o644, 1000, 1000)
    }

    #[test]
    fn serialize_roundtrip() {
        let mut list = DirEntryList::new();
        list.add(entry("hello.txt", EntryKind::File)).unwrap();
        list.add(entry("subdir", EntryKind::Dir)).unwrap();
        list.add(entry("link", EntryKind::Symlink)).unwrap();

        let restored = DirEntryList::deserialize(&list.serialize()).unwrap();
        assert_eq!(list.len(), restored.len());
        for (a, b) in list.iter().zip(restored.iter()) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.name, b.name);
            assert_eq!(a.blob_id, b.blob_id);
            assert_eq!(a.mode, b.mode);
        }
    }

    #[test]
    fn byte_layout_is_stable() {
        let mut list = DirEntryList::new();
        let id = BlockId::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let mut e = DirEntry::new(EntryKind::File, "ab".to_string(), id, 0o644, 7, 9);
        e.atime = UNIX_EPOCH + Duration::new(100, 1);
        e.mtime = UNIX_EPOCH + Duration::new(200, 2);
        e.ctime = UNIX_EPOCH + Duration::new(300, 3);
        list.add(e).unwrap();

        let bytes = list.serialize();
        assert_eq!(1, bytes[0]); // kind = file
        assert_eq!(b"ab", &bytes[1..3]);
        assert_eq!(0, bytes[3]); // null terminator
        assert_eq!(&id.as_bytes()[..], &bytes[4..20]);
        assert_eq!(&0o644u32.to_le_bytes()[..], &bytes[20..24]);
        assert_eq!(&7u32.to_le_bytes()[..], &bytes[24..28]);
        assert_eq!(&9u32.to_le_bytes()[..], &bytes[28..32]);
        assert_eq!(&100i64.to_le_bytes()[..], &bytes[32..40]);
        assert_eq!(&1u32.to_le_bytes()[..], &bytes[40..44]);
        // kind + name + NUL + id + mode/uid/gid + three timestamps
        assert_eq!(1 + 2 + 1 + 16 + 12 + 36, bytes.len());
    }

    #[test]
    fn entries_are_sorted_by_name() {
        let mut list = DirEntryList::new();
        list.add(entry("zz", EntryKind::File)).unwrap();
        list.add(entry("aa", EntryKind::File)).unwrap();
        list.add(entry("mm", EntryKind::File)).unwrap();

        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(vec!["aa", "mm", "zz"], names);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut list = DirEntryList::new();
        list.add(entry("name", EntryKind::File)).unwrap();
        assert!(matches!(
            list.add(entry("name", EntryKind::Dir)),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn remove_and_rename() {
        let mut list = DirEntryList::new();
        list.add(entry("a", EntryKind::File)).unwrap();
        list.add(entry("b", EntryKind::File)).unwrap();

        list.rename("a", "z").unwrap();
        assert!(list.get("a").is_none());
        assert!(list.get("z").is_some());
        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(vec!["b", "z"], names);

        list.remove("b").unwrap();
        assert_eq!(1, list.len());
        assert!(matches!(list.remove("b"), Err(FsError::NotFound)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(DirEntryList::deserialize(&[9, 9, 9]).is_err());
        assert!(DirEntryList::deserialize(&[1, b'x']).is_err());
    }

    #[test]
    fn empty_list_roundtrip() {
        let list = DirEntryList::new();
        assert!(list.serialize().is_empty());
        assert!(DirEntryList::deserialize(&[]).unwrap().is_empty());
    }
}
