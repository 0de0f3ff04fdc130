//! Mount orchestration: from a basedir and password to a running stack.
//!
//! Loading walks through: config envelope (password, format version,
//! cipher), local state (filesystem id pinning, encryption key hash,
//! taint bit, client id), then builds the block store stack
//! (disk → integrity → encryption → cache → parallel access) and opens
//! the root directory blob. The caller has already validated basedir and
//! mountdir accessibility.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cryfs_blobs::BlobStore;
use cryfs_blocks::integrity::known_block_versions::KnownBlockVersions;
use cryfs_blocks::{
    CachingBlockStore, EncryptedBlockStore, IntegrityBlockStore, ParallelAccessBlockStore,
    integrity::IntegrityConfig,
};
use cryfs_config::config::{DEFAULT_BLOCK_SIZE_BYTES, DEFAULT_CIPHER};
use cryfs_config::localstate::{
    BasedirMetadata, INTEGRITY_DATA_FILE_NAME, LocalStateDir, LocalStateError, LocalStateMetadata,
};
use cryfs_config::{Config, ConfigFile, ConfigLoadError, ErrorCode};
use cryfs_core::{BlockId, BlockStore, BlockStoreError};
use cryfs_crypto::ScryptParams;
use cryfs_crypto::cipher::BlockCipher;
use cryfs_store_ondisk::OnDiskBlockStore;
use tracing::{info, warn};

use crate::context::{AtimeUpdateBehavior, Context};
use crate::device::Device;
use crate::error::FsError;
use crate::fsblob::{FsBlob, FsBlobStore};

pub const CONFIG_FILE_NAME: &str = "cryfs.config";

/// scrypt hardness for new config files. The weak setting exists for
/// tests only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScryptSettings {
    Default,
    Test,
}

impl ScryptSettings {
    fn params(self) -> ScryptParams {
        match self {
            Self::Default => ScryptParams::generate_default(),
            Self::Test => ScryptParams::generate_for_tests(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Cipher for new filesystems; on load, a mismatch with the config is
    /// an error.
    pub cipher: Option<String>,
    /// Physical block size for new filesystems.
    pub block_size_bytes: Option<u64>,
    pub allow_integrity_violations: bool,
    pub missing_block_is_integrity_violation: bool,
    pub allow_replaced_filesystem: bool,
    pub atime_behavior: AtimeUpdateBehavior,
    /// Overrides the local state location; defaults to the environment
    /// (`CRYFS_LOCAL_STATE_DIR`, `$XDG_DATA_HOME`).
    pub local_state_dir: Option<LocalStateDir>,
    pub scrypt_settings: ScryptSettings,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cipher: None,
            block_size_bytes: None,
            allow_integrity_violations: false,
            missing_block_is_integrity_violation: false,
            allow_replaced_filesystem: false,
            atime_behavior: AtimeUpdateBehavior::Relatime,
            local_state_dir: None,
            scrypt_settings: ScryptSettings::Default,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("password cannot be empty")]
    EmptyPassword,

    #[error(transparent)]
    Config(#[from] ConfigLoadError),

    #[error(transparent)]
    LocalState(#[from] LocalStateError),

    #[error(
        "a previous run detected an integrity violation; refusing to mount until the integrity \
         state file is deleted"
    )]
    IntegrityViolationOnPreviousRun,

    #[error("this filesystem is in single-client mode and owned by client {owner:#x}")]
    SingleClientFileSystem { owner: u32 },

    #[error(
        "the mount options and the filesystem disagree on whether missing blocks are \
         integrity violations"
    )]
    DifferentIntegritySetup,

    #[error("filesystem uses cipher {actual} but {requested} was requested")]
    WrongCipher { requested: String, actual: String },

    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
}

impl MountError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::EmptyPassword => ErrorCode::EmptyPassword,
            Self::Config(e) => e.error_code(),
            Self::LocalState(e) => e.error_code(),
            Self::IntegrityViolationOnPreviousRun => ErrorCode::IntegrityViolationOnPreviousRun,
            Self::SingleClientFileSystem { .. } => ErrorCode::SingleClientFileSystem,
            Self::DifferentIntegritySetup => ErrorCode::FilesystemHasDifferentIntegritySetup,
            Self::WrongCipher { .. } => ErrorCode::WrongCipher,
            Self::InvalidFilesystem(_) => ErrorCode::InvalidFilesystem,
            Self::BlockStore(BlockStoreError::IntegrityViolation(_)) => {
                ErrorCode::IntegrityViolation
            }
            Self::BlockStore(_) => ErrorCode::UnspecifiedError,
        }
    }
}

/// A mounted filesystem: the device plus the state that needs explicit
/// teardown.
pub struct Filesystem {
    device: Device,
    integrity: Arc<IntegrityBlockStore>,
    config: ConfigFile,
}

impl Filesystem {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &Config {
        self.config.config()
    }

    /// Flushes all state through to the basedir and persists the
    /// integrity bookkeeping.
    pub async fn unmount(self) -> Result<(), FsError> {
        self.device.flush().await?;
        self.integrity.save_state().map_err(FsError::from)?;
        Ok(())
    }
}

struct StackParts {
    blocks: Arc<ParallelAccessBlockStore>,
    integrity: Arc<IntegrityBlockStore>,
}

fn build_stack(
    basedir: &Path,
    config: &Config,
    my_client_id: u32,
    integrity_config: IntegrityConfig,
    state_dir: &Path,
) -> Result<StackParts, MountError> {
    let key = config
        .encryption_key()
        .map_err(MountError::InvalidFilesystem)?;
    let cipher = BlockCipher::new(&config.cipher_name, &key)
        .map_err(|e| MountError::InvalidFilesystem(e.to_string()))?;
    if cipher.spec().warns_about_integrity {
        warn!(
            "filesystem uses cipher {} which does not authenticate ciphertexts",
            cipher.spec().name
        );
    }

    let known_versions =
        KnownBlockVersions::load_or_create(state_dir.join(INTEGRITY_DATA_FILE_NAME))
            .map_err(BlockStoreError::from)?;

    let base: Arc<dyn BlockStore> = Arc::new(OnDiskBlockStore::new(basedir));
    let integrity = Arc::new(IntegrityBlockStore::new(
        base,
        known_versions,
        my_client_id,
        integrity_config,
    ));
    let encrypted: Arc<dyn BlockStore> = Arc::new(EncryptedBlockStore::new(
        integrity.clone() as Arc<dyn BlockStore>,
        cipher,
    ));
    let caching = Arc::new(CachingBlockStore::new(
        encrypted,
        CachingBlockStore::default_capacity(config.block_size_bytes),
    ));
    let blocks = Arc::new(ParallelAccessBlockStore::new(caching));
    Ok(StackParts { blocks, integrity })
}

fn config_path(basedir: &Path) -> PathBuf {
    basedir.join(CONFIG_FILE_NAME)
}

fn state_dir_for(opts: &MountOptions) -> LocalStateDir {
    opts.local_state_dir
        .clone()
        .unwrap_or_else(LocalStateDir::from_env)
}

/// Creates a fresh filesystem in `basedir` and mounts it.
pub async fn create_filesystem(
    basedir: &Path,
    password: &str,
    opts: &MountOptions,
) -> Result<Filesystem, MountError> {
    if password.is_empty() {
        return Err(MountError::EmptyPassword);
    }
    let cipher_name = opts.cipher.as_deref().unwrap_or(DEFAULT_CIPHER);
    let block_size = opts.block_size_bytes.unwrap_or(DEFAULT_BLOCK_SIZE_BYTES);
    let mut config = Config::new_for_creation(cipher_name, block_size)
        .ok_or_else(|| ConfigLoadError::UnsupportedCipher(cipher_name.to_string()))?;

    let filesystem_id = config
        .filesystem_id()
        .expect("freshly generated id is valid");
    let state_root = state_dir_for(opts);
    let state_dir = state_root.for_filesystem_id(&filesystem_id);
    let key = config
        .encryption_key()
        .expect("freshly generated key is valid");
    let metadata = LocalStateMetadata::load_or_generate(
        &state_dir,
        key.as_bytes(),
        opts.allow_replaced_filesystem,
    )?;
    // Treating missing blocks as attacks only works when no other client
    // legitimately deletes blocks, so it pins the filesystem to us.
    if opts.missing_block_is_integrity_violation {
        config.exclusive_client_id = Some(metadata.my_client_id());
    }
    BasedirMetadata::check_and_update(
        &state_root,
        basedir,
        &filesystem_id,
        opts.allow_replaced_filesystem,
    )?;

    let integrity_config = IntegrityConfig {
        allow_integrity_violations: opts.allow_integrity_violations,
        missing_block_is_integrity_violation: opts.missing_block_is_integrity_violation,
    };
    let stack = build_stack(
        basedir,
        &config,
        metadata.my_client_id(),
        integrity_config,
        &state_dir,
    )?;

    let blob_store = BlobStore::new(stack.blocks.clone(), block_size)
        .map_err(|e| MountError::InvalidFilesystem(e.to_string()))?;
    let fsblobs = FsBlobStore::new(blob_store);
    let root = fsblobs
        .create_dir_blob()
        .await
        .map_err(|e| MountError::InvalidFilesystem(e.to_string()))?;
    config.root_blob_id = root.id().to_hex();
    drop(root);
    stack.blocks.flush_all().await?;

    let config_file = ConfigFile::create(
        config_path(basedir),
        config,
        password,
        opts.scrypt_settings.params(),
    )?;
    info!(
        "created filesystem {} in {}",
        config_file.config().filesystem_id,
        basedir.display()
    );

    let root_id = BlockId::from_hex(&config_file.config().root_blob_id)
        .expect("root id was just generated");
    let context = Context {
        atime_behavior: opts.atime_behavior,
        ..Context::default()
    };
    let device = Device::new(fsblobs, stack.blocks.clone(), root_id, context, block_size);
    Ok(Filesystem {
        device,
        integrity: stack.integrity,
        config: config_file,
    })
}

/// Loads and mounts the filesystem in `basedir`.
pub async fn load_filesystem(
    basedir: &Path,
    password: &str,
    opts: &MountOptions,
) -> Result<Filesystem, MountError> {
    if password.is_empty() {
        return Err(MountError::EmptyPassword);
    }
    let config_file = ConfigFile::load(config_path(basedir), password)?;
    let config = config_file.config().clone();

    if let Some(requested) = &opts.cipher {
        if *requested != config.cipher_name {
            return Err(MountError::WrongCipher {
                requested: requested.clone(),
                actual: config.cipher_name.clone(),
            });
        }
    }

    let filesystem_id = config
        .filesystem_id()
        .map_err(MountError::InvalidFilesystem)?;
    let state_root = state_dir_for(opts);
    BasedirMetadata::check_and_update(
        &state_root,
        basedir,
        &filesystem_id,
        opts.allow_replaced_filesystem,
    )?;
    let state_dir = state_root.for_filesystem_id(&filesystem_id);

    let key = config
        .encryption_key()
        .map_err(MountError::InvalidFilesystem)?;
    let metadata = LocalStateMetadata::load_or_generate(
        &state_dir,
        key.as_bytes(),
        opts.allow_replaced_filesystem,
    )?;

    if let Some(owner) = config.exclusive_client_id {
        if owner != metadata.my_client_id() {
            return Err(MountError::SingleClientFileSystem { owner });
        }
    }
    if opts.missing_block_is_integrity_violation != config.exclusive_client_id.is_some() {
        return Err(MountError::DifferentIntegritySetup);
    }

    // Check the taint bit before building the stack.
    {
        let known_versions =
            KnownBlockVersions::load_or_create(state_dir.join(INTEGRITY_DATA_FILE_NAME))
                .map_err(BlockStoreError::from)?;
        if known_versions.is_tainted() && !opts.allow_integrity_violations {
            return Err(MountError::IntegrityViolationOnPreviousRun);
        }
    }

    let integrity_config = IntegrityConfig {
        allow_integrity_violations: opts.allow_integrity_violations,
        missing_block_is_integrity_violation: opts.missing_block_is_integrity_violation,
    };
    let stack = build_stack(
        basedir,
        &config,
        metadata.my_client_id(),
        integrity_config,
        &state_dir,
    )?;

    let blob_store = BlobStore::new(stack.blocks.clone(), config.block_size_bytes)
        .map_err(|e| MountError::InvalidFilesystem(e.to_string()))?;
    let fsblobs = FsBlobStore::new(blob_store);

    let root_id = BlockId::from_hex(&config.root_blob_id)
        .map_err(|e| MountError::InvalidFilesystem(format!("bad root blob id: {e}")))?;
    match fsblobs.load(&root_id).await {
        Ok(Some(FsBlob::Dir(_))) => {}
        Ok(Some(_)) => {
            return Err(MountError::InvalidFilesystem(
                "root blob is not a directory".into(),
            ));
        }
        Ok(None) => {
            return Err(MountError::InvalidFilesystem("root blob is missing".into()));
        }
        Err(FsError::IntegrityViolation(v)) => {
            return Err(MountError::BlockStore(v.into()));
        }
        Err(e) => return Err(MountError::InvalidFilesystem(e.to_string())),
    }

    let context = Context {
        atime_behavior: opts.atime_behavior,
        ..Context::default()
    };
    let device = Device::new(
        fsblobs,
        stack.blocks.clone(),
        root_id,
        context,
        config.block_size_bytes,
    );
    Ok(Filesystem {
        device,
        integrity: stack.integrity,
        config: config_file,
    })
}
