//! Config file handling for cryfs.
//!
//! The config file carries everything needed to open a filesystem: the
//! root blob id, the cipher name, the (hex) encryption key, the block
//! size, the filesystem id and version bookkeeping. It is sealed in a
//! two-layer crypto envelope: an outer AES-256-GCM layer under a
//! scrypt-derived key, and an inner layer under the filesystem's own
//! cipher, with random padding at both levels so the file's size reveals
//! nothing about its content.
//!
//! Per-machine local state (client id, encryption key hash, integrity
//! data) lives outside the basedir, keyed by filesystem id.

pub mod config;
pub mod config_file;
pub mod encryption;
pub mod error;
pub mod localstate;

pub use config::{Config, FILESYSTEM_FORMAT_VERSION, FilesystemId};
pub use config_file::ConfigFile;
pub use error::{ConfigLoadError, ErrorCode};
pub use localstate::{BasedirMetadata, LocalStateDir, LocalStateMetadata};
