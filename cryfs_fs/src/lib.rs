//! The filesystem layer.
//!
//! Files, directories and symlinks are blobs whose first byte is a kind
//! magic; directories hold a serialized, name-ordered entry table. The
//! [`Device`] exposes the path-based object model the FUSE adapter calls
//! into, and `filesystem` wires a basedir, config file and local state
//! into a running stack.
//!
//! ## Layers
//! 1. `fsblob` – kind-typed blobs and the directory entry codec.
//! 2. `device` – path lookup and the node operations (create, rename,
//!    unlink, stat, …), serialized per directory.
//! 3. `filesystem` – mount orchestration: config, local state, block
//!    store stack construction.

pub mod context;
pub mod device;
pub mod error;
pub mod filesystem;
pub mod fsblob;

pub use context::{AtimeUpdateBehavior, Context};
pub use device::{Device, NodeAttrs, OpenFile, Statfs};
pub use error::FsError;
pub use filesystem::{Filesystem, MountError, MountOptions, ScryptSettings};
pub use fsblob::dir_entries::EntryKind;
