//! Mount-wide context: timestamp policy and default ownership.

use std::time::{Duration, SystemTime};

/// When to update access timestamps, mirroring the mount options of the
/// same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtimeUpdateBehavior {
    /// Never update atime.
    Noatime,
    /// Update atime on every access.
    Strictatime,
    /// Update atime if it is older than mtime/ctime or more than a day old.
    Relatime,
    /// relatime for files, never for directories.
    NodiratimeRelatime,
    /// strictatime for files, never for directories.
    NodiratimeStrictatime,
}

const RELATIME_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24);

impl AtimeUpdateBehavior {
    fn relatime_due(atime: SystemTime, mtime: SystemTime, ctime: SystemTime) -> bool {
        let stale = SystemTime::now()
            .duration_since(atime)
            .map(|age| age > RELATIME_MAX_AGE)
            .unwrap_or(false);
        atime <= mtime || atime <= ctime || stale
    }

    pub fn should_update_atime_on_file_read(
        self,
        atime: SystemTime,
        mtime: SystemTime,
        ctime: SystemTime,
    ) -> bool {
        match self {
            Self::Noatime => false,
            Self::Strictatime | Self::NodiratimeStrictatime => true,
            Self::Relatime | Self::NodiratimeRelatime => Self::relatime_due(atime, mtime, ctime),
        }
    }

    pub fn should_update_atime_on_directory_read(
        self,
        atime: SystemTime,
        mtime: SystemTime,
        ctime: SystemTime,
    ) -> bool {
        match self {
            Self::Noatime | Self::NodiratimeRelatime | Self::NodiratimeStrictatime => false,
            Self::Strictatime => true,
            Self::Relatime => Self::relatime_due(atime, mtime, ctime),
        }
    }
}

/// Injected into the device; the FUSE adapter would fill this from mount
/// options and the mounting user.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub atime_behavior: AtimeUpdateBehavior,
    /// Owner for the root directory and for entries created without an
    /// explicit uid/gid.
    pub uid: u32,
    pub gid: u32,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            atime_behavior: AtimeUpdateBehavior::Relatime,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn past(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    #[test]
    fn noatime_never_updates() {
        let b = AtimeUpdateBehavior::Noatime;
        assert!(!b.should_update_atime_on_file_read(past(10_000_000), past(10), past(10)));
        assert!(!b.should_update_atime_on_directory_read(past(10_000_000), past(10), past(10)));
    }

    #[test]
    fn strictatime_always_updates() {
        let b = AtimeUpdateBehavior::Strictatime;
        assert!(b.should_update_atime_on_file_read(past(0), past(100), past(100)));
        assert!(b.should_update_atime_on_directory_read(past(0), past(100), past(100)));
    }

    #[test]
    fn relatime_updates_when_atime_is_behind_mtime() {
        let b = AtimeUpdateBehavior::Relatime;
        assert!(b.should_update_atime_on_file_read(past(50), past(10), past(100)));
        assert!(!b.should_update_atime_on_file_read(past(10), past(50), past(100)));
    }

    #[test]
    fn relatime_updates_when_atime_is_a_day_old() {
        let b = AtimeUpdateBehavior::Relatime;
        assert!(b.should_update_atime_on_file_read(
            past(2 * 24 * 60 * 60),
            past(3 * 24 * 60 * 60),
            past(3 * 24 * 60 * 60)
        ));
    }

    #[test]
    fn nodiratime_skips_directories_only() {
        let b = AtimeUpdateBehavior::NodiratimeStrictatime;
        assert!(b.should_update_atime_on_file_read(past(0), past(100), past(100)));
        assert!(!b.should_update_atime_on_directory_read(past(0), past(100), past(100)));
    }
}
