//! Error kinds and process exit codes.

/// Exit codes reported to the caller; stable numbers, part of the CLI
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,

    /// An error happened that doesn't have an error code associated with it
    UnspecifiedError = 1,

    /// The command line arguments are invalid.
    InvalidArguments = 10,

    /// Couldn't load config file. Probably the password is wrong.
    WrongPassword = 11,

    /// Password cannot be empty.
    EmptyPassword = 12,

    /// The file system format is too new for this version. Please update.
    TooNewFilesystemFormat = 13,

    /// The file system format is too old for this version.
    TooOldFilesystemFormat = 14,

    /// The file system uses a different cipher than the one requested.
    WrongCipher = 15,

    /// Base directory doesn't exist or is inaccessible.
    InaccessibleBaseDir = 16,

    /// Mount directory doesn't exist or is inaccessible.
    InaccessibleMountDir = 17,

    /// Base directory can't be a subdirectory of the mount directory.
    BaseDirInsideMountDir = 18,

    /// Something's wrong with the file system.
    InvalidFilesystem = 19,

    /// The filesystem id changed since we last loaded this basedir.
    /// Could mean an attacker replaced the file system with another one.
    FilesystemIdChanged = 20,

    /// The filesystem encryption key changed since the last load.
    /// Could mean an attacker replaced the file system with another one.
    EncryptionKeyChanged = 21,

    /// The command line options and the file system disagree on whether
    /// missing blocks are integrity violations.
    FilesystemHasDifferentIntegritySetup = 22,

    /// File system is in single-client mode and was created by a
    /// different client.
    SingleClientFileSystem = 23,

    /// A previous run detected an integrity violation. Access is blocked
    /// until the user deletes the integrity state file.
    IntegrityViolationOnPreviousRun = 24,

    /// An integrity violation was detected during operation.
    IntegrityViolation = 25,
}

impl ErrorCode {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

/// Why loading a config file failed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("config file not found")]
    NotFound,

    #[error("wrong password")]
    WrongPassword,

    #[error("filesystem format {0} is too old for this version")]
    TooOldFilesystemFormat(String),

    #[error("filesystem format {0} is too new for this version; please upgrade")]
    TooNewFilesystemFormat(String),

    #[error("config file uses unsupported cipher {0}")]
    UnsupportedCipher(String),

    #[error("invalid config file: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConfigLoadError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::InvalidFilesystem,
            Self::WrongPassword => ErrorCode::WrongPassword,
            Self::TooOldFilesystemFormat(_) => ErrorCode::TooOldFilesystemFormat,
            Self::TooNewFilesystemFormat(_) => ErrorCode::TooNewFilesystemFormat,
            Self::UnsupportedCipher(_) => ErrorCode::WrongCipher,
            Self::InvalidFormat(_) => ErrorCode::InvalidFilesystem,
            Self::Io(_) => ErrorCode::UnspecifiedError,
        }
    }
}
