//! Error types for quarantinefs

use libc::c_int;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the overlay engine and its lifecycle
#[derive(Error, Debug)]
pub enum Error {
    /// Node missing, or a passthrough node whose backing path vanished
    #[error("node not found")]
    NotFound,

    /// Read attempted on a file that is still awaiting inspection
    #[error("permission denied: {0} is awaiting inspection")]
    PermissionDenied(String),

    /// Allocation would collide with a live inode in the other range
    #[error("inode space exhausted")]
    InodeSpaceExhausted,

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    /// Write or truncate past the in-memory size limit
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Failure reported by the backing filesystem
    #[error("backing I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle misuse (serve before mount, close before mount, ...)
    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("unmount failed: {0}")]
    Unmount(String),

    /// Several independent failures collected during teardown
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<Error>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno reported to the kernel for this error
    pub fn errno(&self) -> c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::InodeSpaceExhausted => libc::ENOSPC,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Collapse a list of teardown errors into a single result
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}
