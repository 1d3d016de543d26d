//! Error kinds shared by the daemon and the control utility
//!
//! Every user-visible failure maps to one of these variants; the binaries
//! translate the variant into the documented process exit code.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Process exit codes, kept stable for scripts that wrap `ledctl`.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const OUT_OF_MEMORY: i32 = 3;
    pub const OUT_OF_RANGE: i32 = 4;
    pub const DATA_ERROR: i32 = 6;
    pub const INVALID_PATH: i32 = 8;
    pub const INVALID_STATE: i32 = 10;
    pub const SIZE_ERROR: i32 = 11;
    pub const FILE_OPEN_ERROR: i32 = 12;
    pub const FILE_READ_ERROR: i32 = 13;
    pub const FILE_WRITE_ERROR: i32 = 14;
    pub const FILE_LOCK_ERROR: i32 = 15;
    pub const LIST_EMPTY: i32 = 21;
    pub const INVALID_FORMAT: i32 = 22;
    pub const NOT_SUPPORTED: i32 = 33;
    pub const CMDLINE_ERROR: i32 = 35;
    pub const NOT_A_PRIVILEGED_USER: i32 = 36;
    pub const INVALID_CONTROLLER: i32 = 37;
    pub const ALREADY_RUNNING: i32 = 38;
    pub const CONFIG_FILE_ERROR: i32 = 39;
    pub const LOG_FILE_ERROR: i32 = 40;
}

/// Failure kinds observed across inventory, transports and the CLI front ends.
#[derive(Debug, Error)]
pub enum Status {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid controller: {0}")]
    InvalidController(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("data error: {0}")]
    DataError(String),

    #[error("size error: expected {expected} bytes, got {actual}")]
    SizeError { expected: usize, actual: usize },

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("pattern out of range: {0}")]
    OutOfRange(String),

    #[error("failed to open {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {}: {source}", path.display())]
    FileLock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device list is empty")]
    ListEmpty,

    #[error("command line error: {0}")]
    Cmdline(String),

    #[error("root privileges are required")]
    NotPrivileged,

    #[error("configuration file error: {0}")]
    ConfigFile(String),

    #[error("log file error: {0}")]
    LogFile(String),

    #[error("daemon is already running")]
    AlreadyRunning,
}

impl Status {
    /// Exit code reported by the binaries for this failure.
    pub fn exit_code(&self) -> i32 {
        use exit_code::*;
        match self {
            Status::InvalidPath(_) => INVALID_PATH,
            Status::InvalidState(_) => INVALID_STATE,
            Status::InvalidController(_) => INVALID_CONTROLLER,
            Status::InvalidFormat(_) => INVALID_FORMAT,
            Status::DataError(_) => DATA_ERROR,
            Status::SizeError { .. } => SIZE_ERROR,
            Status::NotSupported(_) => NOT_SUPPORTED,
            Status::OutOfRange(_) => OUT_OF_RANGE,
            Status::FileOpen { .. } => FILE_OPEN_ERROR,
            Status::FileRead { .. } => FILE_READ_ERROR,
            Status::FileWrite { .. } => FILE_WRITE_ERROR,
            Status::FileLock { .. } => FILE_LOCK_ERROR,
            Status::ListEmpty => LIST_EMPTY,
            Status::Cmdline(_) => CMDLINE_ERROR,
            Status::NotPrivileged => NOT_A_PRIVILEGED_USER,
            Status::ConfigFile(_) => CONFIG_FILE_ERROR,
            Status::LogFile(_) => LOG_FILE_ERROR,
            Status::AlreadyRunning => ALREADY_RUNNING,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Status>;
