use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

// ESP-IDF numbering, so host and device report the same codes.
pub const ERR_INVALID_ARG: i32 = 0x102;
pub const ERR_STORAGE_UNAVAILABLE: i32 = 0x1101;
pub const ERR_FAIL: i32 = -1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("persistent storage unavailable (code {code}): {message}")]
    StorageUnavailable { code: i32, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("target hardware address is not configured")]
    TargetNotConfigured,

    #[error("datagram send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("storage write failed (code {code}): {message}")]
    StorageError { code: i32, message: String },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn storage_unavailable(code: i32, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            code,
            message: message.into(),
        }
    }

    pub fn storage_error(code: i32, message: impl Into<String>) -> Self {
        Self::StorageError {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::StorageUnavailable { code, .. } | Self::StorageError { code, .. } => *code,
            Self::InvalidArgument(_) | Self::TargetNotConfigured => ERR_INVALID_ARG,
            Self::SendFailed(err) => err.raw_os_error().unwrap_or(ERR_FAIL),
        }
    }
}
