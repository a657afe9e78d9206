pub type Result<T> = std::result::Result<T, Error>;

/// Stable machine-readable failure codes. Messages on [`Error`] are
/// diagnostic only and not part of the API contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    NotFound,
    AlreadyExist,
    PendingDelete,
    InvalidArgument,
    IncompatibleMeta,
    CorruptFile,
    TransactionFailed,
    DbError,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExist(String),
    #[error("pending delete: {0}")]
    PendingDelete(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("incompatible meta: {0}")]
    IncompatibleMeta(String),
    #[error("corrupt file: {0}")]
    CorruptFile(String),
    #[error("meta transaction failed: {0}")]
    TransactionFailed(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NotFound,
            Error::AlreadyExist(_) => StatusCode::AlreadyExist,
            Error::PendingDelete(_) => StatusCode::PendingDelete,
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::IncompatibleMeta(_) => StatusCode::IncompatibleMeta,
            Error::CorruptFile(_) => StatusCode::CorruptFile,
            Error::TransactionFailed(_) => StatusCode::TransactionFailed,
            Error::DbError(_) | Error::Io(_) => StatusCode::DbError,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidArgument(what.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::TransactionFailed(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}
