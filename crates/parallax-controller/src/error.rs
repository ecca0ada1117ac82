use parallax_proto::{ErrorKind, WireError};
use parallax_store::StoreError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote: {0}")]
    Remote(#[from] WireError),

    #[error("internal: {0}")]
    Internal(String),
}

impl ControllerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Unavailable(_) | Self::Transport(_) => ErrorKind::Unavailable,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Remote(err) => err.kind,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
