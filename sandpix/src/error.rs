//! Error kinds surfaced to callers of the sandpix client.

use std::time::Duration;

use crate::protocol::{RemoteError, RemoteErrorKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sandpix was not initialized, you must call initialize() first")]
    NotInitialized,

    #[error("could not start worker: {0}")]
    Startup(String),

    #[error("worker handshake failed: {0}")]
    Handshake(String),

    #[error("worker is unavailable after a restart attempt: {0}")]
    PluginUnavailable(String),

    #[error("could not decode image: {0}")]
    Decode(String),

    #[error("unknown pixel buffer variant tag {0}")]
    UnknownVariant(u8),

    #[error("image would exceed maximum filesize of {max_file_size} bytes")]
    SizeConstraintUnsatisfiable { max_file_size: u64 },

    #[error("worker transport failure: {0}")]
    Transport(String),

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("worker fault: {0}")]
    Remote(String),

    #[error("call queue is full ({0} callers waiting)")]
    QueueFull(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the worker that produced this error can no longer be trusted.
    ///
    /// Data errors leave the worker alone; transport failures and timeouts mean the
    /// next call must go through the restart path.
    pub fn is_worker_fault(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::Decode => Error::Decode(e.message),
            RemoteErrorKind::UnknownVariant(tag) => Error::UnknownVariant(tag),
            RemoteErrorKind::SizeConstraint(max_file_size) => {
                Error::SizeConstraintUnsatisfiable { max_file_size }
            }
            RemoteErrorKind::Internal => Error::Remote(e.message),
        }
    }
}
