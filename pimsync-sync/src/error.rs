//! Error types for pimsync-sync, and the failure classification every
//! error sink relies on.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while synchronizing a target.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server rejected the stored credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cannot connect to proxy: {0}")]
    ProxyConnect(String),

    #[error("proxy authentication required: {0}")]
    ProxyAuth(String),

    #[error("no internet connection: {0}")]
    NoInternet(String),

    /// The server answered with a 5xx status.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Work was abandoned because the owning target was canceled.
    #[error("operation canceled")]
    Cancelled,

    /// A collaborator handed over an item without a required identifier.
    #[error("missing identifier: {0}")]
    MissingIdentifier(String),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (invite registry).
    #[error("invite registry JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Opaque failure raised inside an engine or store implementation.
    #[error("engine error: {0}")]
    Engine(#[source] Box<dyn StdError + Send + Sync>),
}

impl SyncError {
    /// Wrap an arbitrary collaborator error.
    pub fn engine(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        SyncError::Engine(err.into())
    }

    /// Classification of this error, looking through wrapped sources.
    pub fn kind(&self) -> FailureKind {
        classify(self)
    }

    fn direct_kind(&self) -> Option<FailureKind> {
        match self {
            SyncError::Unauthorized(_) => Some(FailureKind::Unauthorized),
            SyncError::ProxyConnect(_) => Some(FailureKind::ProxyConnect),
            SyncError::ProxyAuth(_) => Some(FailureKind::ProxyAuth),
            SyncError::NoInternet(_) => Some(FailureKind::NoInternet),
            SyncError::Server { .. } => Some(FailureKind::ServerError),
            SyncError::Cancelled => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Coarse failure categories an error sink reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Unauthorized,
    ProxyConnect,
    ProxyAuth,
    NoInternet,
    ServerError,
    Cancelled,
    Other,
}

/// Walk `err` and its `source()` chain; the first recognisable cause wins.
pub fn classify(err: &(dyn StdError + 'static)) -> FailureKind {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(sync) = e.downcast_ref::<SyncError>() {
            if let Some(kind) = sync.direct_kind() {
                return kind;
            }
        } else if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::TimedOut => return FailureKind::NoInternet,
                _ => {}
            }
        }
        current = e.source();
    }
    FailureKind::Other
}
