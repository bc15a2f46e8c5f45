//! Router error types

use thiserror::Error;

use super::transport_manager::ConnId;
use crate::core_cell::CellError;
use crate::core_directory::DirectoryError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnId),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("peer rejected {0}")]
    Rejected(&'static str),

    #[error("no routers available")]
    NoRouters,

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("failed to open proxy listener: {0}")]
    ProxyListener(String),

    #[error("entry circuit could not be rebuilt after {0} attempts")]
    RebuildExhausted(u32),

    #[error(transparent)]
    Cell(#[from] CellError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("router is shutting down")]
    Shutdown,
}

impl RouterError {
    /// Errors that warrant throwing the node away and starting a fresh one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RouterError::Directory(DirectoryError::Registration(_))
                | RouterError::ProxyListener(_)
                | RouterError::RebuildExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RouterError::ProxyListener("in use".into()).is_fatal());
        assert!(RouterError::RebuildExhausted(3).is_fatal());
        assert!(RouterError::Directory(DirectoryError::Registration("refused".into())).is_fatal());

        assert!(!RouterError::Timeout("OPENED").is_fatal());
        assert!(!RouterError::NoRouters.is_fatal());
        assert!(!RouterError::Directory(DirectoryError::Protocol("garbage".into())).is_fatal());
    }
}
