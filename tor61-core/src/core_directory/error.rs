//! Directory error types

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("unexpected registry response: {0}")]
    Protocol(String),

    #[error("not registered")]
    NotRegistered,
}
