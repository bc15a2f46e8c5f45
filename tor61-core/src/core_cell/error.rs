//! Cell codec errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("cell frame must be {expected} bytes, got {actual}")]
    WrongFrameSize { expected: usize, actual: usize },

    #[error("unknown cell type 0x{0:02x}")]
    UnknownCellType(u8),

    #[error("unknown relay command 0x{0:02x}")]
    UnknownRelayCommand(u8),

    #[error("malformed cell: {0}")]
    Format(String),

    #[error("relay body of {len} bytes exceeds capacity of {capacity} bytes")]
    Capacity { len: usize, capacity: usize },

    #[error("invalid host `{0}`, expected host:port")]
    InvalidHost(String),
}

impl CellError {
    /// True for errors raised while decoding bytes received from a peer.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            CellError::WrongFrameSize { .. }
                | CellError::UnknownCellType(_)
                | CellError::UnknownRelayCommand(_)
                | CellError::Format(_)
        )
    }
}
