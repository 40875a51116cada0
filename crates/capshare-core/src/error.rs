use thiserror::Error;

use crate::handshake::HandshakeError;

/// Failures surfaced by sessions and transfers.
///
/// `Cancelled` is a user decision rather than a failure; callers usually
/// render it differently.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("no connected peer")]
    NoPeer,
    #[error("a transfer is already in progress")]
    Busy,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] archive::ArchiveError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

impl TransferError {
    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
