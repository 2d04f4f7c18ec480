use std::fmt::{Display, Formatter};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Status taxonomy shared by every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InProgress,
    InvalidParam,
    Backend,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported backend type: {0}")]
    UnsupportedBackend(String),
    #[error("unsupported memory pairing: local={local}, remote={remote}")]
    UnsupportedPairing { local: String, remote: String },
    #[error("descriptor count mismatch: local={local}, remote={remote}")]
    DescCountMismatch { local: usize, remote: usize },
    #[error("descriptor length mismatch at {index}: local={local}, remote={remote}")]
    DescLenMismatch {
        index: usize,
        local: u64,
        remote: u64,
    },
    #[error("memory is not registered: addr={addr:#x}, len={len}")]
    MemoryNotRegistered { addr: u64, len: u64 },
    #[error("unknown metadata handle: {0}")]
    UnknownMetadata(u64),
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("unknown peer agent: {0}")]
    UnknownPeer(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("transfer timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
    #[error("teardown failed: {0}")]
    Teardown(TeardownErrors),
}

impl TransferError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Caller misuse surfaces as `InvalidParam`; everything else is a backend failure.
    pub fn status(&self) -> Status {
        match self {
            TransferError::InvalidArgument(_)
            | TransferError::UnsupportedBackend(_)
            | TransferError::UnsupportedPairing { .. }
            | TransferError::DescCountMismatch { .. }
            | TransferError::DescLenMismatch { .. } => Status::InvalidParam,
            TransferError::MemoryNotRegistered { .. }
            | TransferError::UnknownMetadata(_)
            | TransferError::MalformedMetadata(_)
            | TransferError::UnknownPeer(_)
            | TransferError::UnsupportedOperation(_)
            | TransferError::Timeout(_)
            | TransferError::Backend(_)
            | TransferError::Unimplemented(_)
            | TransferError::Teardown(_) => Status::Backend,
        }
    }
}

/// Every failure collected while releasing a group of resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownErrors(pub Vec<TransferError>);

impl TeardownErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Display for TeardownErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s)", self.0.len())?;
        for (idx, error) in self.0.iter().enumerate() {
            write!(f, "; [{idx}] {error}")?;
        }
        Ok(())
    }
}
