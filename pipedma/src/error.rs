use thiserror::Error;

/// Errors returned by the DMA engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A fixed-size resource (pool, table, buffer capacity) cannot satisfy the request.
    #[error("{0} exhausted")]
    NoResource(&'static str),
    /// Transient condition; the same call may succeed later.
    #[error("resource temporarily unavailable, try again")]
    TryAgain,
    /// Pushing to a descriptor ring or mapping DMA memory failed.
    #[error("communication failure: {0}")]
    Comm(#[from] TransportError),
    /// Internal bookkeeping disagreed with itself.
    #[error("unexpected state: {0}")]
    Unexpected(&'static str),
    /// No pending operation matches the request.
    #[error("not found")]
    NotFound,
}

/// Errors reported by a [`RingTransport`](crate::ring::RingTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transmit ring has no free descriptor slot.
    #[error("descriptor ring full")]
    RingFull,
    /// The hardware rejected the request.
    #[error("{0}")]
    Failed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
