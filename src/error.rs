//! Error types for broker operations.

use thiserror::Error;

use crate::persistence::StoreError;

/// Errors surfaced by broker core operations.
///
/// Delivery failures and queue overflow are absorbed internally (the message
/// is queued or dead-lettered and a `message:failed` event is emitted), so
/// they have no variant here. Idempotent deletes report absence as `false`
/// rather than an error.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Topic or consumer-group name collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unknown topic, subscriber, consumer group, or dead-letter id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Topic name outside the allowed character set.
    #[error("invalid topic name: {0:?}")]
    InvalidName(String),

    /// Subscription filter failed validation (e.g. a malformed pattern).
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A request awaited past its deadline.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// A pending request was explicitly cancelled by the requester.
    #[error("request cancelled")]
    Cancelled,

    /// The persistence collaborator failed; the originating operation was
    /// aborted before committing in-memory state.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
