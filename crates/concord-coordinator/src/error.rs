//! Error types for tab coordination.

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors surfaced by the coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordError {
    /// The transport reported an error while sending or receiving.
    #[error("transport error: {0}")]
    Transport(String),

    /// A leader claim was rejected by the current authority.
    #[error("claim rejected: {reason} (current leader: {current_leader:?})")]
    ClaimRejected {
        /// Why the claim was rejected.
        reason: String,
        /// The tab currently holding leadership, if known.
        current_leader: Option<String>,
    },

    /// A leader claim was not acknowledged before its timeout.
    #[error("claim for tab {0} timed out waiting for a response")]
    ClaimTimeout(String),

    /// The transport closed before a pending claim was acknowledged.
    #[error("transport closed while claim for tab {0} was pending")]
    TransportClosedDuringClaim(String),

    /// An inbound message failed verification, freshness, or replay checks.
    #[error("inbound message rejected: {0}")]
    VerificationFailed(String),

    /// Reconnection was attempted the configured number of times and gave up.
    #[error("reconnection exhausted after {0} attempts")]
    ReconnectExhausted(u32),
}
