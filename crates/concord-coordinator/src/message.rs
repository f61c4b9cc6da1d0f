//! Wire messages for the tab leader-claim protocol.
//!
//! Every message is carried inside a `concord_message_security::SignedMessage`
//! — the Lamport stamp and HMAC signature that frame it live there, not
//! here. This module only defines the payload shapes and how to tell them
//! apart.

use concord_types::TabId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates a `ClaimPrimary` with its eventual `LeaderGranted`/`ClaimRejected`.
pub type ClaimId = Uuid;

/// The coordination protocol's payload, carried as the `payload` field of a
/// signed [`concord_message_security::Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordMessage {
    /// Announces a new tab joining the session.
    Register {
        /// The joining tab.
        tab_id: TabId,
    },
    /// Periodic liveness signal.
    Heartbeat {
        /// The tab emitting the heartbeat.
        tab_id: TabId,
    },
    /// Requests leadership.
    ClaimPrimary {
        /// The claiming tab.
        tab_id: TabId,
        /// Correlates the eventual response.
        claim_id: ClaimId,
    },
    /// Grants leadership to the claimant.
    LeaderGranted {
        /// The claim this responds to.
        claim_id: ClaimId,
        /// The tab granted leadership.
        leader_id: TabId,
    },
    /// Rejects a leadership claim.
    ClaimRejected {
        /// The claim this responds to.
        claim_id: ClaimId,
        /// Why the claim was rejected.
        reason: String,
        /// The tab currently holding leadership, if any.
        current_leader: Option<TabId>,
    },
    /// Best-effort notice that the sender is giving up leadership.
    ReleasePrimary {
        /// The tab releasing leadership.
        tab_id: TabId,
    },
}

/// Discriminant for [`CoordMessage`], useful for routing/logging without
/// matching the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordMessageType {
    /// See [`CoordMessage::Register`].
    Register,
    /// See [`CoordMessage::Heartbeat`].
    Heartbeat,
    /// See [`CoordMessage::ClaimPrimary`].
    ClaimPrimary,
    /// See [`CoordMessage::LeaderGranted`].
    LeaderGranted,
    /// See [`CoordMessage::ClaimRejected`].
    ClaimRejected,
    /// See [`CoordMessage::ReleasePrimary`].
    ReleasePrimary,
}

impl CoordMessage {
    /// This message's discriminant.
    pub fn message_type(&self) -> CoordMessageType {
        match self {
            CoordMessage::Register { .. } => CoordMessageType::Register,
            CoordMessage::Heartbeat { .. } => CoordMessageType::Heartbeat,
            CoordMessage::ClaimPrimary { .. } => CoordMessageType::ClaimPrimary,
            CoordMessage::LeaderGranted { .. } => CoordMessageType::LeaderGranted,
            CoordMessage::ClaimRejected { .. } => CoordMessageType::ClaimRejected,
            CoordMessage::ReleasePrimary { .. } => CoordMessageType::ReleasePrimary,
        }
    }
}
