//! **concord-coordinator** – ACK-based tab leader-claim protocol.
//!
//! Exactly one tab among a session's open tabs should own primary
//! responsibilities (writing to storage, draining the operation queue,
//! talking to a backing connection). This crate elects that tab by having
//! each participant claim leadership over a [`Transport`](transport::Transport)
//! and waiting for the current authority to grant or reject the claim —
//! there is no log replication and no quorum, just a single-round
//! request/response exchange, because tabs are cooperating processes in one
//! browser/session, not an adversarial distributed cluster.
//!
//! Every message is stamped with a `concord-clock` Lamport timestamp and
//! signed with `concord-message-security` before it goes out, and verified,
//! freshness-checked and replay-checked on the way back in.

pub mod error;
pub mod message;
pub mod node;
pub mod transport;

pub use error::{CoordError, CoordResult};
pub use message::{ClaimId, CoordMessage, CoordMessageType};
pub use node::{ClaimOutcome, CoordinatorConfig, TabCoordinator, TabState};
pub use transport::{BroadcastTransport, SledTransport, Transport};
