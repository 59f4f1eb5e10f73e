pub mod config;
pub mod db;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod reconcile;
pub mod rooms;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod votes;

pub use config::Config;
pub use delivery::DeliveryState;
pub use engine::{SyncEngine, ANONYMOUS_AUTHOR};
pub use error::{EngineError, RestoreFailure, ValidationError};
pub use reconcile::{Reconciler, Verdict};
pub use scheduler::{ConnectionStatus, RoomEvent, SyncMode};
pub use session::{Participant, Session};
pub use sync_api::{ChatBackend, ChatMessage, MessageId, Room, VoteCounts, VoteKind, VoteOutcome};

use time::OffsetDateTime;

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
