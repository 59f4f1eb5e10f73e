use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod memory;

pub use memory::MemoryBackend;

/// Identifier of a message. Assigned by the backend once confirmed;
/// clients use a provisional id (current unix millis) until then.
pub type MessageId = i64;

/// Vote counters carried on every message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteCounts {
    pub likes: u32,
    pub dislikes: u32,
}

/// A single chat message. Immutable after creation except for the counters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub is_anonymous: bool,
    pub author: String,
    /// Unix milliseconds.
    pub sent_at: i64,
    #[serde(default)]
    pub votes: VoteCounts,
}

/// A bounded chat room identified by a shareable code.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Room {
    pub code: String,
    pub creator: String,
    pub question: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
    pub message_limit: u32,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Room {
    /// Whether the room's expiry horizon has passed.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Whether the room already holds its maximum number of messages.
    pub fn at_message_limit(&self) -> bool {
        self.messages.len() as u32 >= self.message_limit
    }
}

/// Direction of a vote.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Like,
    Dislike,
}

/// Result of a vote toggle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    pub removed: bool,
    pub new_vote: Option<VoteKind>,
}

/// Stream of messages pushed by the backend's realtime channel.
pub type MessageStream = BoxStream<'static, ChatMessage>;

/// Abstract remote store a sync engine talks to. Implementations catch
/// their own transport details; every method may fail transiently and
/// callers are expected to degrade to local persistence.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Persist a freshly created room. Returns the stored record.
    async fn create_room(&self, room: &Room) -> Result<Room>;

    /// Fetch a room with its ordered messages, or `None` if unknown.
    async fn fetch_room(&self, code: &str) -> Result<Option<Room>>;

    /// Upsert a full room snapshot.
    async fn save_room(&self, room: &Room) -> Result<()>;

    /// Store a message. The backend assigns the final id and zeroes the
    /// counters; the returned record is the confirmed form.
    async fn send_message(&self, room_code: &str, message: &ChatMessage) -> Result<ChatMessage>;

    /// Adjust vote counters for a message as a single server-side
    /// operation. Concurrent voters must not clobber each other.
    async fn vote_message(
        &self,
        room_code: &str,
        message_id: MessageId,
        kind: VoteKind,
        current: Option<VoteKind>,
    ) -> Result<VoteOutcome>;

    /// Open the realtime push channel for a room. An error means no such
    /// channel is available and the caller should poll instead.
    async fn subscribe(&self, room_code: &str) -> Result<MessageStream>;

    /// Release the push channel for a room.
    async fn unsubscribe(&self, room_code: &str) -> Result<()>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;
}
