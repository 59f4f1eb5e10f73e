use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{ChatBackend, ChatMessage, MessageId, MessageStream, Room, VoteKind, VoteOutcome};

/// In-memory reference backend. Used by engine tests and as the model
/// implementation of the contract: rooms live under a single mutex, the
/// push channel is a broadcast per room, and failures are scripted
/// through `set_online` / `set_push_available`.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<ChatMessage>>>,
    online: AtomicBool,
    push_available: AtomicBool,
    send_calls: AtomicU64,
    vote_calls: AtomicU64,
}

struct Inner {
    rooms: HashMap<String, Room>,
    next_id: MessageId,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                rooms: HashMap::new(),
                next_id: 1,
            }),
            channels: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            push_available: AtomicBool::new(true),
            send_calls: AtomicU64::new(0),
            vote_calls: AtomicU64::new(0),
        }
    }

    /// Toggle simulated reachability. While offline every call fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Toggle availability of the realtime channel.
    pub fn set_push_available(&self, available: bool) {
        self.push_available.store(available, Ordering::SeqCst);
    }

    /// Number of `send_message` calls that reached the backend.
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Number of `vote_message` calls that reached the backend.
    pub fn vote_calls(&self) -> u64 {
        self.vote_calls.load(Ordering::SeqCst)
    }

    /// Current stored form of a room.
    pub fn room(&self, code: &str) -> Option<Room> {
        self.inner.lock().rooms.get(code).cloned()
    }

    /// Inject a message as if another client had stored it, assigning a
    /// confirmed id and fanning it out over the push channel.
    pub fn push_external(&self, room_code: &str, mut message: ChatMessage) -> ChatMessage {
        {
            let mut inner = self.inner.lock();
            message.id = inner.next_id;
            inner.next_id += 1;
            if let Some(room) = inner.rooms.get_mut(room_code) {
                room.messages.push(message.clone());
            }
        }
        self.fan_out(room_code, &message);
        message
    }

    /// Drop the push channel for a room, ending all subscriber streams.
    pub fn drop_push(&self, room_code: &str) {
        self.channels.lock().remove(room_code);
    }

    fn guard_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("backend_offline"))
        }
    }

    fn fan_out(&self, room_code: &str, message: &ChatMessage) {
        if let Some(tx) = self.channels.lock().get(room_code) {
            let _ = tx.send(message.clone());
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn create_room(&self, room: &Room) -> Result<Room> {
        self.guard_online()?;
        let mut inner = self.inner.lock();
        if inner.rooms.contains_key(&room.code) {
            anyhow::bail!("duplicate_room");
        }
        inner.rooms.insert(room.code.clone(), room.clone());
        Ok(room.clone())
    }

    async fn fetch_room(&self, code: &str) -> Result<Option<Room>> {
        self.guard_online()?;
        Ok(self.inner.lock().rooms.get(code).cloned())
    }

    async fn save_room(&self, room: &Room) -> Result<()> {
        self.guard_online()?;
        self.inner.lock().rooms.insert(room.code.clone(), room.clone());
        Ok(())
    }

    async fn send_message(&self, room_code: &str, message: &ChatMessage) -> Result<ChatMessage> {
        self.guard_online()?;
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let stored = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let room = inner
                .rooms
                .get_mut(room_code)
                .ok_or_else(|| anyhow!("room_not_found"))?;
            let stored = ChatMessage {
                id,
                votes: Default::default(),
                ..message.clone()
            };
            room.messages.push(stored.clone());
            stored
        };
        self.fan_out(room_code, &stored);
        Ok(stored)
    }

    async fn vote_message(
        &self,
        room_code: &str,
        message_id: MessageId,
        kind: VoteKind,
        current: Option<VoteKind>,
    ) -> Result<VoteOutcome> {
        self.guard_online()?;
        self.vote_calls.fetch_add(1, Ordering::SeqCst);
        // Counter adjustment happens under the state lock, which is what
        // a relational backend provides via atomic increments.
        let mut inner = self.inner.lock();
        let room = inner
            .rooms
            .get_mut(room_code)
            .ok_or_else(|| anyhow!("room_not_found"))?;
        let message = room
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow!("message_not_found"))?;
        fn counter(votes: &mut crate::VoteCounts, kind: VoteKind) -> &mut u32 {
            match kind {
                VoteKind::Like => &mut votes.likes,
                VoteKind::Dislike => &mut votes.dislikes,
            }
        }
        fn bump(count: &mut u32, delta: i64) {
            *count = (*count as i64 + delta).max(0) as u32;
        }
        let outcome = match current {
            Some(prev) if prev == kind => {
                bump(counter(&mut message.votes, kind), -1);
                VoteOutcome {
                    removed: true,
                    new_vote: None,
                }
            }
            Some(prev) => {
                bump(counter(&mut message.votes, prev), -1);
                bump(counter(&mut message.votes, kind), 1);
                VoteOutcome {
                    removed: false,
                    new_vote: Some(kind),
                }
            }
            None => {
                bump(counter(&mut message.votes, kind), 1);
                VoteOutcome {
                    removed: false,
                    new_vote: Some(kind),
                }
            }
        };
        Ok(outcome)
    }

    async fn subscribe(&self, room_code: &str) -> Result<MessageStream> {
        self.guard_online()?;
        if !self.push_available.load(Ordering::SeqCst) {
            anyhow::bail!("push_unavailable");
        }
        let rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(room_code.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let stream = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, _room_code: &str) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.guard_online()
    }
}
