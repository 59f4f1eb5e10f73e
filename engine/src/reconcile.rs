use std::collections::HashSet;
use std::time::Duration;

use sync_api::{ChatMessage, MessageId};

/// Fingerprint of the last message this client sent, kept to recognize
/// it arriving back through the sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSent {
    pub text: String,
    pub author: String,
    pub sent_at: i64,
}

/// Outcome of reconciling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Duplicate,
    SelfEcho,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "accepted",
            Verdict::Duplicate => "duplicate",
            Verdict::SelfEcho => "self_echo",
        }
    }
}

/// Per-room dedup and echo suppression. Decides whether an inbound
/// message (push or poll result) is new, a duplicate of something
/// already rendered, or this client's own message echoed back.
///
/// Echo detection is a content-and-timing heuristic: messages carry no
/// origin nonce, so a genuinely different sender posting identical text
/// within the window is wrongly suppressed. Known limitation.
pub struct Reconciler {
    known: HashSet<MessageId>,
    last_sent: Option<LastSent>,
    echo_window_ms: i64,
}

impl Reconciler {
    pub fn new(echo_window: Duration) -> Self {
        Self {
            known: HashSet::new(),
            last_sent: None,
            echo_window_ms: echo_window.as_millis() as i64,
        }
    }

    /// Prime the known-id set from a room loaded out of the store.
    pub fn seed<I: IntoIterator<Item = MessageId>>(&mut self, ids: I) {
        self.known.extend(ids);
    }

    /// Record a message this client just sent: its confirmed id becomes
    /// known and its content becomes the echo fingerprint.
    pub fn note_sent(&mut self, message: &ChatMessage) {
        self.known.insert(message.id);
        self.last_sent = Some(LastSent {
            text: message.text.clone(),
            author: message.author.clone(),
            sent_at: message.sent_at,
        });
    }

    /// Classify an inbound message. On `Accepted` the id is registered,
    /// so delivering the same message again yields `Duplicate`.
    pub fn reconcile(&mut self, incoming: &ChatMessage, now_ms: i64) -> Verdict {
        if self.known.contains(&incoming.id) {
            return Verdict::Duplicate;
        }
        if let Some(last) = &self.last_sent {
            let age = now_ms - incoming.sent_at;
            if age < self.echo_window_ms
                && incoming.text == last.text
                && incoming.author == last.author
            {
                return Verdict::SelfEcho;
            }
        }
        self.known.insert(incoming.id);
        Verdict::Accepted
    }

    pub fn knows(&self, id: MessageId) -> bool {
        self.known.contains(&id)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}
