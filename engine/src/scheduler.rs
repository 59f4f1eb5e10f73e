use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use sync_api::{ChatBackend as _, ChatMessage, MessageStream, Room};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::now_ms;
use crate::reconcile::{Reconciler, Verdict};
use crate::store::RoomStore;

/// How a room currently discovers new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Subscribed,
    Polling,
    Reconnecting,
    Stopped,
}

/// Connection feedback surfaced through the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Reconnecting { attempt: u32, max: u32 },
    Offline,
}

/// Events the UI layer drains from a room's channel.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Message(ChatMessage),
    Status(ConnectionStatus),
}

/// Poll interval that tightens on activity and backs off geometrically
/// while the room is quiet, clamped on both ends.
pub struct AdaptiveInterval {
    current: Duration,
    min: Duration,
    max: Duration,
    growth: f64,
    empty_polls: u32,
}

impl AdaptiveInterval {
    pub fn new(min: Duration, max: Duration, growth: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            growth,
            empty_polls: 0,
        }
    }

    /// New message observed: check eagerly again.
    pub fn on_activity(&mut self) {
        self.current = self.min;
        self.empty_polls = 0;
    }

    /// Nothing new this round: widen the interval.
    pub fn on_empty_poll(&mut self) -> Duration {
        self.empty_polls += 1;
        self.current = self.current.mul_f64(self.growth).min(self.max);
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }
}

pub(crate) enum Ctrl {
    Network(bool),
}

/// Owner of one room's sync task. Dropping the engine's room context
/// (or calling `stop`) cancels every timer the task holds.
pub struct RoomSyncHandle {
    interval: Arc<Mutex<AdaptiveInterval>>,
    mode: Arc<Mutex<SyncMode>>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl RoomSyncHandle {
    pub fn mode(&self) -> SyncMode {
        *self.mode.lock()
    }

    /// Reset the backoff so the next evaluation polls at the minimum.
    pub fn notify_activity(&self) {
        self.interval.lock().on_activity();
    }

    pub fn current_interval(&self) -> Duration {
        self.interval.lock().current()
    }

    pub fn network_change(&self, online: bool) {
        let _ = self.ctrl_tx.send(Ctrl::Network(online));
    }

    /// Cancel the task and all its timers.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) struct SyncContext {
    pub room_code: String,
    pub room: Arc<Mutex<Room>>,
    pub reconciler: Arc<Mutex<Reconciler>>,
    pub store: RoomStore,
    pub config: Config,
    pub event_tx: mpsc::UnboundedSender<RoomEvent>,
}

/// Spawn the per-room sync task. Starts subscribed when the backend
/// offers a push channel, polling otherwise.
pub(crate) fn spawn(ctx: SyncContext) -> RoomSyncHandle {
    let interval = Arc::new(Mutex::new(AdaptiveInterval::new(
        ctx.config.poll_min,
        ctx.config.poll_max,
        ctx.config.poll_growth,
    )));
    let mode = Arc::new(Mutex::new(SyncMode::Polling));
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(
        ctx,
        interval.clone(),
        mode.clone(),
        ctrl_rx,
        cancel.clone(),
    ));
    RoomSyncHandle {
        interval,
        mode,
        ctrl_tx,
        cancel,
        task,
    }
}

enum Next {
    Subscribed(MessageStream),
    Reconnect,
    Poll,
    Stop,
}

async fn run(
    ctx: SyncContext,
    interval: Arc<Mutex<AdaptiveInterval>>,
    mode: Arc<Mutex<SyncMode>>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    cancel: CancellationToken,
) {
    let mut next = initial_mode(&ctx).await;
    loop {
        match next {
            Next::Subscribed(stream) => {
                *mode.lock() = SyncMode::Subscribed;
                info!(code = %ctx.room_code, "sync subscribed");
                next = run_subscribed(&ctx, &interval, stream, &mut ctrl_rx, &cancel).await;
            }
            Next::Reconnect => {
                *mode.lock() = SyncMode::Reconnecting;
                next = run_reconnect(&ctx, &mut ctrl_rx, &cancel).await;
            }
            Next::Poll => {
                *mode.lock() = SyncMode::Polling;
                info!(code = %ctx.room_code, "sync polling");
                next = run_polling(&ctx, &interval, &mut ctrl_rx, &cancel).await;
            }
            Next::Stop => break,
        }
    }
    *mode.lock() = SyncMode::Stopped;
    debug!(code = %ctx.room_code, "sync stopped");
}

async fn initial_mode(ctx: &SyncContext) -> Next {
    if let Some(backend) = ctx.store.backend() {
        match backend.subscribe(&ctx.room_code).await {
            Ok(stream) => return Next::Subscribed(stream),
            Err(e) => debug!(code = %ctx.room_code, error = %e, "no push channel, polling"),
        }
    }
    Next::Poll
}

async fn run_subscribed(
    ctx: &SyncContext,
    interval: &Arc<Mutex<AdaptiveInterval>>,
    mut stream: MessageStream,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
    cancel: &CancellationToken,
) -> Next {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Next::Stop,
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(Ctrl::Network(false)) => {
                    warn!(code = %ctx.room_code, "network down, resubscribing");
                    return Next::Reconnect;
                }
                Some(Ctrl::Network(true)) => {}
                None => return Next::Stop,
            },
            item = timeout(ctx.config.heartbeat_timeout, stream.next()) => match item {
                Ok(Some(message)) => {
                    handle_incoming(ctx, interval, message);
                }
                Ok(None) => {
                    warn!(code = %ctx.room_code, "push channel closed");
                    return Next::Reconnect;
                }
                Err(_) => {
                    // quiet room or dead channel; a probe tells them apart
                    let alive = match ctx.store.backend() {
                        Some(backend) => backend.ping().await.is_ok(),
                        None => false,
                    };
                    if !alive {
                        warn!(code = %ctx.room_code, "heartbeat probe failed");
                        return Next::Reconnect;
                    }
                }
            }
        }
    }
}

async fn run_reconnect(
    ctx: &SyncContext,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
    cancel: &CancellationToken,
) -> Next {
    let max = ctx.config.reconnect_max_attempts;
    let Some(backend) = ctx.store.backend() else {
        return Next::Poll;
    };
    for attempt in 1..=max {
        let _ = ctx
            .event_tx
            .send(RoomEvent::Status(ConnectionStatus::Reconnecting {
                attempt,
                max,
            }));
        let delay = ctx.config.reconnect_base_delay * attempt;
        tokio::select! {
            _ = cancel.cancelled() => return Next::Stop,
            ctrl = ctrl_rx.recv() => match ctrl {
                // network came back: skip the rest of the delay
                Some(Ctrl::Network(true)) => {}
                Some(Ctrl::Network(false)) => continue,
                None => return Next::Stop,
            },
            _ = sleep(delay) => {}
        }
        if backend.ping().await.is_ok() {
            if let Ok(stream) = backend.subscribe(&ctx.room_code).await {
                info!(code = %ctx.room_code, attempt, "resubscribed");
                let _ = ctx.event_tx.send(RoomEvent::Status(ConnectionStatus::Online));
                return Next::Subscribed(stream);
            }
        }
        debug!(code = %ctx.room_code, attempt, "reconnect attempt failed");
    }
    warn!(code = %ctx.room_code, attempts = max, "reconnection exhausted, polling from now on");
    let _ = ctx.event_tx.send(RoomEvent::Status(ConnectionStatus::Offline));
    Next::Poll
}

async fn run_polling(
    ctx: &SyncContext,
    interval: &Arc<Mutex<AdaptiveInterval>>,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
    cancel: &CancellationToken,
) -> Next {
    loop {
        let wait = interval.lock().current();
        tokio::select! {
            _ = cancel.cancelled() => return Next::Stop,
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(Ctrl::Network(_)) => continue,
                None => return Next::Stop,
            },
            _ = sleep(wait) => {}
        }
        let mut accepted = 0usize;
        match ctx.store.load(&ctx.room_code).await {
            Ok(Some(fetched)) => {
                for message in fetched.messages {
                    if handle_incoming(ctx, interval, message) {
                        accepted += 1;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!(code = %ctx.room_code, error = %e, "poll failed"),
        }
        if accepted == 0 {
            let next = interval.lock().on_empty_poll();
            debug!(code = %ctx.room_code, next_ms = next.as_millis() as u64, "empty poll, backing off");
        }
    }
}

/// Reconcile one inbound message; on accept append it to the shared
/// room copy, persist the snapshot, reset the backoff and emit it.
fn handle_incoming(
    ctx: &SyncContext,
    interval: &Arc<Mutex<AdaptiveInterval>>,
    message: ChatMessage,
) -> bool {
    let verdict = ctx.reconciler.lock().reconcile(&message, now_ms());
    match verdict {
        Verdict::Accepted => {
            let snapshot = {
                let mut room = ctx.room.lock();
                room.messages.push(message.clone());
                room.clone()
            };
            if let Err(e) = ctx.store.save_local(&snapshot, now_ms()) {
                warn!(code = %ctx.room_code, error = %e, "persisting accepted message failed");
            }
            interval.lock().on_activity();
            let _ = ctx.event_tx.send(RoomEvent::Message(message));
            true
        }
        verdict => {
            debug!(code = %ctx.room_code, id = message.id, reason = verdict.as_str(), "dropped inbound message");
            false
        }
    }
}
