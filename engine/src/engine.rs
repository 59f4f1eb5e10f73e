use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use sync_api::{ChatBackend, ChatMessage, MessageId, Room, VoteKind, VoteOutcome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::delivery::{DeliveryState, DeliveryTracker};
use crate::error::{EngineError, RestoreFailure, Result, ValidationError};
use crate::reconcile::Reconciler;
use crate::scheduler::{self, RoomEvent, RoomSyncHandle, SyncContext, SyncMode};
use crate::session::{self, Participant, Session};
use crate::store::RoomStore;
use crate::{db, fingerprint, now_ms, rooms, votes};

/// Display name used for anonymous messages.
pub const ANONYMOUS_AUTHOR: &str = "Anónimo";

struct RoomContext {
    room: Arc<Mutex<Room>>,
    reconciler: Arc<Mutex<Reconciler>>,
    user: Participant,
    handle: RoomSyncHandle,
}

/// The engine facade the UI embeds. Owns the fallback store, the
/// per-room sync state table and the delivery tracker; every operation
/// takes the room code explicitly, there are no singletons.
pub struct SyncEngine {
    config: Config,
    store: RoomStore,
    pool: Pool<SqliteConnectionManager>,
    rooms: Mutex<HashMap<String, RoomContext>>,
    delivery: Arc<DeliveryTracker>,
    cleanup_cancel: CancellationToken,
    cleanup_task: tokio::task::JoinHandle<()>,
    device_id: String,
}

impl SyncEngine {
    /// Open the fallback database under `config.data_dir` and start the
    /// delivery-state sweep task.
    pub async fn new(config: Config, backend: Option<Arc<dyn ChatBackend>>) -> Result<Self> {
        config.validate().map_err(EngineError::Storage)?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| EngineError::Storage(e.into()))?;
        let db_path = config.data_dir.join("sync_engine.db");
        db::init_db(&db_path).map_err(EngineError::Storage)?;
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| EngineError::Storage(e.into()))?;

        let device_id = {
            let conn = pool.get().map_err(|e| EngineError::Storage(e.into()))?;
            fingerprint::device_id(&conn, now_ms()).map_err(EngineError::Storage)?
        };

        let delivery = Arc::new(DeliveryTracker::new(config.delivery_ttl));
        let cleanup_cancel = CancellationToken::new();
        let cleanup_task = {
            let delivery = delivery.clone();
            let cancel = cleanup_cancel.clone();
            let every = config.cleanup_every;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let removed = delivery.sweep(Instant::now());
                            if removed > 0 {
                                debug!(removed, "swept delivery entries");
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            store: RoomStore::new(backend, pool.clone()),
            config,
            pool,
            rooms: Mutex::new(HashMap::new()),
            delivery,
            cleanup_cancel,
            cleanup_task,
            device_id,
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| EngineError::Storage(e.into()))
    }

    /// Create a room, persist it, store the session and start syncing.
    pub async fn create_room(
        &self,
        creator: &str,
        question: &str,
        message_limit: u32,
    ) -> Result<(Room, mpsc::UnboundedReceiver<RoomEvent>)> {
        let creator = creator.trim();
        if creator.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let question = question.trim();
        if question.is_empty() {
            return Err(ValidationError::EmptyQuestion.into());
        }
        let now = now_ms();
        let code = rooms::generate_code(&mut rand::thread_rng());
        let room = rooms::new_room(
            code,
            creator,
            question,
            message_limit,
            self.config.default_room_ttl.as_millis() as i64,
            now,
        );
        let room = self
            .store
            .create(&room, now)
            .await
            .map_err(EngineError::Storage)?;
        let user = Participant {
            name: creator.into(),
            is_creator: true,
        };
        self.persist_session(&room.code, &user, now)?;
        info!(code = %room.code, "room created");
        Ok(self.enter_room(room, user))
    }

    /// Join an existing room by its shareable code.
    pub async fn join_room(
        &self,
        code: &str,
        name: &str,
    ) -> Result<(Room, mpsc::UnboundedReceiver<RoomEvent>)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let code = rooms::normalize_code(code).map_err(EngineError::Validation)?;
        let room = self
            .store
            .load(&code)
            .await
            .map_err(EngineError::Storage)?
            .ok_or(ValidationError::RoomNotFound)?;
        let now = now_ms();
        if self.config.enforce_expiry && room.is_expired(now) {
            return Err(ValidationError::RoomExpired.into());
        }
        let user = Participant {
            name: name.into(),
            is_creator: false,
        };
        self.persist_session(&room.code, &user, now)?;
        info!(code = %room.code, "room joined");
        Ok(self.enter_room(room, user))
    }

    /// Restore the persisted (room, user) pair. Fails closed: any
    /// problem clears the session and reports the reason.
    pub async fn restore_session(&self) -> Result<(Room, mpsc::UnboundedReceiver<RoomEvent>)> {
        let now = now_ms();
        let session = {
            let conn = self.conn()?;
            session::load_session(&conn, now, self.config.session_ttl.as_millis() as i64)
                .map_err(EngineError::SessionInvalid)?
        };
        let room = match self.store.load(&session.room_code).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                self.drop_session()?;
                return Err(RestoreFailure::RoomNotFound.into());
            }
            Err(e) => {
                debug!(error = %e, "restore could not load room");
                self.drop_session()?;
                return Err(RestoreFailure::RestoreError.into());
            }
        };
        if self.config.enforce_expiry && room.is_expired(now) {
            self.drop_session()?;
            return Err(RestoreFailure::RoomExpired.into());
        }
        self.persist_session(&room.code, &session.user, now)?;
        info!(code = %room.code, "session restored");
        Ok(self.enter_room(room, session.user))
    }

    /// Validate and send a message: optimistic local append, then
    /// backend confirmation, with the fallback store absorbing outages.
    pub async fn send_message(
        &self,
        code: &str,
        text: &str,
        is_anonymous: bool,
    ) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if text.chars().count() > self.config.message_max_len {
            return Err(ValidationError::MessageTooLong.into());
        }

        let now = now_ms();
        let temp_id: MessageId = now;
        // validation against the local copy happens before any remote
        // call; a full room never reaches the backend
        let (room_arc, reconciler, message) = {
            let map = self.rooms.lock();
            let ctx = map.get(code).ok_or(ValidationError::RoomNotFound)?;
            let mut room = ctx.room.lock();
            if room.at_message_limit() {
                return Err(ValidationError::MessageLimitReached.into());
            }
            let author = if is_anonymous {
                ANONYMOUS_AUTHOR.to_string()
            } else {
                ctx.user.name.clone()
            };
            let message = ChatMessage {
                id: temp_id,
                text: text.into(),
                is_anonymous,
                author,
                sent_at: now,
                votes: Default::default(),
            };
            room.messages.push(message.clone());
            // record the echo fingerprint before the backend can fan the
            // stored message back at the sync task
            ctx.reconciler.lock().note_sent(&message);
            ctx.handle.notify_activity();
            (ctx.room.clone(), ctx.reconciler.clone(), message)
        };
        self.delivery.set_state(temp_id, DeliveryState::Sending);

        let backend = self.store.backend().cloned();
        let confirmed = match backend {
            Some(backend) => match backend.send_message(code, &message).await {
                Ok(confirmed) => Some(confirmed),
                Err(e) => {
                    warn!(code = %code, error = %e, "remote send failed, keeping message locally");
                    None
                }
            },
            None => None,
        };

        // the room may have been left while the send was in flight
        if !self.rooms.lock().contains_key(code) {
            debug!(code = %code, "room left during send");
            if let Some(confirmed) = &confirmed {
                self.delivery.promote(temp_id, confirmed.id);
                self.delivery.set_state(confirmed.id, DeliveryState::Sent);
            }
            return confirmed.ok_or(ValidationError::RoomNotFound.into());
        }

        let final_message = match confirmed {
            Some(confirmed) => {
                let snapshot = {
                    let mut room = room_arc.lock();
                    if let Some(slot) = room.messages.iter_mut().find(|m| m.id == temp_id) {
                        *slot = confirmed.clone();
                    }
                    room.clone()
                };
                reconciler.lock().note_sent(&confirmed);
                self.delivery.promote(temp_id, confirmed.id);
                self.delivery.set_state(confirmed.id, DeliveryState::Sent);
                match self.store.save(&snapshot, now_ms()).await {
                    Ok(()) => self
                        .delivery
                        .set_state(confirmed.id, DeliveryState::Delivered),
                    Err(e) => debug!(code = %code, error = %e, "snapshot save failed"),
                }
                confirmed
            }
            None => {
                // offline path: the provisional id stays the known one
                let snapshot = room_arc.lock().clone();
                match self.store.save(&snapshot, now_ms()).await {
                    Ok(()) => self.delivery.set_state(temp_id, DeliveryState::Sent),
                    Err(e) => {
                        self.delivery.set_state(temp_id, DeliveryState::Error);
                        return Err(EngineError::Storage(e));
                    }
                }
                message
            }
        };
        Ok(final_message)
    }

    /// Toggle the local user's vote on a message. The local reflection
    /// is applied first; the remote adjustment is atomic server-side and
    /// is not rolled back locally if it fails.
    pub async fn vote(
        &self,
        code: &str,
        message_id: MessageId,
        kind: VoteKind,
    ) -> Result<VoteOutcome> {
        let current = {
            let conn = self.conn()?;
            votes::get_vote(&conn, code, message_id).map_err(EngineError::Storage)?
        };
        let (outcome, snapshot) = {
            let map = self.rooms.lock();
            let ctx = map.get(code).ok_or(ValidationError::RoomNotFound)?;
            let mut room = ctx.room.lock();
            let message = room
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or(ValidationError::MessageNotFound)?;
            let outcome = votes::apply_vote(&mut message.votes, kind, current);
            (outcome, room.clone())
        };
        {
            let conn = self.conn()?;
            votes::set_vote(&conn, code, message_id, outcome.new_vote)
                .map_err(EngineError::Storage)?;
        }
        // the remote counters move only through the atomic vote call; a
        // full room upsert here would double-apply the adjustment
        if let Err(e) = self.store.save_local(&snapshot, now_ms()) {
            debug!(code = %code, error = %e, "vote snapshot save failed");
        }
        if let Some(backend) = self.store.backend() {
            if let Err(e) = backend.vote_message(code, message_id, kind, current).await {
                warn!(code = %code, message_id, error = %e, "remote vote failed, local count kept");
            }
        }
        Ok(outcome)
    }

    /// Leave a room: cancel its timers, release the subscription and
    /// clear the session. Idempotent.
    pub async fn leave_room(&self, code: &str) -> Result<()> {
        let ctx = self.rooms.lock().remove(code);
        if let Some(ctx) = ctx {
            ctx.handle.stop();
            if let Some(backend) = self.store.backend() {
                if let Err(e) = backend.unsubscribe(code).await {
                    debug!(code = %code, error = %e, "unsubscribe failed");
                }
            }
            info!(code = %code, "room left");
        }
        self.drop_session()
    }

    /// Forward a connectivity signal to every active room.
    pub fn handle_network_change(&self, is_online: bool) {
        let map = self.rooms.lock();
        for ctx in map.values() {
            ctx.handle.network_change(is_online);
        }
    }

    /// Reset the poll backoff for a room.
    pub fn notify_room_activity(&self, code: &str) {
        if let Some(ctx) = self.rooms.lock().get(code) {
            ctx.handle.notify_activity();
        }
    }

    /// Current snapshot of an entered room.
    pub fn room_snapshot(&self, code: &str) -> Option<Room> {
        self.rooms.lock().get(code).map(|ctx| ctx.room.lock().clone())
    }

    pub fn sync_mode(&self, code: &str) -> Option<SyncMode> {
        self.rooms.lock().get(code).map(|ctx| ctx.handle.mode())
    }

    pub fn delivery_state(&self, id: MessageId) -> Option<DeliveryState> {
        self.delivery.get(id)
    }

    pub fn user_vote(&self, code: &str, message_id: MessageId) -> Result<Option<VoteKind>> {
        let conn = self.conn()?;
        votes::get_vote(&conn, code, message_id).map_err(EngineError::Storage)
    }

    /// Soft per-device identifier scoping votes.
    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(&self.device_id)
    }

    /// Forget the stored votes and session.
    pub fn clear_data(&self) -> Result<()> {
        let conn = self.conn()?;
        votes::clear_votes(&conn).map_err(EngineError::Storage)?;
        session::clear_session(&conn).map_err(EngineError::Storage)?;
        Ok(())
    }

    /// Stop every room task and the sweep task.
    pub async fn shutdown(&self) {
        let contexts: Vec<RoomContext> = {
            let mut map = self.rooms.lock();
            map.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in &contexts {
            ctx.handle.stop();
        }
        self.cleanup_cancel.cancel();
        debug!("engine shut down");
    }

    pub fn cleanup_running(&self) -> bool {
        !self.cleanup_task.is_finished()
    }

    fn persist_session(&self, code: &str, user: &Participant, now: i64) -> Result<()> {
        let conn = self.conn()?;
        session::save_session(
            &conn,
            &Session {
                room_code: code.into(),
                user: user.clone(),
                saved_at: now,
            },
        )
        .map_err(EngineError::Storage)
    }

    fn drop_session(&self) -> Result<()> {
        let conn = self.conn()?;
        session::clear_session(&conn).map_err(EngineError::Storage)
    }

    fn enter_room(
        &self,
        room: Room,
        user: Participant,
    ) -> (Room, mpsc::UnboundedReceiver<RoomEvent>) {
        let mut reconciler = Reconciler::new(self.config.echo_window);
        reconciler.seed(room.messages.iter().map(|m| m.id));
        let reconciler = Arc::new(Mutex::new(reconciler));
        let room_arc = Arc::new(Mutex::new(room.clone()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = scheduler::spawn(SyncContext {
            room_code: room.code.clone(),
            room: room_arc.clone(),
            reconciler: reconciler.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            event_tx,
        });
        let ctx = RoomContext {
            room: room_arc,
            reconciler,
            user,
            handle,
        };
        if let Some(old) = self.rooms.lock().insert(room.code.clone(), ctx) {
            old.handle.stop();
        }
        (room, event_rx)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cleanup_cancel.cancel();
        let map = self.rooms.lock();
        for ctx in map.values() {
            ctx.handle.stop();
        }
    }
}
