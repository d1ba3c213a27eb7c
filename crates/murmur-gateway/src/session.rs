use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::close_code;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_db::Database;
use murmur_db::models::{InsertMessage, NewMessage, ReactionChange, ReceiptKind, StoredMessage};
use murmur_db::time;
use murmur_types::events::{ClientEvent, PresenceKind, ReactionAction, ServerEvent};
use murmur_types::models::Attachment;

use crate::error::GatewayError;
use crate::registry::{ConnSender, Outbound, Registry};

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_EMOJI_CHARS: usize = 32;

/// Attempts for writes that are safe to repeat (receipts, reactions).
const STORE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Shared context of the live core: store, registry and store call bounds.
#[derive(Clone)]
pub struct Gateway {
    db: Arc<Database>,
    registry: Registry,
    store_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { stored: StoredMessage, content: String },
    /// Nothing left after trimming.
    Empty,
    TooLong,
    InvalidParent,
    /// The sender is muted in the room.
    Muted,
}

impl Gateway {
    pub fn new(db: Arc<Database>, registry: Registry, store_timeout: Duration) -> Self {
        Self {
            db,
            registry,
            store_timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Runs a store call on the blocking pool, bounded by the store timeout.
    pub async fn store<F, T>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => Err(GatewayError::Timeout(self.store_timeout)),
        }
    }

    /// Like `store`, but a call that outlives the timeout is awaited rather
    /// than abandoned, so the caller always learns whether the write committed.
    async fn store_awaited<F, T>(&self, what: &str, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let mut task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(self.store_timeout, &mut task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => {
                warn!("{} exceeded {:?}, waiting for it to finish", what, self.store_timeout);
                Ok(task.await??)
            }
        }
    }

    async fn store_retrying<F, T>(&self, what: &str, f: F) -> Result<T, GatewayError>
    where
        F: Fn(&Database) -> anyhow::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt = 1;
        loop {
            match self.store(f.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < STORE_ATTEMPTS => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, STORE_ATTEMPTS, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists a message, then broadcasts it to the room. The broadcast
    /// carries the id and timestamp the store assigned.
    pub async fn publish_message(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        content: &str,
        parent_id: Option<Uuid>,
        attachment: Option<Attachment>,
        mentions: Vec<Uuid>,
    ) -> Result<PublishOutcome, GatewayError> {
        let content = content.trim().to_string();
        if content.is_empty() && attachment.is_none() {
            return Ok(PublishOutcome::Empty);
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Ok(PublishOutcome::TooLong);
        }

        let text = content.clone();
        let inserted = self
            .store_awaited("message insert", move |db| {
                db.insert_message(&NewMessage {
                    room_id,
                    user_id,
                    content: &text,
                    parent_id,
                    attachment: attachment.as_ref(),
                    mentions: &mentions,
                })
            })
            .await?;

        let stored = match inserted {
            InsertMessage::Inserted(stored) => stored,
            InsertMessage::InvalidParent => return Ok(PublishOutcome::InvalidParent),
            InsertMessage::Muted => return Ok(PublishOutcome::Muted),
        };

        let event = ServerEvent::Message {
            id: stored.id,
            room_id,
            user_id,
            content: content.clone(),
            parent_id,
            mentions: stored.mentions.clone(),
            created_at: stored.created_at,
        };
        let delivered = self.registry.broadcast(room_id, &event).await;
        debug!("Message {} in room {} delivered to {} connections", stored.id, room_id, delivered);

        Ok(PublishOutcome::Published { stored, content })
    }

    /// Idempotent reaction write, then a broadcast whether or not a row
    /// changed. Nothing is broadcast for messages outside the room.
    pub async fn react(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        emoji: &str,
        action: ReactionAction,
    ) -> Result<ReactionChange, GatewayError> {
        let key = emoji.to_string();
        let change = self
            .store_retrying("reaction write", move |db| match action {
                ReactionAction::Add => db.add_reaction(room_id, message_id, user_id, &key),
                ReactionAction::Remove => db.remove_reaction(room_id, message_id, user_id, &key),
            })
            .await?;

        if change != ReactionChange::NoSuchMessage {
            self.registry
                .broadcast(
                    room_id,
                    &ServerEvent::Reaction {
                        message_id,
                        emoji: emoji.to_string(),
                        user_id,
                        action,
                    },
                )
                .await;
        }
        Ok(change)
    }

    /// Advance-only receipt upsert. Receipts are never broadcast.
    pub async fn record_receipts(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        kind: ReceiptKind,
    ) -> Result<usize, GatewayError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let at = time::now();
        self.store_retrying("receipt write", move |db| {
            db.record_receipts(room_id, user_id, &message_ids, kind, at)
        })
        .await
    }
}

/// Trimmed emoji, or `None` when empty or longer than `MAX_EMOJI_CHARS`.
pub fn normalize_emoji(emoji: &str) -> Option<&str> {
    let emoji = emoji.trim();
    (!emoji.is_empty() && emoji.chars().count() <= MAX_EMOJI_CHARS).then_some(emoji)
}

/// Lifecycle of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorized,
    Open,
    Closed,
}

/// What the socket loop should do after an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close { code: u16, reason: String },
}

/// Per-connection protocol state. Identity comes from the access token
/// verified at the upgrade; room membership is re-checked on every event.
pub struct Session {
    gateway: Gateway,
    room_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
    tx: ConnSender,
    state: SessionState,
}

impl Session {
    pub fn new(gateway: Gateway, room_id: Uuid, user_id: Uuid, tx: ConnSender) -> Self {
        Self {
            gateway,
            room_id,
            user_id,
            conn_id: Uuid::new_v4(),
            tx,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Authorizes against the membership oracle, then registers the
    /// connection and announces it. Returns false for non-members, in which
    /// case nothing was registered and the session is closed.
    pub async fn open(&mut self) -> Result<bool, GatewayError> {
        if self.state != SessionState::Connecting {
            return Ok(self.state == SessionState::Open);
        }

        let (room_id, user_id) = (self.room_id, self.user_id);
        let role = match self.gateway.store(move |db| db.membership(room_id, user_id)).await {
            Ok(role) => role,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };
        let Some(role) = role else {
            info!("{} rejected from room {}: not a member", user_id, room_id);
            self.state = SessionState::Closed;
            return Ok(false);
        };
        self.state = SessionState::Authorized;

        self.gateway
            .registry
            .connect(room_id, user_id, self.conn_id, self.tx.clone())
            .await;
        self.state = SessionState::Open;
        info!("{} ({}) joined room {} live", user_id, role, room_id);

        self.gateway
            .registry
            .broadcast(
                room_id,
                &ServerEvent::Presence {
                    user_id,
                    event: PresenceKind::Join,
                },
            )
            .await;
        Ok(true)
    }

    /// Parses one text frame. Malformed frames are logged and skipped.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!("{} in room {} sent bad event: {} -- raw: {}", self.user_id, self.room_id, e, raw);
                Flow::Continue
            }
        }
    }

    /// Events are handled one at a time, in arrival order.
    pub async fn handle(&mut self, event: ClientEvent) -> Flow {
        if self.state != SessionState::Open {
            return Flow::Continue;
        }

        if event != ClientEvent::Ping {
            let (room_id, user_id) = (self.room_id, self.user_id);
            match self.gateway.store(move |db| db.membership(room_id, user_id)).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("{} is no longer a member of room {}, closing", user_id, room_id);
                    return Flow::Close {
                        code: close_code::POLICY,
                        reason: "not a member".into(),
                    };
                }
                Err(e) => {
                    error!("Membership check for {} in room {} failed: {}", user_id, room_id, e);
                    if matches!(event, ClientEvent::Message { .. }) {
                        self.send(ServerEvent::error("message_not_saved", "message could not be saved"));
                    }
                    return Flow::Continue;
                }
            }
        }

        match event {
            ClientEvent::Typing { state } => {
                self.gateway
                    .registry
                    .broadcast(
                        self.room_id,
                        &ServerEvent::Typing {
                            user_id: self.user_id,
                            state,
                        },
                    )
                    .await;
            }
            ClientEvent::Delivered { message_ids } => {
                self.record_receipts(message_ids, ReceiptKind::Delivered).await;
            }
            ClientEvent::Read { message_ids } => {
                self.record_receipts(message_ids, ReceiptKind::Read).await;
            }
            ClientEvent::Reaction {
                message_id,
                emoji,
                action,
            } => {
                self.react(message_id, emoji, action).await;
            }
            ClientEvent::Message {
                content,
                parent_id,
                mentions,
            } => {
                self.post(&content, parent_id, mentions).await;
            }
            ClientEvent::Ping => self.send(ServerEvent::Pong),
            ClientEvent::Unknown => {
                debug!("Ignoring unknown event from {}", self.user_id);
            }
        }
        Flow::Continue
    }

    /// Deregisters the connection and announces the leave. Runs its side
    /// effects at most once.
    pub async fn close(&mut self) {
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;
        if !was_open {
            return;
        }

        let (room_id, user_id) = (self.room_id, self.user_id);
        let gone = self.gateway.registry.disconnect(room_id, user_id, self.conn_id).await;
        self.gateway
            .registry
            .broadcast(
                room_id,
                &ServerEvent::Presence {
                    user_id,
                    event: PresenceKind::Leave,
                },
            )
            .await;

        if let Err(e) = self.gateway.store(move |db| db.touch_last_seen(user_id)).await {
            warn!("Failed to record last_seen for {}: {}", user_id, e);
        }
        info!(
            "{} left room {} live{}",
            user_id,
            room_id,
            if gone { "" } else { " (other connections remain)" }
        );
    }

    async fn record_receipts(&self, message_ids: Vec<Uuid>, kind: ReceiptKind) {
        let (room_id, user_id) = (self.room_id, self.user_id);
        match self.gateway.record_receipts(room_id, user_id, message_ids, kind).await {
            Ok(written) => debug!("{} {:?} receipts from {} in room {}", written, kind, user_id, room_id),
            Err(e) => error!("Dropping {:?} receipts from {}: {}", kind, user_id, e),
        }
    }

    async fn react(&self, message_id: Uuid, emoji: String, action: ReactionAction) {
        let Some(emoji) = normalize_emoji(&emoji) else {
            debug!("Dropping reaction with unusable emoji from {}", self.user_id);
            return;
        };

        let (room_id, user_id) = (self.room_id, self.user_id);
        match self.gateway.react(room_id, user_id, message_id, emoji, action).await {
            Ok(ReactionChange::NoSuchMessage) => {
                debug!("Dropping reaction on {}: not a live message of room {}", message_id, room_id);
            }
            Ok(_) => {}
            Err(e) => error!("Dropping reaction from {}: {}", user_id, e),
        }
    }

    async fn post(&self, content: &str, parent_id: Option<Uuid>, mentions: Vec<Uuid>) {
        let outcome = self
            .gateway
            .publish_message(self.room_id, self.user_id, content, parent_id, None, mentions)
            .await;

        match outcome {
            Ok(PublishOutcome::Published { .. }) | Ok(PublishOutcome::Empty) => {}
            Ok(PublishOutcome::TooLong) => self.send(ServerEvent::error(
                "message_too_long",
                format!("messages are limited to {} characters", MAX_MESSAGE_CHARS),
            )),
            Ok(PublishOutcome::InvalidParent) => {
                self.send(ServerEvent::error("invalid_parent", "parent message not found in this room"))
            }
            Ok(PublishOutcome::Muted) => self.send(ServerEvent::error("muted", "you are muted in this room")),
            Err(e) => {
                error!("Message from {} in room {} not saved: {}", self.user_id, self.room_id, e);
                self.send(ServerEvent::error("message_not_saved", "message could not be saved"));
            }
        }
    }

    fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(Outbound::Event(event));
    }
}
