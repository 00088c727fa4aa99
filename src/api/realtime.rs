//! Realtime change feed client
//!
//! Speaks the Phoenix channel protocol used by the backend's realtime service over
//! a WebSocket. One socket is opened per subscription; it joins
//! `realtime:speed-chat-<chat_id>` with a `postgres_changes` filter for `UPDATE`s
//! on that single `chats` row and with presence keyed by the local user id.
//!
//! ## Reconnection
//!
//! A dropped socket is retried up to `reconnect_attempts` times with a doubling
//! delay starting at `reconnect_delay_ms`. A successful join resets the counter.
//! When retries are exhausted the feed emits [`RealtimeEvent::Disconnected`] and ends.
//! Every join after a drop emits [`RealtimeEvent::Resubscribed`], since row updates
//! sent while the socket was down are not replayed.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::api::remote::RemoteError;
use crate::api::rest::BackendEndpoint;
use crate::api::subscription::{RealtimeEvent, Subscription, SubscriptionFeed};
use crate::models::{ChatRow, SessionId, UserId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Heartbeat interval in seconds
    pub heartbeat_secs: u64,
    /// Reconnect attempts after a dropped socket
    pub reconnect_attempts: u32,
    /// First reconnect delay in milliseconds, doubled per attempt
    pub reconnect_delay_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 25,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
        }
    }
}

impl RealtimeConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(1u64 << exponent))
    }
}

/// Channel topic for one chat session
pub fn session_topic(session_id: &SessionId) -> String {
    format!("realtime:speed-chat-{}", session_id)
}

/// Frame in the Phoenix JSON serializer format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

/// What a received frame means for the subscription
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    Emit(Vec<RealtimeEvent>),
    Presence(PresenceUpdate),
    Joined,
    JoinRejected(String),
    Closed(String),
    Ignore,
}

/// Interpret one inbound frame for `topic`
pub fn interpret_frame(frame: &PhoenixFrame, topic: &str) -> FrameAction {
    if frame.topic != topic {
        return FrameAction::Ignore;
    }

    match frame.event.as_str() {
        "phx_reply" => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            match status {
                Some("ok") if frame.reference.as_deref() == Some(JOIN_REF) => FrameAction::Joined,
                Some("error") => FrameAction::JoinRejected(
                    frame
                        .payload
                        .get("response")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "join rejected".to_string()),
                ),
                _ => FrameAction::Ignore,
            }
        }
        "postgres_changes" => {
            let data = frame.payload.get("data");
            let is_update = data
                .and_then(|d| d.get("type").or_else(|| d.get("eventType")))
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case("UPDATE"))
                .unwrap_or(false);
            if !is_update {
                return FrameAction::Ignore;
            }
            let record = data.and_then(|d| d.get("record").or_else(|| d.get("new")));
            match record.map(|r| serde_json::from_value::<ChatRow>(r.clone())) {
                Some(Ok(row)) => FrameAction::Emit(vec![RealtimeEvent::RowUpdated(row)]),
                Some(Err(e)) => {
                    tracing::warn!("⚠️ [REALTIME] Dropping undecodable row update: {}", e);
                    FrameAction::Ignore
                }
                None => FrameAction::Ignore,
            }
        }
        "presence_state" => {
            FrameAction::Presence(PresenceUpdate::State(presence_metas(Some(&frame.payload))))
        }
        "presence_diff" => FrameAction::Presence(PresenceUpdate::Diff {
            joins: presence_metas(frame.payload.get("joins")),
            leaves: presence_metas(frame.payload.get("leaves")),
        }),
        "phx_error" => FrameAction::Closed("channel error".to_string()),
        "phx_close" => FrameAction::Closed("channel closed by server".to_string()),
        _ => FrameAction::Ignore,
    }
}

/// Presence key -> meta refs (`phx_ref`) currently online under that key
pub type PresenceMetas = BTreeMap<String, BTreeSet<String>>;

fn presence_metas(value: Option<&Value>) -> PresenceMetas {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(key, entry)| {
                    let refs: BTreeSet<String> = entry
                        .get("metas")
                        .and_then(Value::as_array)
                        .map(|metas| metas.iter().map(meta_ref).collect())
                        .unwrap_or_default();
                    (key.clone(), refs)
                })
                .collect::<PresenceMetas>()
        })
        .unwrap_or_default()
}

fn meta_ref(meta: &Value) -> String {
    meta.get("phx_ref")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| meta.to_string())
}

/// Presence frame contents
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    /// Full snapshot, sent after every join
    State(PresenceMetas),
    Diff {
        joins: PresenceMetas,
        leaves: PresenceMetas,
    },
}

/// Tracks presence metas per key across frames and reconnects.
///
/// One key can hold several metas (one per socket), so a reconnecting
/// participant shows up as a join plus a leave under the same key. A key only
/// counts as left once its last meta is gone.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: PresenceMetas,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, key: &str) -> bool {
        self.online.contains_key(key)
    }

    /// Apply an update and return the key-level joins and leaves it causes
    pub fn apply(&mut self, update: PresenceUpdate) -> Vec<RealtimeEvent> {
        match update {
            PresenceUpdate::State(state) => self.resync(state),
            PresenceUpdate::Diff { joins, leaves } => self.apply_diff(joins, leaves),
        }
    }

    fn resync(&mut self, mut state: PresenceMetas) -> Vec<RealtimeEvent> {
        state.retain(|_, refs| !refs.is_empty());
        let mut events: Vec<RealtimeEvent> = state
            .keys()
            .filter(|key| !self.online.contains_key(*key))
            .map(|key| RealtimeEvent::PresenceJoined(UserId(key.clone())))
            .collect();
        events.extend(
            self.online
                .keys()
                .filter(|key| !state.contains_key(*key))
                .map(|key| RealtimeEvent::PresenceLeft(UserId(key.clone()))),
        );
        self.online = state;
        events
    }

    fn apply_diff(&mut self, joins: PresenceMetas, leaves: PresenceMetas) -> Vec<RealtimeEvent> {
        let mut events = Vec::new();

        for (key, refs) in joins {
            if refs.is_empty() {
                continue;
            }
            let entry = self.online.entry(key.clone()).or_default();
            let was_offline = entry.is_empty();
            entry.extend(refs);
            if was_offline {
                events.push(RealtimeEvent::PresenceJoined(UserId(key)));
            }
        }

        for (key, refs) in leaves {
            let Some(entry) = self.online.get_mut(&key) else {
                continue;
            };
            for r in &refs {
                entry.remove(r);
            }
            if entry.is_empty() {
                self.online.remove(&key);
                events.push(RealtimeEvent::PresenceLeft(UserId(key)));
            }
        }
        events
    }
}

const JOIN_REF: &str = "1";

/// Opens realtime subscriptions against one backend project
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    socket_url: String,
    access_token: String,
    config: RealtimeConfig,
}

enum DriveEnd {
    Cancelled,
    Dropped { reason: String, was_joined: bool },
    Rejected(String),
}

impl RealtimeConnector {
    pub fn new(endpoint: &BackendEndpoint, config: RealtimeConfig) -> Self {
        let ws_base = if let Some(rest) = endpoint.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = endpoint.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            endpoint.base_url.clone()
        };

        Self {
            socket_url: format!(
                "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
                ws_base,
                urlencoding::encode(&endpoint.anon_key)
            ),
            access_token: endpoint
                .access_token
                .clone()
                .unwrap_or_else(|| endpoint.anon_key.clone()),
            config,
        }
    }

    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }

    /// Connect, then hand the socket to a background task that feeds the subscription
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        presence_key: Option<&UserId>,
    ) -> Result<Subscription, RemoteError> {
        let socket = self.connect().await?;
        let topic = session_topic(session_id);
        let (subscription, feed) = Subscription::channel(topic.clone());

        let connector = self.clone();
        let session_id = session_id.clone();
        let presence_key = presence_key.cloned();
        tokio::spawn(async move {
            connector
                .run_channel(socket, feed, session_id, presence_key)
                .await;
        });

        tracing::info!("📡 [REALTIME] Subscribed to {}", topic);
        Ok(subscription)
    }

    async fn connect(&self) -> Result<Socket, RemoteError> {
        let (socket, _response) = tokio_tungstenite::connect_async(&self.socket_url)
            .await
            .map_err(|e| {
                tracing::error!("❌ [REALTIME] WebSocket connect failed: {}", e);
                e
            })?;
        Ok(socket)
    }

    fn join_frame(&self, session_id: &SessionId, presence_key: Option<&UserId>) -> Value {
        json!({
            "topic": session_topic(session_id),
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": presence_key.map(|k| k.0.clone()).unwrap_or_default() },
                    "postgres_changes": [{
                        "event": "UPDATE",
                        "schema": "public",
                        "table": "chats",
                        "filter": format!("chat_id=eq.{}", session_id),
                    }],
                },
                "access_token": self.access_token,
            },
            "ref": JOIN_REF,
        })
    }

    async fn run_channel(
        self,
        first_socket: Socket,
        mut feed: SubscriptionFeed,
        session_id: SessionId,
        presence_key: Option<UserId>,
    ) {
        let mut socket = Some(first_socket);
        let mut attempt = 0u32;
        let mut last_reason = String::from("connection closed");
        let mut presence = PresenceTracker::new();
        let mut rejoin = false;

        loop {
            let ws = match socket.take() {
                Some(ws) => ws,
                None => {
                    attempt += 1;
                    if attempt > self.config.reconnect_attempts {
                        tracing::warn!(
                            "🔴 [REALTIME] Giving up on {} after {} attempts: {}",
                            feed.topic(),
                            self.config.reconnect_attempts,
                            last_reason
                        );
                        feed.push(RealtimeEvent::Disconnected {
                            reason: last_reason,
                        });
                        return;
                    }

                    feed.push(RealtimeEvent::Reconnecting { attempt });
                    let delay = self.config.retry_delay(attempt);
                    tracing::info!(
                        "🔄 [REALTIME] Reconnecting {} in {:?} (attempt {})",
                        feed.topic(),
                        delay,
                        attempt
                    );
                    tokio::select! {
                        _ = feed.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match self.connect().await {
                        Ok(ws) => ws,
                        Err(e) => {
                            last_reason = e.to_string();
                            continue;
                        }
                    }
                }
            };

            match self
                .drive(
                    ws,
                    &mut feed,
                    &mut presence,
                    rejoin,
                    &session_id,
                    presence_key.as_ref(),
                )
                .await
            {
                DriveEnd::Cancelled => {
                    tracing::debug!("🔌 [REALTIME] {} closed by subscriber", feed.topic());
                    return;
                }
                DriveEnd::Rejected(reason) => {
                    tracing::error!("❌ [REALTIME] Join rejected for {}: {}", feed.topic(), reason);
                    feed.push(RealtimeEvent::Disconnected { reason });
                    return;
                }
                DriveEnd::Dropped { reason, was_joined } => {
                    tracing::warn!("⚠️ [REALTIME] {} dropped: {}", feed.topic(), reason);
                    if was_joined {
                        attempt = 0;
                    }
                    rejoin = true;
                    last_reason = reason;
                }
            }
        }
    }

    async fn drive(
        &self,
        ws: Socket,
        feed: &mut SubscriptionFeed,
        presence: &mut PresenceTracker,
        rejoin: bool,
        session_id: &SessionId,
        presence_key: Option<&UserId>,
    ) -> DriveEnd {
        let topic = session_topic(session_id);
        let (mut write, mut read) = ws.split();
        let mut next_ref: u64 = 2;
        let mut was_joined = false;

        let join = self.join_frame(session_id, presence_key).to_string();
        if let Err(e) = write.send(Message::Text(join)).await {
            return DriveEnd::Dropped {
                reason: e.to_string(),
                was_joined,
            };
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = feed.cancelled() => {
                    let leave = json!({"topic": topic, "event": "phx_leave", "payload": {}, "ref": next_ref.to_string()});
                    let _ = write.send(Message::Text(leave.to_string())).await;
                    let _ = write.close().await;
                    return DriveEnd::Cancelled;
                }
                _ = heartbeat.tick() => {
                    let beat = json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": next_ref.to_string()});
                    next_ref += 1;
                    if let Err(e) = write.send(Message::Text(beat.to_string())).await {
                        return DriveEnd::Dropped { reason: e.to_string(), was_joined };
                    }
                }
                incoming = read.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return DriveEnd::Dropped { reason: "socket closed".to_string(), was_joined };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return DriveEnd::Dropped { reason: e.to_string(), was_joined };
                        }
                    };

                    let frame: PhoenixFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::debug!("🔍 [REALTIME] Unparseable frame ignored: {}", e);
                            continue;
                        }
                    };

                    match interpret_frame(&frame, &topic) {
                        FrameAction::Joined => {
                            was_joined = true;
                            tracing::info!("✅ [REALTIME] Joined {}", topic);
                            if rejoin && !feed.push(RealtimeEvent::Resubscribed) {
                                return DriveEnd::Cancelled;
                            }
                            if let Some(key) = presence_key {
                                let track = json!({
                                    "topic": topic,
                                    "event": "presence",
                                    "payload": {
                                        "type": "presence",
                                        "event": "track",
                                        "payload": {
                                            "user_id": key.0,
                                            "online_at": chrono::Utc::now().to_rfc3339(),
                                        },
                                    },
                                    "ref": next_ref.to_string(),
                                });
                                next_ref += 1;
                                if let Err(e) = write.send(Message::Text(track.to_string())).await {
                                    return DriveEnd::Dropped { reason: e.to_string(), was_joined };
                                }
                            }
                        }
                        FrameAction::Emit(events) => {
                            for event in events {
                                if !feed.push(event) {
                                    return DriveEnd::Cancelled;
                                }
                            }
                        }
                        FrameAction::Presence(update) => {
                            for event in presence.apply(update) {
                                if !feed.push(event) {
                                    return DriveEnd::Cancelled;
                                }
                            }
                        }
                        FrameAction::JoinRejected(reason) => return DriveEnd::Rejected(reason),
                        FrameAction::Closed(reason) => {
                            return DriveEnd::Dropped { reason, was_joined };
                        }
                        FrameAction::Ignore => {}
                    }
                }
            }
        }
    }
}
