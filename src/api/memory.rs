//! インメモリバックエンド
//!
//! テストとオフラインデモ用。行の保存・追記・決定の記録・終了更新を
//! プロセス内で再現し、更新のたびに購読者へ行全体をプッシュする。
//! 呼び出し回数の記録と失敗の注入ができる。

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use crate::api::realtime::session_topic;
use crate::api::remote::{RemoteError, RemoteStateClient};
use crate::api::subscription::{RealtimeEvent, Subscription, SubscriptionFeed};
use crate::models::{
    ChatRow, InteractionOutcome, InteractionRequest, ProfileRow, SessionId, SessionStatus,
    StatusChange, UserId, WireMessage,
};

/// 呼び出し回数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_session: usize,
    pub fetch_profile: usize,
    pub append_message: usize,
    pub handle_user_interaction: usize,
    pub update_status: usize,
    pub subscribe: usize,
}

/// 失敗注入の設定（解除するまで継続）
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    pub fetch_session: bool,
    pub fetch_profile: bool,
    pub append_message: bool,
    pub handle_user_interaction: bool,
    pub update_status: bool,
    pub subscribe: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    sessions: HashMap<String, ChatRow>,
    profiles: HashMap<String, ProfileRow>,
    feeds: HashMap<String, Vec<SubscriptionFeed>>,
    /// chat_id -> (user_id -> interaction_type)
    interactions: HashMap<String, HashMap<String, String>>,
    failures: FailurePlan,
    calls: CallCounts,
    /// trueの間は購読者へプッシュしない（取りこぼしの再現）
    muted: bool,
}

impl BackendState {
    fn broadcast(&mut self, chat_id: &str, event: RealtimeEvent) {
        if self.muted {
            tracing::debug!("🔇 [MEMORY] Dropping push for {}", chat_id);
            return;
        }
        if let Some(feeds) = self.feeds.get_mut(chat_id) {
            feeds.retain_mut(|feed| !feed.is_closed());
            for feed in feeds.iter() {
                feed.push(event.clone());
            }
        }
    }

    fn broadcast_row(&mut self, chat_id: &str) {
        if let Some(row) = self.sessions.get(chat_id).cloned() {
            self.broadcast(chat_id, RealtimeEvent::RowUpdated(row));
        }
    }
}

/// プロセス内バックエンド
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

fn injected(operation: &str) -> RemoteError {
    RemoteError::Injected(format!("{} failed", operation))
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, row: ChatRow) {
        self.state.lock().sessions.insert(row.chat_id.clone(), row);
    }

    pub fn insert_profile(&self, row: ProfileRow) {
        self.state.lock().profiles.insert(row.id.clone(), row);
    }

    /// 現在の行
    pub fn session(&self, chat_id: &str) -> Option<ChatRow> {
        self.state.lock().sessions.get(chat_id).cloned()
    }

    pub fn call_counts(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }

    /// 失敗注入を設定
    pub fn set_failures(&self, plan: FailurePlan) {
        self.state.lock().failures = plan;
    }

    pub fn clear_failures(&self) {
        self.set_failures(FailurePlan::default());
    }

    /// プッシュの停止・再開
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    /// 生きている購読者数
    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        let mut state = self.state.lock();
        match state.feeds.get_mut(chat_id) {
            Some(feeds) => {
                feeds.retain_mut(|feed| !feed.is_closed());
                feeds.len()
            }
            None => 0,
        }
    }

    /// 任意のイベントを購読者へ送る（プレゼンス等）
    pub fn push_event(&self, chat_id: &str, event: RealtimeEvent) {
        self.state.lock().broadcast(chat_id, event);
    }

    /// 現在の行をそのまま再送する
    pub fn push_current_row(&self, chat_id: &str) {
        self.state.lock().broadcast_row(chat_id);
    }

    /// 行を書き換えてプッシュする（相手側やサーバー側の操作の再現）
    pub fn mutate_session<F>(&self, chat_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ChatRow),
    {
        let mut state = self.state.lock();
        let Some(row) = state.sessions.get_mut(chat_id) else {
            return false;
        };
        mutate(row);
        row.updated_at = Some(Utc::now().to_rfc3339());
        state.broadcast_row(chat_id);
        true
    }

    /// 相手側の決定を記録する（`handle_user_interaction` と同じ規則）
    pub fn record_interaction(&self, request: &InteractionRequest) -> InteractionOutcome {
        let mut state = self.state.lock();
        Self::apply_interaction(&mut state, request)
    }

    fn apply_interaction(
        state: &mut BackendState,
        request: &InteractionRequest,
    ) -> InteractionOutcome {
        let chat_interactions = state
            .interactions
            .entry(request.chat_id.clone())
            .or_default();
        chat_interactions.insert(
            request.user_id.clone(),
            request.interaction_type.clone(),
        );

        let target_liked = chat_interactions
            .get(&request.target_user_id)
            .map(|t| t == "like")
            .unwrap_or(false);
        let is_mutual_match = request.interaction_type == "like" && target_liked;

        if is_mutual_match {
            if let Some(row) = state.sessions.get_mut(&request.chat_id) {
                if row.status == SessionStatus::Active.as_str() {
                    row.messages = Some(
                        row.temporary_messages
                            .clone()
                            .unwrap_or_else(|| Value::Array(Vec::new())),
                    );
                    row.status = SessionStatus::Completed.as_str().to_string();
                    row.updated_at = Some(Utc::now().to_rfc3339());
                    tracing::info!("💕 [MEMORY] Mutual match on chat {}", request.chat_id);
                }
            }
            state.broadcast_row(&request.chat_id);
        }

        InteractionOutcome { is_mutual_match }
    }
}

#[async_trait]
impl RemoteStateClient for InMemoryBackend {
    async fn fetch_session(&self, session_id: &SessionId) -> Result<Option<ChatRow>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.fetch_session += 1;
        if state.failures.fetch_session {
            return Err(injected("fetch_session"));
        }
        Ok(state.sessions.get(&session_id.0).cloned())
    }

    async fn fetch_profile(&self, user_id: &UserId) -> Result<Option<ProfileRow>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.fetch_profile += 1;
        if state.failures.fetch_profile {
            return Err(injected("fetch_profile"));
        }
        Ok(state.profiles.get(&user_id.0).cloned())
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        message: &WireMessage,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.append_message += 1;
        if state.failures.append_message {
            return Err(injected("append_message"));
        }

        let row = state
            .sessions
            .get_mut(&session_id.0)
            .ok_or(RemoteError::NotFound)?;
        if row.status != SessionStatus::Active.as_str() {
            return Err(RemoteError::Status {
                status: 409,
                body: format!("chat {} is {}", session_id, row.status),
            });
        }

        let wire = serde_json::to_value(message)?;
        match row.temporary_messages.as_mut() {
            Some(Value::Array(items)) => items.push(wire),
            _ => row.temporary_messages = Some(Value::Array(vec![wire])),
        }
        row.updated_at = Some(Utc::now().to_rfc3339());
        state.broadcast_row(&session_id.0);
        Ok(())
    }

    async fn handle_user_interaction(
        &self,
        request: &InteractionRequest,
    ) -> Result<InteractionOutcome, RemoteError> {
        let mut state = self.state.lock();
        state.calls.handle_user_interaction += 1;
        if state.failures.handle_user_interaction {
            return Err(injected("handle_user_interaction"));
        }
        if !state.sessions.contains_key(&request.chat_id) {
            return Err(RemoteError::NotFound);
        }
        Ok(Self::apply_interaction(&mut state, request))
    }

    async fn update_status(
        &self,
        session_id: &SessionId,
        change: &StatusChange,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.update_status += 1;
        if state.failures.update_status {
            return Err(injected("update_status"));
        }

        let row = state
            .sessions
            .get_mut(&session_id.0)
            .ok_or(RemoteError::NotFound)?;
        row.status = SessionStatus::from(change.status).as_str().to_string();
        row.ended_by = Some(change.ended_by.0.clone());
        row.ended_at = Some(change.ended_at.to_rfc3339());
        row.updated_at = Some(Utc::now().to_rfc3339());
        state.broadcast_row(&session_id.0);
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        presence_key: Option<&UserId>,
    ) -> Result<Subscription, RemoteError> {
        let mut state = self.state.lock();
        state.calls.subscribe += 1;
        if state.failures.subscribe {
            return Err(RemoteError::Realtime("subscribe failed".to_string()));
        }

        let (subscription, feed) = Subscription::channel(session_topic(session_id));
        state
            .feeds
            .entry(session_id.0.clone())
            .or_default()
            .push(feed);
        if let Some(key) = presence_key {
            tracing::debug!("👋 [MEMORY] {} joined {}", key, session_id);
        }
        Ok(subscription)
    }
}
