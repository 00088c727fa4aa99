//! バックエンド境界
//!
//! セッション行の取得・メッセージ追記・決定送信・終了更新・リアルタイム購読を
//! 1つのトレイトにまとめる。実装は REST + WebSocket（本番）とインメモリ（テスト・デモ）。

use async_trait::async_trait;

use crate::api::subscription::Subscription;
use crate::models::{
    ChatRow, InteractionOutcome, InteractionRequest, ProfileRow, SessionId, StatusChange, UserId,
    WireMessage,
};

/// バックエンド呼び出しのエラー
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Not found")]
    NotFound,
    #[error("WebSocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Realtime error: {0}")]
    Realtime(String),
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// セッションクライアントが利用するバックエンド操作
#[async_trait]
pub trait RemoteStateClient: Send + Sync {
    /// セッション行を1件取得（存在しなければNone）
    async fn fetch_session(&self, session_id: &SessionId) -> Result<Option<ChatRow>, RemoteError>;

    /// プロフィールを1件取得（存在しなければNone）
    async fn fetch_profile(&self, user_id: &UserId) -> Result<Option<ProfileRow>, RemoteError>;

    /// `append_message(chat_id, message)` をアトミックに実行
    async fn append_message(
        &self,
        session_id: &SessionId,
        message: &WireMessage,
    ) -> Result<(), RemoteError>;

    /// `handle_user_interaction(...)` を実行
    async fn handle_user_interaction(
        &self,
        request: &InteractionRequest,
    ) -> Result<InteractionOutcome, RemoteError>;

    /// `status` / `ended_by` / `ended_at` の直接更新
    async fn update_status(
        &self,
        session_id: &SessionId,
        change: &StatusChange,
    ) -> Result<(), RemoteError>;

    /// 行更新とプレゼンスの購読を開始
    ///
    /// `presence_key` は自分のユーザーID。返された `Subscription` をdropすると購読は解除される。
    async fn subscribe(
        &self,
        session_id: &SessionId,
        presence_key: Option<&UserId>,
    ) -> Result<Subscription, RemoteError>;
}
