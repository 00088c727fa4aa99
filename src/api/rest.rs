use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::realtime::{RealtimeConfig, RealtimeConnector};
use crate::api::remote::{RemoteError, RemoteStateClient};
use crate::api::subscription::Subscription;
use crate::models::{
    ChatRow, InteractionOutcome, InteractionRequest, ProfileRow, SessionId, StatusChange, UserId,
    WireMessage,
};

/// REST endpoint settings for the backend project
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub base_url: String,
    pub anon_key: String,
    /// User access token; the anon key is used when absent
    pub access_token: Option<String>,
}

impl BackendEndpoint {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    pub fn table_url(&self, table: &str, column: &str, value: &str) -> String {
        format!(
            "{}/rest/v1/{}?{}=eq.{}&select=*",
            self.base_url,
            table,
            column,
            urlencoding::encode(value)
        )
    }

    pub fn rpc_url(&self, procedure: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, procedure)
    }
}

/// PostgREST/RPC client with realtime subscriptions
#[derive(Debug, Clone)]
pub struct SupabaseRestClient {
    endpoint: BackendEndpoint,
    http_client: reqwest::Client,
    realtime: RealtimeConnector,
}

impl SupabaseRestClient {
    pub fn new(endpoint: BackendEndpoint, realtime_config: RealtimeConfig) -> Self {
        let realtime = RealtimeConnector::new(&endpoint, realtime_config);
        Self {
            endpoint,
            http_client: reqwest::Client::new(),
            realtime,
        }
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .header("apikey", &self.endpoint.anon_key)
            .header("Authorization", format!("Bearer {}", self.endpoint.bearer()))
            .header("Content-Type", "application/json")
    }

    async fn fetch_single<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<T>, RemoteError> {
        let url = self.endpoint.table_url(table, column, value);
        tracing::debug!("📡 [REST] GET {} ({}={})", table, column, value);

        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("❌ [REST] HTTP request failed: {}", e);
                e
            })?;
        let text = check_status(response).await?;

        let mut rows: Vec<T> = serde_json::from_str(&text).map_err(|e| {
            tracing::error!("❌ [REST] Failed to parse {} rows: {}", table, e);
            tracing::debug!(
                "🔍 [REST] Response text preview: {}",
                preview(&text)
            );
            e
        })?;

        if rows.len() > 1 {
            tracing::warn!(
                "⚠️ [REST] {} rows matched {}={} in {}, using the first",
                rows.len(),
                column,
                value,
                table
            );
        }
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn call_rpc<B: Serialize + ?Sized>(
        &self,
        procedure: &str,
        body: &B,
    ) -> Result<String, RemoteError> {
        let url = self.endpoint.rpc_url(procedure);
        tracing::debug!("📡 [REST] RPC {}", procedure);

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("❌ [REST] RPC {} failed: {}", procedure, e);
                e
            })?;
        check_status(response).await
    }
}

/// First 200 characters of a body for debug logs
fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Fail on non-2xx and return the body text
async fn check_status(response: reqwest::Response) -> Result<String, RemoteError> {
    let status = response.status();
    let text = response.text().await.map_err(|e| {
        tracing::error!("❌ [REST] Failed to read response text: {}", e);
        e
    })?;

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound);
    }
    if !status.is_success() {
        tracing::error!("❌ [REST] HTTP request failed with status: {}", status);
        return Err(RemoteError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}

/// Parse the interaction RPC result, which may be `null` or an object
pub fn parse_interaction_outcome(text: &str) -> Result<InteractionOutcome, RemoteError> {
    let value: serde_json::Value = if text.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(text)?
    };

    if value.is_null() {
        return Ok(InteractionOutcome::default());
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl RemoteStateClient for SupabaseRestClient {
    async fn fetch_session(&self, session_id: &SessionId) -> Result<Option<ChatRow>, RemoteError> {
        self.fetch_single("chats", "chat_id", &session_id.0).await
    }

    async fn fetch_profile(&self, user_id: &UserId) -> Result<Option<ProfileRow>, RemoteError> {
        self.fetch_single("users", "id", &user_id.0).await
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        message: &WireMessage,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "chat_id_param": session_id.0,
            "message_param": message,
        });
        self.call_rpc("append_message", &body).await?;
        tracing::debug!("✅ [REST] Appended {} to {}", message.id, session_id);
        Ok(())
    }

    async fn handle_user_interaction(
        &self,
        request: &InteractionRequest,
    ) -> Result<InteractionOutcome, RemoteError> {
        let text = self.call_rpc("handle_user_interaction", request).await?;
        let outcome = parse_interaction_outcome(&text)?;
        tracing::info!(
            "💌 [REST] Interaction '{}' recorded for chat {} (mutual match: {})",
            request.interaction_type,
            request.chat_id,
            outcome.is_mutual_match
        );
        Ok(outcome)
    }

    async fn update_status(
        &self,
        session_id: &SessionId,
        change: &StatusChange,
    ) -> Result<(), RemoteError> {
        let url = format!(
            "{}/rest/v1/chats?chat_id=eq.{}",
            self.endpoint.base_url,
            urlencoding::encode(&session_id.0)
        );
        let response = self
            .request(reqwest::Method::PATCH, &url)
            .header("Prefer", "return=minimal")
            .json(change)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("❌ [REST] Status update failed: {}", e);
                e
            })?;
        check_status(response).await?;
        tracing::info!(
            "🔚 [REST] Chat {} marked {:?} by {}",
            session_id,
            change.status,
            change.ended_by
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        presence_key: Option<&UserId>,
    ) -> Result<Subscription, RemoteError> {
        self.realtime.subscribe(session_id, presence_key).await
    }
}
