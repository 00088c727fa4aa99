//! セッション・メッセージ・プロフィールのモデル
//!
//! バックエンドから届く行（`ChatRow` / `ProfileRow`）は型の緩い JSON を含むため、
//! ここで強い型（`ChatSession` / `Message` / `ParticipantProfile`）へ変換する。
//! 不正なメッセージ要素は捨て、未知のステータスはエラーにする。

use crate::error::{SessionError, SpeedHeartResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// チャットセッションID
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// ユーザーID
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// メッセージID（クライアント生成 `msg_<uuid>` またはサーバー付与）
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// 楽観的送信用のユニークIDを生成
    pub fn generate() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }
}

/// セッションステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    EndedByDeparture,
    EndedManually,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::EndedByDeparture => "ended_by_departure",
            SessionStatus::EndedManually => "ended_manually",
            SessionStatus::Completed => "completed",
        }
    }

    /// 文字列から変換（未知の値はNone）
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "ended_by_departure" => Some(SessionStatus::EndedByDeparture),
            "ended_manually" => Some(SessionStatus::EndedManually),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    /// これ以上の遷移を処理しないステータスか
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// チャットメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// バックエンド上のメッセージ形式 `{id, text, sender_id, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub timestamp: String,
}

impl Message {
    /// 送信用メッセージを組み立てる（本文はtrim済み、空ならNone）
    pub fn compose(sender_id: &UserId, body: &str, now: DateTime<Utc>) -> Option<Self> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }

        Some(Self {
            id: MessageId::generate(),
            sender_id: sender_id.clone(),
            body: body.to_string(),
            sent_at: now,
        })
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id.0.clone(),
            text: self.body.clone(),
            sender_id: self.sender_id.0.clone(),
            timestamp: self.sent_at.to_rfc3339(),
        }
    }

    /// JSON要素から変換。形が合わない要素はNone
    pub fn from_wire_value(value: &Value) -> Option<Self> {
        let wire: WireMessage = serde_json::from_value(value.clone()).ok()?;
        let body = wire.text.trim();
        if wire.id.is_empty() || wire.sender_id.is_empty() || body.is_empty() {
            return None;
        }
        let sent_at = parse_timestamp(&wire.timestamp)?;

        Some(Self {
            id: MessageId(wire.id),
            sender_id: UserId(wire.sender_id),
            body: body.to_string(),
            sent_at,
        })
    }
}

/// 型の緩いメッセージ配列を変換する
///
/// 配列でなければ空リスト。不正な要素は警告ログを出して捨てる。
pub fn coerce_messages(value: Option<&Value>, field: &str) -> Vec<Message> {
    let Some(items) = value.and_then(Value::as_array) else {
        if matches!(value, Some(v) if !v.is_null()) {
            tracing::warn!("⚠️ [MODELS] '{}' is not an array, treating as empty", field);
        }
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let message = Message::from_wire_value(item);
            if message.is_none() {
                tracing::warn!(
                    "⚠️ [MODELS] Dropping malformed entry #{} in '{}'",
                    index,
                    field
                );
            }
            message
        })
        .collect()
}

/// タイムスタンプ文字列をUTCに変換（RFC 3339、タイムゾーンなしはUTC扱い）
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// `chats` テーブルの生の行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRow {
    pub chat_id: String,
    pub user1_id: String,
    pub user2_id: String,
    #[serde(default)]
    pub messages: Option<Value>,
    #[serde(default)]
    pub temporary_messages: Option<Value>,
    #[serde(default)]
    pub timer_start_time: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub ended_by: Option<String>,
}

impl ChatRow {
    /// アクティブな新規行（テスト・インメモリバックエンド用）
    pub fn new_active(
        chat_id: impl Into<String>,
        user1_id: impl Into<String>,
        user2_id: impl Into<String>,
        timer_start_time: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            chat_id: chat_id.into(),
            user1_id: user1_id.into(),
            user2_id: user2_id.into(),
            messages: Some(Value::Array(Vec::new())),
            temporary_messages: Some(Value::Array(Vec::new())),
            timer_start_time: timer_start_time.map(|t| t.to_rfc3339()),
            status: SessionStatus::Active.as_str().to_string(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            ended_at: None,
            ended_by: None,
        }
    }
}

/// チャットセッション（リモート行の型付きミラー）
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub session_id: SessionId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub status: SessionStatus,
    /// カウントダウン開始時刻（欠落・不正ならNone）
    pub started_at: Option<DateTime<Utc>>,
    pub draft_messages: Vec<Message>,
    pub final_messages: Vec<Message>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<UserId>,
}

impl ChatSession {
    /// 生の行から変換する
    pub fn from_row(row: &ChatRow) -> SpeedHeartResult<Self> {
        if row.chat_id.is_empty() {
            return Err(SessionError::malformed("chat row", "empty chat_id"));
        }
        let status = SessionStatus::parse(&row.status).ok_or_else(|| {
            SessionError::malformed("chat row", format!("unknown status '{}'", row.status))
        })?;

        let started_at = row.timer_start_time.as_deref().and_then(parse_timestamp);
        if row.timer_start_time.is_some() && started_at.is_none() {
            tracing::warn!(
                "⚠️ [MODELS] Unparseable timer_start_time for chat {}",
                row.chat_id
            );
        }

        Ok(Self {
            session_id: SessionId(row.chat_id.clone()),
            participant_a: UserId(row.user1_id.clone()),
            participant_b: UserId(row.user2_id.clone()),
            status,
            started_at,
            draft_messages: coerce_messages(row.temporary_messages.as_ref(), "temporary_messages"),
            final_messages: coerce_messages(row.messages.as_ref(), "messages"),
            created_at: row.created_at.as_deref().and_then(parse_timestamp),
            updated_at: row.updated_at.as_deref().and_then(parse_timestamp),
            ended_at: row.ended_at.as_deref().and_then(parse_timestamp),
            ended_by: row.ended_by.clone().map(UserId),
        })
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        &self.participant_a == user_id || &self.participant_b == user_id
    }

    /// 相手側の参加者
    pub fn partner_of(&self, user_id: &UserId) -> Option<&UserId> {
        if &self.participant_a == user_id {
            Some(&self.participant_b)
        } else if &self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

/// `users` テーブルの生の行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub preferences: Option<Value>,
}

/// 相手のプロフィール（読み取り専用スナップショット）
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantProfile {
    pub id: UserId,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
    pub interests: Vec<String>,
}

impl ParticipantProfile {
    pub fn from_row(row: &ProfileRow) -> Self {
        let interests = row
            .preferences
            .as_ref()
            .and_then(|prefs| prefs.get("interests"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: UserId(row.id.clone()),
            name: row.name.clone().filter(|n| !n.trim().is_empty()),
            age: row.age,
            bio: row.bio.clone(),
            photo_url: row.photo_url.clone(),
            interests,
        }
    }

    /// 表示名（未設定なら汎用の呼び方）
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("The other user")
    }

    /// ヘッダー表示用 "名前, 年齢"
    pub fn headline(&self) -> String {
        match self.age {
            Some(age) => format!("{}, {}", self.display_name(), age),
            None => self.display_name().to_string(),
        }
    }
}

/// タイマー終了後の選択
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Like,
    Pass,
}

impl Choice {
    /// `handle_user_interaction` に渡す interaction_type
    pub fn interaction_type(&self) -> &'static str {
        match self {
            Choice::Like => "like",
            Choice::Pass => "reject",
        }
    }
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Choice::Like => f.write_str("like"),
            Choice::Pass => f.write_str("pass"),
        }
    }
}

/// 参加者の決定
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub participant_id: UserId,
    pub session_id: SessionId,
    pub choice: Choice,
    pub submitted_at: DateTime<Utc>,
}

/// `handle_user_interaction` の引数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    #[serde(rename = "p_user_id")]
    pub user_id: String,
    #[serde(rename = "p_target_user_id")]
    pub target_user_id: String,
    #[serde(rename = "p_interaction_type")]
    pub interaction_type: String,
    #[serde(rename = "p_chat_id")]
    pub chat_id: String,
}

impl InteractionRequest {
    pub fn from_decision(decision: &Decision, target: &UserId) -> Self {
        Self {
            user_id: decision.participant_id.0.clone(),
            target_user_id: target.0.clone(),
            interaction_type: decision.choice.interaction_type().to_string(),
            chat_id: decision.session_id.0.clone(),
        }
    }
}

/// `handle_user_interaction` の結果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InteractionOutcome {
    #[serde(default)]
    pub is_mutual_match: bool,
}

/// クライアントが書き込める終了ステータス（`completed` は表現できない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndingStatus {
    EndedByDeparture,
    EndedManually,
}

impl From<EndingStatus> for SessionStatus {
    fn from(status: EndingStatus) -> Self {
        match status {
            EndingStatus::EndedByDeparture => SessionStatus::EndedByDeparture,
            EndingStatus::EndedManually => SessionStatus::EndedManually,
        }
    }
}

/// セッション終了の直接更新 `{status, ended_by, ended_at}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: EndingStatus,
    pub ended_by: UserId,
    pub ended_at: DateTime<Utc>,
}
