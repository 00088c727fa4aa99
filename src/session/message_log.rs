//! メッセージログ
//!
//! 確定済みの一覧（下書き・最終）は行の更新からのみ置き換える。
//! 楽観的送信は別の staged リストに置き、成功でコミット、失敗でロールバックする。
//! 表示は下書き→最終の一方向で、最終表示に切り替わったら戻らない。

use chrono::{DateTime, Utc};

use crate::models::{ChatSession, Message, MessageId, SessionStatus, UserId};

/// 送信を受け付けなかった理由（ユーザー操作としては何もしない）
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    #[error("message body is empty")]
    EmptyBody,
    #[error("session is not accepting messages")]
    SessionInactive,
    #[error("no authenticated participant")]
    NotAuthenticated,
}

#[derive(Debug, Clone, PartialEq)]
struct StagedMessage {
    message: Message,
    /// 追記RPCが成功したが、まだ行に現れていない
    delivered: bool,
}

/// 下書き・最終メッセージと送信中メッセージの管理
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    draft: Vec<Message>,
    final_messages: Vec<Message>,
    staged: Vec<StagedMessage>,
    showing_final: bool,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_session(session: &ChatSession) -> Self {
        let mut log = Self::new();
        log.apply_session(session);
        log
    }

    /// 確定した行の内容で一覧を置き換える
    pub fn apply_session(&mut self, session: &ChatSession) {
        self.draft = session.draft_messages.clone();

        if session.status == SessionStatus::Completed {
            if !self.showing_final {
                tracing::info!(
                    "📜 [MESSAGE_LOG] Switching to final messages ({} entries)",
                    session.final_messages.len()
                );
            }
            self.final_messages = session.final_messages.clone();
            self.showing_final = true;
            self.staged.clear();
            return;
        }

        let draft = &self.draft;
        self.staged
            .retain(|staged| !draft.iter().any(|m| m.id == staged.message.id));
    }

    /// 楽観的送信の準備
    ///
    /// `accepting` はセッションが送信を受け付ける状態か（アクティブかつ決定待ちでない）。
    pub fn stage(
        &mut self,
        sender: Option<&UserId>,
        body: &str,
        accepting: bool,
        now: DateTime<Utc>,
    ) -> Result<Message, SendRejected> {
        if !accepting || self.showing_final {
            return Err(SendRejected::SessionInactive);
        }
        let sender = sender.ok_or(SendRejected::NotAuthenticated)?;
        let message = Message::compose(sender, body, now).ok_or(SendRejected::EmptyBody)?;

        self.staged.push(StagedMessage {
            message: message.clone(),
            delivered: false,
        });
        Ok(message)
    }

    /// 追記成功。行に現れるまで表示し続ける
    pub fn commit(&mut self, id: &MessageId) -> bool {
        if self.draft.iter().any(|m| &m.id == id) {
            self.staged.retain(|staged| &staged.message.id != id);
            return true;
        }
        match self.staged.iter_mut().find(|staged| &staged.message.id == id) {
            Some(staged) => {
                staged.delivered = true;
                true
            }
            None => false,
        }
    }

    /// 追記失敗。送信前の表示に戻す
    pub fn rollback(&mut self, id: &MessageId) -> Option<Message> {
        let position = self
            .staged
            .iter()
            .position(|staged| &staged.message.id == id)?;
        Some(self.staged.remove(position).message)
    }

    /// 画面に出すメッセージ
    pub fn visible_messages(&self) -> Vec<Message> {
        if self.showing_final {
            return self.final_messages.clone();
        }

        let mut visible = self.draft.clone();
        visible.extend(self.staged.iter().map(|staged| staged.message.clone()));
        visible
    }

    pub fn is_showing_final(&self) -> bool {
        self.showing_final
    }

    /// まだ行に現れていない送信の数
    pub fn pending_count(&self) -> usize {
        self.staged.len()
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.staged.iter().any(|staged| &staged.message.id == id)
    }
}
