//! 通知・画面遷移
//!
//! コントローラーはグローバルなUI状態を持たず、渡された `UiContext` を通して
//! 通知の表示・遷移・タイマー描画・入力欄の復元を行う。

use parking_lot::Mutex;
use std::sync::Arc;

use crate::models::{Message, SessionId};
use crate::session::timer::TimerSnapshot;

/// 通知の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// トースト相当の通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn load_failed() -> Self {
        Self::new(NoticeLevel::Error, "Error", "Failed to load chat data")
    }

    pub fn send_failed() -> Self {
        Self::new(NoticeLevel::Error, "Error", "Failed to send message")
    }

    pub fn decision_failed() -> Self {
        Self::new(
            NoticeLevel::Error,
            "Error",
            "Could not submit your decision. Please try again.",
        )
    }

    pub fn end_failed() -> Self {
        Self::new(
            NoticeLevel::Error,
            "Error",
            "Could not end the chat. Please try again.",
        )
    }

    pub fn time_up() -> Self {
        Self::new(
            NoticeLevel::Info,
            "Time's up!",
            "Did you feel a spark? Choose like or pass.",
        )
    }

    /// 時間切れ後の送信
    pub fn chat_closed() -> Self {
        Self::new(
            NoticeLevel::Info,
            "Time's up",
            "Messages are closed. Choose like or pass.",
        )
    }

    /// 時間切れ前の決定
    pub fn decision_not_open() -> Self {
        Self::new(
            NoticeLevel::Info,
            "Not yet",
            "You can like or pass once the timer runs out.",
        )
    }

    pub fn waiting_for_partner(partner_name: &str) -> Self {
        Self::new(
            NoticeLevel::Info,
            "Waiting...",
            format!("Waiting for {} to decide.", partner_name),
        )
    }

    pub fn matched() -> Self {
        Self::new(
            NoticeLevel::Success,
            "It's a Match! 💕",
            "Both of you liked each other! Continue chatting.",
        )
    }

    pub fn partner_left(partner_name: &str) -> Self {
        Self::new(
            NoticeLevel::Error,
            "User Left",
            format!("{} has left the speed date.", partner_name),
        )
    }

    pub fn partner_ended(partner_name: &str) -> Self {
        Self::new(
            NoticeLevel::Info,
            "Chat Ended",
            format!("{} ended the speed date.", partner_name),
        )
    }

    pub fn connection_lost() -> Self {
        Self::new(
            NoticeLevel::Error,
            "Connection lost",
            "Live updates are unavailable. The timer and your actions still work.",
        )
    }
}

/// 遷移先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Lobby,
    Conversation(SessionId),
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Route::Lobby => "/lobby".to_string(),
            Route::Conversation(session_id) => format!("/messages/{}", session_id),
        }
    }
}

/// コントローラーに渡すUI操作
pub trait UiContext: Send {
    fn notify(&mut self, notice: Notice);

    fn navigate(&mut self, route: Route);

    fn render_timer(&mut self, _snapshot: &TimerSnapshot) {}

    /// 表示中のメッセージ一覧が変わった
    fn render_messages(&mut self, _messages: &[Message]) {}

    /// 送信失敗時に入力欄へ本文を戻す
    fn restore_input(&mut self, _text: &str) {}
}

/// 記録されたUI操作
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Notice(Notice),
    Navigate(Route),
    Timer(TimerSnapshot),
    RestoreInput(String),
}

/// 呼び出しを記録するだけのUI（テスト・ヘッドレス実行用）
///
/// clone したハンドルは同じ記録を共有する。
#[derive(Debug, Clone, Default)]
pub struct RecordingUi {
    events: Arc<Mutex<Vec<UiEvent>>>,
    rendered: Arc<Mutex<Vec<Message>>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UiEvent::Notice(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn navigations(&self) -> Vec<Route> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UiEvent::Navigate(route) => Some(route.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn restored_inputs(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UiEvent::RestoreInput(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_timer(&self) -> Option<TimerSnapshot> {
        self.events.lock().iter().rev().find_map(|event| match event {
            UiEvent::Timer(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
    }

    /// 最後に描画されたメッセージ一覧
    pub fn rendered_messages(&self) -> Vec<Message> {
        self.rendered.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl UiContext for RecordingUi {
    fn notify(&mut self, notice: Notice) {
        self.events.lock().push(UiEvent::Notice(notice));
    }

    fn navigate(&mut self, route: Route) {
        self.events.lock().push(UiEvent::Navigate(route));
    }

    fn render_timer(&mut self, snapshot: &TimerSnapshot) {
        self.events.lock().push(UiEvent::Timer(snapshot.clone()));
    }

    fn render_messages(&mut self, messages: &[Message]) {
        *self.rendered.lock() = messages.to_vec();
    }

    fn restore_input(&mut self, text: &str) {
        self.events.lock().push(UiEvent::RestoreInput(text.to_string()));
    }
}
