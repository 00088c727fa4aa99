//! チャットセッションコントローラー
//!
//! 1タスクが所有し、ユーザー操作・リアルタイムイベント・1秒ティック・
//! リモート呼び出しの完了・遷移期限を順番に処理する。
//!
//! 状態: Loading → Active → AwaitingDecision → {Completed | EndedByDeparture | EndedManually}
//! 読み込み失敗時は Exited。終端状態は吸収的で、同じ終端の再通知では何もしない。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::{RealtimeEvent, RemoteError, RemoteStateClient, Subscription};
use crate::error::{SessionError, SpeedHeartResult};
use crate::models::{
    ChatRow, ChatSession, Choice, EndingStatus, InteractionOutcome, InteractionRequest, Message,
    MessageId, ParticipantProfile, SessionId, SessionStatus, StatusChange, UserId,
};
use crate::session::decision_gate::{DecisionGate, DecisionRejected, GateState};
use crate::session::message_log::{MessageLog, SendRejected};
use crate::session::notices::{Notice, Route, UiContext};
use crate::session::timer::{Clock, SessionTimer, SystemClock, TimerSnapshot};

/// マッチ成立（および自分で終了した場合）から遷移までの待ち時間
pub const MATCH_NAVIGATION_DELAY: Duration = Duration::from_secs(2);

/// 相手側の終了を見てから遷移までの待ち時間
pub const END_NAVIGATION_DELAY: Duration = Duration::from_secs(3);

/// タイマー再計算の間隔
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// 退出時の終了更新を待つ上限
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// コントローラーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Loading,
    Active,
    AwaitingDecision,
    Completed,
    EndedByDeparture,
    EndedManually,
    Exited,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Completed
                | ControllerState::EndedByDeparture
                | ControllerState::EndedManually
                | ControllerState::Exited
        )
    }

    /// 相手の退出や終了操作を受け付ける状態
    fn is_live(&self) -> bool {
        matches!(
            self,
            ControllerState::Active | ControllerState::AwaitingDecision
        )
    }
}

/// ユーザー操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send(String),
    Decide(Choice),
    RequestEndChat,
    ConfirmEndChat,
    CancelEndChat,
    Leave,
}

/// `run` の終了理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Navigated(Route),
    Left,
    LoadFailed,
    /// 操作チャンネルが閉じた
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EndCause {
    EndChat,
    /// パス記録後の終了更新
    Pass,
    PartnerDeparted(UserId),
}

/// リモート呼び出しの完了通知
#[derive(Debug)]
enum Completion {
    Appended {
        message_id: MessageId,
        body: String,
        result: Result<(), RemoteError>,
    },
    DecisionSubmitted {
        choice: Choice,
        result: Result<InteractionOutcome, RemoteError>,
    },
    StatusUpdated {
        cause: EndCause,
        result: Result<(), RemoteError>,
    },
    RowRefreshed(Result<Option<ChatRow>, RemoteError>),
}

#[derive(Debug, Clone)]
struct PendingNavigation {
    route: Route,
    deadline: Instant,
}

/// チャットセッションの状態機械
pub struct ChatSessionController {
    session_id: SessionId,
    me: Option<UserId>,
    remote: Arc<dyn RemoteStateClient>,
    ui: Box<dyn UiContext>,
    clock: Arc<dyn Clock>,

    state: ControllerState,
    session: Option<ChatSession>,
    partner_id: Option<UserId>,
    partner: Option<ParticipantProfile>,
    log: MessageLog,
    gate: DecisionGate,
    timer: Option<SessionTimer>,
    subscription: Option<Subscription>,

    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,

    end_confirmation_pending: bool,
    end_in_flight: bool,
    departure_in_flight: bool,
    /// パス・終了操作など、自分が終了させた
    self_initiated_end: bool,
    terminal_notice_shown: bool,
    realtime_degraded: bool,
    pending_navigation: Option<PendingNavigation>,
    navigated: bool,
}

impl std::fmt::Debug for ChatSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSessionController")
            .field("session_id", &self.session_id)
            .field("me", &self.me)
            .field("state", &self.state)
            .field("gate", &self.gate.state())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// 購読がなければ永遠に待つ
async fn next_realtime(subscription: &mut Option<Subscription>) -> Option<RealtimeEvent> {
    match subscription.as_mut() {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}

impl ChatSessionController {
    pub fn new(
        session_id: SessionId,
        me: Option<UserId>,
        remote: Arc<dyn RemoteStateClient>,
        ui: Box<dyn UiContext>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            me,
            remote,
            ui,
            clock: Arc::new(SystemClock),
            state: ControllerState::Loading,
            session: None,
            partner_id: None,
            partner: None,
            log: MessageLog::new(),
            gate: DecisionGate::new(),
            timer: None,
            subscription: None,
            completion_tx,
            completion_rx,
            in_flight: 0,
            end_confirmation_pending: false,
            end_in_flight: false,
            departure_in_flight: false,
            self_initiated_end: false,
            terminal_notice_shown: false,
            realtime_degraded: false,
            pending_navigation: None,
            navigated: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    pub fn partner(&self) -> Option<&ParticipantProfile> {
        self.partner.as_ref()
    }

    pub fn visible_messages(&self) -> Vec<Message> {
        self.log.visible_messages()
    }

    pub fn is_showing_final(&self) -> bool {
        self.log.is_showing_final()
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn is_waiting_for_partner(&self) -> bool {
        self.state == ControllerState::AwaitingDecision && self.gate.is_waiting_for_partner()
    }

    pub fn is_end_confirmation_pending(&self) -> bool {
        self.end_confirmation_pending
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn is_realtime_degraded(&self) -> bool {
        self.realtime_degraded
    }

    pub fn timer_snapshot(&self) -> Option<TimerSnapshot> {
        self.timer
            .as_ref()
            .map(|timer| timer.snapshot_at(self.clock.now()))
    }

    /// 予約済みの遷移先（未発火）
    pub fn pending_navigation(&self) -> Option<&Route> {
        self.pending_navigation.as_ref().map(|pending| &pending.route)
    }

    pub fn has_navigated(&self) -> bool {
        self.navigated
    }

    fn render_messages(&mut self) {
        let messages = self.log.visible_messages();
        self.ui.render_messages(&messages);
    }

    fn partner_name(&self) -> String {
        self.partner
            .as_ref()
            .map(|profile| profile.display_name().to_string())
            .unwrap_or_else(|| "The other user".to_string())
    }

    // ------------------------------------------------------------------
    // 読み込み
    // ------------------------------------------------------------------

    /// 行と相手のプロフィールを読み込み、購読を開始する
    pub async fn load(&mut self) -> SpeedHeartResult<()> {
        tracing::info!("🔄 [SESSION] Loading chat {}", self.session_id);
        self.state = ControllerState::Loading;

        let fetched =
            Self::fetch_and_validate(&self.remote, &self.session_id, self.me.as_ref()).await;
        let session = match fetched {
            Ok(session) => session,
            Err(e) => {
                self.fail_load(&e);
                return Err(e);
            }
        };

        if let Some(me) = self.me.clone() {
            let partner_id = session.partner_of(&me).cloned();
            if let Some(partner_id) = partner_id {
                match self.remote.fetch_profile(&partner_id).await {
                    Ok(Some(row)) => self.partner = Some(ParticipantProfile::from_row(&row)),
                    Ok(None) => {
                        let e = SessionError::ProfileLoadFailed {
                            user_id: partner_id.0.clone(),
                            reason: "profile not found".to_string(),
                        };
                        self.fail_load(&e);
                        return Err(e);
                    }
                    Err(remote) => {
                        let e = SessionError::ProfileLoadFailed {
                            user_id: partner_id.0.clone(),
                            reason: remote.to_string(),
                        };
                        self.fail_load(&e);
                        return Err(e);
                    }
                }
                self.partner_id = Some(partner_id);
            }
        } else {
            tracing::warn!(
                "⚠️ [SESSION] No authenticated user, chat {} is read-only",
                self.session_id
            );
        }

        self.timer = SessionTimer::start(session.started_at);
        if self.timer.is_none() {
            tracing::warn!(
                "⚠️ [SESSION] Chat {} has no start time, countdown disabled",
                self.session_id
            );
        }
        self.log = MessageLog::from_session(&session);
        let status = session.status;
        self.session = Some(session);
        self.render_messages();

        match self.remote.subscribe(&self.session_id, self.me.as_ref()).await {
            Ok(subscription) => {
                tracing::info!("📡 [SESSION] Subscribed to {}", subscription.topic());
                self.subscription = Some(subscription);
            }
            Err(e) => self.degrade_realtime(&e.to_string()),
        }

        self.state = ControllerState::Active;
        tracing::info!(
            "✅ [SESSION] Chat {} loaded ({} messages, partner: {})",
            self.session_id,
            self.log.visible_messages().len(),
            self.partner_name()
        );

        if status.is_terminal() {
            self.observe_status(status);
        } else {
            self.tick();
            // 取得から購読開始までの間の変更を拾う
            if self.subscription.is_some() {
                self.spawn_refresh();
            }
        }
        Ok(())
    }

    async fn fetch_and_validate(
        remote: &Arc<dyn RemoteStateClient>,
        session_id: &SessionId,
        me: Option<&UserId>,
    ) -> SpeedHeartResult<ChatSession> {
        let row = match remote.fetch_session(session_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(SessionError::not_found(session_id.0.clone())),
            Err(e) => {
                tracing::error!("❌ [SESSION] Failed to fetch chat {}: {}", session_id, e);
                return Err(SessionError::not_found(session_id.0.clone()));
            }
        };

        let session = ChatSession::from_row(&row)?;
        if let Some(me) = me {
            if !session.has_participant(me) {
                tracing::warn!(
                    "🚫 [SESSION] {} is not a participant of chat {}",
                    me,
                    session_id
                );
                return Err(SessionError::not_found(session_id.0.clone()));
            }
        }
        Ok(session)
    }

    fn fail_load(&mut self, error: &SessionError) {
        tracing::error!("❌ [SESSION] Load failed: {}", error);
        self.state = ControllerState::Exited;
        self.ui.notify(Notice::load_failed());
        self.ui.navigate(Route::Lobby);
        self.navigated = true;
        self.teardown();
    }

    // ------------------------------------------------------------------
    // ユーザー操作
    // ------------------------------------------------------------------

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send(body) => {
                if let Err(SendRejected::SessionInactive) = self.send(&body) {
                    if self.state == ControllerState::AwaitingDecision {
                        self.ui.notify(Notice::chat_closed());
                    }
                }
            }
            SessionCommand::Decide(choice) => {
                if let Err(DecisionRejected::NotOpen) = self.decide(choice) {
                    if self.state == ControllerState::Active {
                        self.ui.notify(Notice::decision_not_open());
                    }
                }
            }
            SessionCommand::RequestEndChat => {
                self.request_end_chat();
            }
            SessionCommand::ConfirmEndChat => {
                self.confirm_end_chat();
            }
            SessionCommand::CancelEndChat => self.cancel_end_chat(),
            SessionCommand::Leave => {
                self.begin_leave();
            }
        }
    }

    /// メッセージ送信（楽観的に表示し、追記RPCを発行）
    pub fn send(&mut self, body: &str) -> Result<MessageId, SendRejected> {
        let accepting = self.state == ControllerState::Active;
        let message = self
            .log
            .stage(self.me.as_ref(), body, accepting, self.clock.now())
            .map_err(|rejected| {
                tracing::debug!("🚫 [SESSION] Send rejected: {}", rejected);
                rejected
            })?;

        let remote = Arc::clone(&self.remote);
        let session_id = self.session_id.clone();
        let wire = message.to_wire();
        let message_id = message.id.clone();
        let body = message.body.clone();
        tracing::debug!("📤 [SESSION] Sending {}", message_id);
        self.render_messages();

        self.spawn_remote(async move {
            let result = remote.append_message(&session_id, &wire).await;
            Completion::Appended {
                message_id,
                body,
                result,
            }
        });
        Ok(message.id)
    }

    /// いいね／パスの送信
    pub fn decide(&mut self, choice: Choice) -> Result<(), DecisionRejected> {
        if self.state != ControllerState::AwaitingDecision {
            let rejected = if self.state.is_terminal() {
                DecisionRejected::AlreadyDecided(choice)
            } else {
                DecisionRejected::NotOpen
            };
            tracing::debug!("🚫 [SESSION] Decision rejected: {}", rejected);
            return Err(rejected);
        }
        let Some(partner_id) = self.partner_id.clone() else {
            return Err(DecisionRejected::NotAuthenticated);
        };

        // パス記録済みで終了更新だけが未完了なら、終了更新のみ再送する
        if self.gate.state() == GateState::Accepted(Choice::Pass) && choice == Choice::Pass {
            if self.end_in_flight {
                return Err(DecisionRejected::InFlight(Choice::Pass));
            }
            tracing::info!("🔁 [SESSION] Retrying pass status for chat {}", self.session_id);
            self.submit_pass_status();
            return Ok(());
        }

        let decision = self
            .gate
            .begin(choice, self.me.as_ref(), &self.session_id, self.clock.now())
            .map_err(|rejected| {
                tracing::debug!("🚫 [SESSION] Decision rejected: {}", rejected);
                rejected
            })?;

        let remote = Arc::clone(&self.remote);
        let request = InteractionRequest::from_decision(&decision, &partner_id);
        tracing::info!("💌 [SESSION] Submitting '{}' for chat {}", choice, self.session_id);

        self.spawn_remote(async move {
            let result = remote.handle_user_interaction(&request).await;
            Completion::DecisionSubmitted { choice, result }
        });
        Ok(())
    }

    /// パス後の `ended_manually` 更新
    fn submit_pass_status(&mut self) {
        if !self.state.is_live() || self.end_in_flight {
            return;
        }
        let Some(me) = self.me.clone() else {
            return;
        };

        self.end_in_flight = true;
        self.self_initiated_end = true;
        let change = StatusChange {
            status: EndingStatus::EndedManually,
            ended_by: me,
            ended_at: self.clock.now(),
        };
        self.spawn_status_update(EndCause::Pass, change);
    }

    /// 終了の確認を求める
    pub fn request_end_chat(&mut self) -> bool {
        if !self.state.is_live() || self.end_in_flight {
            return false;
        }
        self.end_confirmation_pending = true;
        true
    }

    pub fn cancel_end_chat(&mut self) {
        self.end_confirmation_pending = false;
    }

    /// 確認後にチャットを終了する
    pub fn confirm_end_chat(&mut self) -> bool {
        if !self.end_confirmation_pending {
            return false;
        }
        self.end_confirmation_pending = false;
        if !self.state.is_live() || self.end_in_flight {
            return false;
        }
        let Some(me) = self.me.clone() else {
            return false;
        };

        self.end_in_flight = true;
        self.self_initiated_end = true;
        tracing::info!("🔚 [SESSION] Ending chat {}", self.session_id);

        let change = StatusChange {
            status: EndingStatus::EndedManually,
            ended_by: me,
            ended_at: self.clock.now(),
        };
        self.spawn_status_update(EndCause::EndChat, change);
        true
    }

    /// 画面を離れる（ベストエフォートで退出を記録）
    pub async fn leave(&mut self) -> SessionExit {
        if let Some(handle) = self.begin_leave() {
            if tokio::time::timeout(LEAVE_TIMEOUT, handle).await.is_err() {
                tracing::warn!("⏰ [SESSION] Departure update timed out");
            }
        }
        SessionExit::Left
    }

    fn begin_leave(&mut self) -> Option<JoinHandle<()>> {
        let handle = match (&self.me, self.state.is_live()) {
            (Some(me), true) => {
                let remote = Arc::clone(&self.remote);
                let session_id = self.session_id.clone();
                let change = StatusChange {
                    status: EndingStatus::EndedByDeparture,
                    ended_by: me.clone(),
                    ended_at: self.clock.now(),
                };
                tracing::info!("🚪 [SESSION] Leaving chat {}", self.session_id);
                Some(tokio::spawn(async move {
                    match remote.update_status(&session_id, &change).await {
                        Ok(()) => tracing::info!("✅ [SESSION] Departure recorded"),
                        Err(e) => tracing::warn!("⚠️ [SESSION] Departure not recorded: {}", e),
                    }
                }))
            }
            _ => None,
        };

        self.state = ControllerState::Exited;
        self.pending_navigation = None;
        self.teardown();
        handle
    }

    // ------------------------------------------------------------------
    // タイマー
    // ------------------------------------------------------------------

    /// 残り時間を再計算し、0になったら決定待ちへ
    pub fn tick(&mut self) {
        if self.state != ControllerState::Active {
            return;
        }
        let Some(snapshot) = self.timer_snapshot() else {
            return;
        };
        self.ui.render_timer(&snapshot);

        if snapshot.expired {
            tracing::info!("⏰ [SESSION] Time is up for chat {}", self.session_id);
            self.state = ControllerState::AwaitingDecision;
            self.gate.open();
            self.ui.notify(Notice::time_up());
        }
    }

    // ------------------------------------------------------------------
    // リアルタイム
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::RowUpdated(row) => self.apply_row(&row),
            RealtimeEvent::PresenceJoined(user_id) => {
                tracing::debug!("👋 [SESSION] {} joined", user_id);
            }
            RealtimeEvent::PresenceLeft(user_id) => self.on_presence_left(user_id),
            RealtimeEvent::Reconnecting { attempt } => {
                tracing::warn!("🔄 [SESSION] Realtime reconnecting (attempt {})", attempt);
            }
            RealtimeEvent::Resubscribed => {
                // 切断中のプッシュは届かないので行を読み直す
                tracing::info!("🔄 [SESSION] Realtime resubscribed, re-reading chat");
                if self.state.is_live() {
                    self.spawn_refresh();
                }
            }
            RealtimeEvent::Disconnected { reason } => self.degrade_realtime(&reason),
        }
    }

    fn apply_row(&mut self, row: &ChatRow) {
        if row.chat_id != self.session_id.0 {
            tracing::debug!("🔍 [SESSION] Ignoring row for chat {}", row.chat_id);
            return;
        }
        if self.state.is_terminal() || self.state == ControllerState::Loading {
            return;
        }
        let session = match ChatSession::from_row(row) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("⚠️ [SESSION] Ignoring pushed row: {}", e);
                return;
            }
        };

        self.log.apply_session(&session);
        let status = session.status;
        self.session = Some(session);
        self.render_messages();
        self.observe_status(status);
    }

    fn on_presence_left(&mut self, user_id: UserId) {
        if self.partner_id.as_ref() != Some(&user_id) {
            tracing::debug!("👋 [SESSION] {} left", user_id);
            return;
        }
        if !self.state.is_live() || self.departure_in_flight || self.end_in_flight {
            return;
        }

        tracing::warn!("🚪 [SESSION] Partner {} left chat {}", user_id, self.session_id);
        self.departure_in_flight = true;
        let change = StatusChange {
            status: EndingStatus::EndedByDeparture,
            ended_by: user_id.clone(),
            ended_at: self.clock.now(),
        };
        self.spawn_status_update(EndCause::PartnerDeparted(user_id), change);
    }

    fn degrade_realtime(&mut self, reason: &str) {
        let error = SessionError::RealtimeDisconnected {
            reason: reason.to_string(),
        };
        tracing::warn!("⚠️ [SESSION] {}", error);
        self.subscription = None;
        if !self.realtime_degraded {
            self.realtime_degraded = true;
            if !self.state.is_terminal() {
                self.ui.notify(Notice::connection_lost());
            }
        }
    }

    /// 届いているイベントをすべて処理する
    pub fn drain_realtime(&mut self) {
        while let Some(event) = self
            .subscription
            .as_mut()
            .and_then(|subscription| subscription.try_next_event())
        {
            self.handle_event(event);
        }
    }

    // ------------------------------------------------------------------
    // 終端状態
    // ------------------------------------------------------------------

    fn observe_status(&mut self, status: SessionStatus) {
        match status {
            SessionStatus::Active => {}
            SessionStatus::Completed => self.enter_completed(),
            SessionStatus::EndedByDeparture => self.enter_ended(EndingStatus::EndedByDeparture),
            SessionStatus::EndedManually => self.enter_ended(EndingStatus::EndedManually),
        }
    }

    fn enter_completed(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("💕 [SESSION] Chat {} completed with a match", self.session_id);
        self.state = ControllerState::Completed;
        self.end_confirmation_pending = false;
        if !self.terminal_notice_shown {
            self.terminal_notice_shown = true;
            self.ui.notify(Notice::matched());
        }
        self.schedule_navigation(
            Route::Conversation(self.session_id.clone()),
            MATCH_NAVIGATION_DELAY,
        );
    }

    fn enter_ended(&mut self, status: EndingStatus) {
        if self.state.is_terminal() {
            return;
        }
        let ended_by = self.session.as_ref().and_then(|s| s.ended_by.clone());
        let self_caused = self.self_initiated_end
            || (status == EndingStatus::EndedManually
                && ended_by.is_some()
                && ended_by == self.me);

        self.state = match status {
            EndingStatus::EndedByDeparture => ControllerState::EndedByDeparture,
            EndingStatus::EndedManually => ControllerState::EndedManually,
        };
        self.end_confirmation_pending = false;
        tracing::info!(
            "🔚 [SESSION] Chat {} ended ({}, by {:?}, self: {})",
            self.session_id,
            SessionStatus::from(status),
            ended_by,
            self_caused
        );

        if self_caused {
            self.schedule_navigation(Route::Lobby, MATCH_NAVIGATION_DELAY);
            return;
        }

        if !self.terminal_notice_shown {
            self.terminal_notice_shown = true;
            let name = self.partner_name();
            let notice = match status {
                EndingStatus::EndedByDeparture => Notice::partner_left(&name),
                EndingStatus::EndedManually => Notice::partner_ended(&name),
            };
            self.ui.notify(notice);
        }
        self.schedule_navigation(Route::Lobby, END_NAVIGATION_DELAY);
    }

    fn schedule_navigation(&mut self, route: Route, delay: Duration) {
        if self.pending_navigation.is_some() || self.navigated {
            return;
        }
        tracing::debug!("🧭 [SESSION] Navigating to {} in {:?}", route.path(), delay);
        self.pending_navigation = Some(PendingNavigation {
            route,
            deadline: Instant::now() + delay,
        });
    }

    /// 期限の来た遷移を実行する
    pub fn poll_navigation(&mut self) -> Option<Route> {
        let due = self
            .pending_navigation
            .as_ref()
            .map(|pending| pending.deadline <= Instant::now())
            .unwrap_or(false);
        if due {
            self.fire_navigation()
        } else {
            None
        }
    }

    fn fire_navigation(&mut self) -> Option<Route> {
        let pending = self.pending_navigation.take()?;
        tracing::info!("🧭 [SESSION] Navigating to {}", pending.route.path());
        self.ui.navigate(pending.route.clone());
        self.navigated = true;
        self.teardown();
        Some(pending.route)
    }

    fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    // ------------------------------------------------------------------
    // リモート呼び出し
    // ------------------------------------------------------------------

    fn spawn_remote<F>(&mut self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight += 1;
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let completion = call.await;
            let _ = completion_tx.send(completion);
        });
    }

    fn spawn_status_update(&mut self, cause: EndCause, change: StatusChange) {
        let remote = Arc::clone(&self.remote);
        let session_id = self.session_id.clone();
        self.spawn_remote(async move {
            let result = remote.update_status(&session_id, &change).await;
            Completion::StatusUpdated { cause, result }
        });
    }

    fn spawn_refresh(&mut self) {
        let remote = Arc::clone(&self.remote);
        let session_id = self.session_id.clone();
        self.spawn_remote(async move {
            Completion::RowRefreshed(remote.fetch_session(&session_id).await)
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.state == ControllerState::Exited || self.navigated {
            tracing::debug!("🗑️ [SESSION] Dropping late completion: {:?}", completion);
            return;
        }

        match completion {
            Completion::Appended {
                message_id,
                body,
                result,
            } => match result {
                Ok(()) => {
                    self.log.commit(&message_id);
                    tracing::debug!("✅ [SESSION] Delivered {}", message_id);
                }
                Err(e) => {
                    let error = SessionError::MessageDeliveryFailed {
                        reason: e.to_string(),
                    };
                    tracing::error!("❌ [SESSION] {}", error);
                    if self.log.rollback(&message_id).is_some() && !self.state.is_terminal() {
                        self.render_messages();
                        self.ui.notify(Notice::send_failed());
                        self.ui.restore_input(&body);
                    }
                }
            },
            Completion::DecisionSubmitted { choice, result } => {
                self.on_decision_completed(choice, result)
            }
            Completion::StatusUpdated { cause, result } => self.on_status_updated(cause, result),
            Completion::RowRefreshed(result) => match result {
                Ok(Some(row)) => self.apply_row(&row),
                Ok(None) => tracing::warn!("⚠️ [SESSION] Chat {} vanished", self.session_id),
                Err(e) => tracing::warn!("⚠️ [SESSION] Failed to re-read chat: {}", e),
            },
        }
    }

    fn on_decision_completed(&mut self, choice: Choice, result: Result<InteractionOutcome, RemoteError>) {
        match result {
            Ok(outcome) => {
                self.gate.accept();
                tracing::info!(
                    "✅ [SESSION] Decision '{}' accepted (mutual match: {})",
                    choice,
                    outcome.is_mutual_match
                );
                match choice {
                    Choice::Pass => self.submit_pass_status(),
                    Choice::Like if outcome.is_mutual_match => self.spawn_refresh(),
                    Choice::Like => {
                        if !self.state.is_terminal() {
                            let name = self.partner_name();
                            self.ui.notify(Notice::waiting_for_partner(&name));
                        }
                    }
                }
            }
            Err(e) => {
                let error = SessionError::DecisionSubmissionFailed {
                    reason: e.to_string(),
                };
                tracing::error!("❌ [SESSION] {}", error);
                self.gate.fail();
                if !self.state.is_terminal() {
                    self.ui.notify(Notice::decision_failed());
                }
            }
        }
    }

    fn on_status_updated(&mut self, cause: EndCause, result: Result<(), RemoteError>) {
        match cause {
            EndCause::EndChat | EndCause::Pass => {
                self.end_in_flight = false;
                match result {
                    Ok(()) => self.enter_ended(EndingStatus::EndedManually),
                    Err(e) => {
                        tracing::error!("❌ [SESSION] Failed to end chat ({:?}): {}", cause, e);
                        self.self_initiated_end = false;
                        if !self.state.is_terminal() {
                            // パスの場合はゲートを Accepted(Pass) のまま残し、再送はパスのみ
                            let notice = if cause == EndCause::Pass {
                                Notice::decision_failed()
                            } else {
                                Notice::end_failed()
                            };
                            self.ui.notify(notice);
                        }
                    }
                }
            }
            EndCause::PartnerDeparted(partner_id) => {
                self.departure_in_flight = false;
                match result {
                    Ok(()) => {
                        if let Some(session) = self.session.as_mut() {
                            if session.ended_by.is_none() {
                                session.ended_by = Some(partner_id);
                            }
                        }
                        self.enter_ended(EndingStatus::EndedByDeparture);
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ [SESSION] Failed to record partner departure: {}", e)
                    }
                }
            }
        }
    }

    /// 実行中のリモート呼び出しがすべて完了し、届いたイベントを処理し終えるまで待つ
    pub async fn settle(&mut self) {
        loop {
            self.drain_realtime();
            if self.in_flight == 0 {
                break;
            }
            match self.completion_rx.recv().await {
                Some(completion) => self.handle_completion(completion),
                None => break,
            }
        }
        self.drain_realtime();
    }

    // ------------------------------------------------------------------
    // イベントループ
    // ------------------------------------------------------------------

    /// 読み込みから遷移・退出までを1タスクで処理する
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) -> SessionExit {
        if self.state == ControllerState::Loading && self.load().await.is_err() {
            return SessionExit::LoadFailed;
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.pending_navigation.as_ref().map(|p| p.deadline);
            let ticking = self.state == ControllerState::Active && self.timer.is_some();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Leave) => return self.leave().await,
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("⏹️ [SESSION] Command channel closed");
                        self.teardown();
                        return SessionExit::Closed;
                    }
                },
                event = next_realtime(&mut self.subscription) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.degrade_realtime("subscription closed"),
                },
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                _ = ticker.tick(), if ticking => self.tick(),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(route) = self.fire_navigation() {
                        return SessionExit::Navigated(route);
                    }
                }
            }
        }
    }
}
