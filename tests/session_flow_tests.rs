//! セッションフロー統合テスト
//!
//! インメモリバックエンド・記録用UI・手動時計でコントローラー全体を動かす。

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use speedheart::{
    api::{
        realtime::{interpret_frame, FrameAction, PhoenixFrame, PresenceTracker},
        FailurePlan, InMemoryBackend, RealtimeEvent,
    },
    models::{ChatRow, Choice, InteractionRequest, MessageId, ProfileRow, SessionId, UserId},
    session::{
        ChatSessionController, ControllerState, DecisionRejected, GateState, ManualClock, Notice,
        RecordingUi, Route, SendRejected, SessionCommand, SessionExit, END_NAVIGATION_DELAY,
        MATCH_NAVIGATION_DELAY, SESSION_DURATION,
    },
    SessionError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CHAT: &str = "chat-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 23, 22, 0, 0).unwrap()
}

fn wire(id: &str, text: &str, sender: &str) -> Value {
    json!({"id": id, "text": text, "sender_id": sender, "timestamp": "2025-07-23T22:00:30Z"})
}

fn me() -> UserId {
    UserId("user1".to_string())
}

fn partner() -> UserId {
    UserId("user2".to_string())
}

fn seeded_backend(started_at: Option<DateTime<Utc>>) -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new());
    backend.insert_session(ChatRow::new_active(CHAT, "user1", "user2", started_at));
    backend.insert_profile(ProfileRow {
        id: "user2".to_string(),
        name: Some("Sam".to_string()),
        age: Some(29),
        bio: Some("Coffee first".to_string()),
        photo_url: None,
        preferences: Some(json!({"interests": ["jazz"]})),
    });
    backend
}

struct Harness {
    backend: Arc<InMemoryBackend>,
    ui: RecordingUi,
    clock: ManualClock,
    controller: ChatSessionController,
}

impl Harness {
    fn new(backend: Arc<InMemoryBackend>, user: Option<UserId>) -> Self {
        let ui = RecordingUi::new();
        let clock = ManualClock::new(t0());
        let controller = ChatSessionController::new(
            SessionId(CHAT.to_string()),
            user,
            backend.clone(),
            Box::new(ui.clone()),
        )
        .with_clock(Arc::new(clock.clone()));
        Self {
            backend,
            ui,
            clock,
            controller,
        }
    }

    async fn loaded(started_at: Option<DateTime<Utc>>) -> Self {
        let mut harness = Self::new(seeded_backend(started_at), Some(me()));
        harness.controller.load().await.unwrap();
        harness
    }

    fn expire(&mut self) {
        self.clock.advance(SESSION_DURATION);
        self.controller.tick();
        assert_eq!(self.controller.state(), ControllerState::AwaitingDecision);
    }

    fn notice_count(&self, notice: &Notice) -> usize {
        self.ui.notices().iter().filter(|n| *n == notice).count()
    }
}

/// 読み込みテスト
#[cfg(test)]
mod load_tests {
    use super::*;

    #[tokio::test]
    async fn test_load_active_session() {
        let harness = Harness::loaded(Some(t0())).await;

        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert_eq!(harness.controller.partner().unwrap().headline(), "Sam, 29");
        assert_eq!(harness.controller.timer_snapshot().unwrap().clock, "3:00");
        assert!(harness.ui.notices().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_navigates_to_lobby() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut harness = Harness::new(backend, Some(me()));

        let err = harness.controller.load().await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound { .. }));
        assert_eq!(harness.controller.state(), ControllerState::Exited);
        assert_eq!(harness.ui.notices(), vec![Notice::load_failed()]);
        assert_eq!(harness.ui.navigations(), vec![Route::Lobby]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_treated_as_not_found() {
        let backend = seeded_backend(Some(t0()));
        backend.set_failures(FailurePlan {
            fetch_session: true,
            ..FailurePlan::default()
        });
        let mut harness = Harness::new(backend, Some(me()));

        let err = harness.controller.load().await.unwrap_err();
        assert!(err.is_blocking());
        assert_eq!(harness.ui.navigations(), vec![Route::Lobby]);
    }

    #[tokio::test]
    async fn test_non_participant_is_turned_away() {
        let mut harness = Harness::new(
            seeded_backend(Some(t0())),
            Some(UserId("user3".to_string())),
        );

        assert!(harness.controller.load().await.is_err());
        assert_eq!(harness.ui.navigations(), vec![Route::Lobby]);
        assert_eq!(harness.backend.call_counts().subscribe, 0);
    }

    #[tokio::test]
    async fn test_profile_failure_blocks_the_session() {
        let backend = seeded_backend(Some(t0()));
        backend.set_failures(FailurePlan {
            fetch_profile: true,
            ..FailurePlan::default()
        });
        let mut harness = Harness::new(backend, Some(me()));

        let err = harness.controller.load().await.unwrap_err();
        assert!(matches!(err, SessionError::ProfileLoadFailed { .. }));
        assert_eq!(harness.ui.navigations(), vec![Route::Lobby]);
    }

    #[tokio::test]
    async fn test_missing_start_time_disables_countdown() {
        let mut harness = Harness::loaded(None).await;

        assert!(harness.controller.timer_snapshot().is_none());
        harness.clock.advance(Duration::from_secs(3600));
        harness.controller.tick();
        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert!(harness.controller.send("still chatting").is_ok());
    }

    #[tokio::test]
    async fn test_change_between_fetch_and_subscribe_is_seen() {
        let backend = seeded_backend(Some(t0()));
        backend.set_muted(true);
        let mut harness = Harness::new(backend, Some(me()));
        harness.controller.load().await.unwrap();

        // 読み込み直後、プッシュが届かないまま相手が終了した
        harness.backend.mutate_session(CHAT, |row| {
            row.status = "ended_manually".to_string();
            row.ended_by = Some("user2".to_string());
        });
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedManually);
        assert_eq!(harness.notice_count(&Notice::partner_ended("Sam")), 1);
        assert_eq!(harness.backend.call_counts().fetch_session, 2);
    }

    #[tokio::test]
    async fn test_already_completed_session_goes_to_conversation() {
        let backend = seeded_backend(Some(t0()));
        backend.mutate_session(CHAT, |row| row.status = "completed".to_string());
        let mut harness = Harness::new(backend, Some(me()));

        harness.controller.load().await.unwrap();
        assert_eq!(harness.controller.state(), ControllerState::Completed);
        assert_eq!(
            harness.controller.pending_navigation(),
            Some(&Route::Conversation(SessionId(CHAT.to_string())))
        );
    }
}

/// タイマーテスト
#[cfg(test)]
mod timer_tests {
    use super::*;

    #[tokio::test]
    async fn test_started_long_ago_is_expired_on_first_evaluation() {
        let harness = Harness::loaded(Some(t0() - chrono::Duration::seconds(181))).await;

        let snapshot = harness.controller.timer_snapshot().unwrap();
        assert_eq!(snapshot.remaining_secs, 0);
        assert!(snapshot.expired);
        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);
        assert_eq!(harness.controller.gate_state(), GateState::Open);
    }

    #[tokio::test]
    async fn test_ticks_never_increase_remaining_time() {
        let mut harness = Harness::loaded(Some(t0())).await;
        let mut previous = harness.controller.timer_snapshot().unwrap().remaining_secs;

        for _ in 0..200 {
            harness.clock.advance(Duration::from_secs(1));
            harness.controller.tick();
            let remaining = harness.controller.timer_snapshot().unwrap().remaining_secs;
            assert!(remaining <= previous);
            previous = remaining;
        }
        assert_eq!(previous, 0);
        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);
        assert_eq!(harness.notice_count(&Notice::time_up()), 1);
    }

    #[tokio::test]
    async fn test_rendered_timer_tracks_clock() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.clock.advance(Duration::from_secs(155));
        harness.controller.tick();

        let snapshot = harness.ui.last_timer().unwrap();
        assert_eq!(snapshot.clock, "0:25");
        assert!(snapshot.low_time);
    }
}

/// メッセージ送信テスト
#[cfg(test)]
mod message_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_send_appends_to_view() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.controller.send("Hi!").unwrap();
        harness.controller.settle().await;

        let visible = harness.controller.visible_messages();
        let last = visible.last().unwrap();
        assert_eq!(last.body, "Hi!");
        assert_eq!(last.sender_id, me());
        assert_eq!(visible.len(), 1);
        assert_eq!(harness.backend.call_counts().append_message, 1);
        assert_eq!(harness.ui.rendered_messages(), visible);
    }

    #[tokio::test]
    async fn test_failed_send_restores_previous_view() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.controller.send("first").unwrap();
        harness.controller.settle().await;
        let before = harness.controller.visible_messages();

        harness.backend.set_failures(FailurePlan {
            append_message: true,
            ..FailurePlan::default()
        });
        harness.controller.send("Hi!").unwrap();
        assert_eq!(harness.controller.visible_messages().len(), before.len() + 1);

        harness.controller.settle().await;
        assert_eq!(harness.controller.visible_messages(), before);
        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert_eq!(harness.notice_count(&Notice::send_failed()), 1);
        assert_eq!(harness.ui.restored_inputs(), vec!["Hi!".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_bodies_never_reach_the_backend() {
        let mut harness = Harness::loaded(Some(t0())).await;

        assert_eq!(harness.controller.send(""), Err(SendRejected::EmptyBody));
        assert_eq!(harness.controller.send("   "), Err(SendRejected::EmptyBody));
        harness.controller.settle().await;
        assert_eq!(harness.backend.call_counts().append_message, 0);
        assert!(harness.controller.visible_messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_rejected_once_time_is_up() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.expire();

        assert_eq!(
            harness.controller.send("one more thing"),
            Err(SendRejected::SessionInactive)
        );
        harness.controller.settle().await;
        assert_eq!(harness.backend.call_counts().append_message, 0);
        assert!(harness.controller.visible_messages().is_empty());
    }

    #[tokio::test]
    async fn test_typed_commands_explain_rejections() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.controller.handle_command(SessionCommand::Decide(Choice::Like));
        assert_eq!(harness.notice_count(&Notice::decision_not_open()), 1);

        harness.expire();
        harness
            .controller
            .handle_command(SessionCommand::Send("one more thing".to_string()));
        assert_eq!(harness.notice_count(&Notice::chat_closed()), 1);

        harness.controller.settle().await;
        assert_eq!(harness.backend.call_counts().append_message, 0);
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 0);
    }

    #[tokio::test]
    async fn test_send_rejected_without_user() {
        let mut harness = Harness::new(seeded_backend(Some(t0())), None);
        harness.controller.load().await.unwrap();

        assert_eq!(
            harness.controller.send("hello"),
            Err(SendRejected::NotAuthenticated)
        );
        assert_eq!(harness.backend.call_counts().append_message, 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_independent() {
        let mut harness = Harness::loaded(Some(t0())).await;

        let first = harness.controller.send("one").unwrap();
        let second = harness.controller.send("two").unwrap();
        assert_ne!(first, second);
        harness.controller.settle().await;

        let bodies: Vec<String> = harness
            .controller
            .visible_messages()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies.len(), 2);
        assert!(bodies.contains(&"one".to_string()));
        assert!(bodies.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_partner_messages_arrive_by_push() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.backend.mutate_session(CHAT, |row| {
            row.temporary_messages = Some(json!([
                wire("p1", "Hey there", "user2"),
                {"id": "broken"}
            ]));
        });
        harness.controller.settle().await;

        let visible = harness.controller.visible_messages();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, MessageId("p1".to_string()));
        assert_eq!(visible[0].sender_id, partner());
    }
}

/// 決定テスト
#[cfg(test)]
mod decision_tests {
    use super::*;

    fn partner_likes(backend: &InMemoryBackend) {
        backend.record_interaction(&InteractionRequest {
            user_id: "user2".to_string(),
            target_user_id: "user1".to_string(),
            interaction_type: "like".to_string(),
            chat_id: CHAT.to_string(),
        });
    }

    #[tokio::test]
    async fn test_decision_closed_before_expiry() {
        let mut harness = Harness::loaded(Some(t0())).await;

        assert_eq!(
            harness.controller.decide(Choice::Like),
            Err(DecisionRejected::NotOpen)
        );
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 0);
    }

    #[tokio::test]
    async fn test_double_like_issues_one_call() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.expire();

        assert!(harness.controller.decide(Choice::Like).is_ok());
        assert_eq!(
            harness.controller.decide(Choice::Like),
            Err(DecisionRejected::InFlight(Choice::Like))
        );
        harness.controller.settle().await;

        assert_eq!(
            harness.controller.decide(Choice::Like),
            Err(DecisionRejected::AlreadyDecided(Choice::Like))
        );
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 1);
    }

    #[tokio::test]
    async fn test_like_without_match_waits_for_partner() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.expire();

        harness.controller.decide(Choice::Like).unwrap();
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);
        assert!(harness.controller.is_waiting_for_partner());
        assert_eq!(
            harness.notice_count(&Notice::waiting_for_partner("Sam")),
            1
        );
        assert_eq!(harness.backend.session(CHAT).unwrap().status, "active");
        assert!(harness.controller.pending_navigation().is_none());

        // The partner's like later completes the session
        partner_likes(&harness.backend);
        harness.controller.settle().await;
        assert_eq!(harness.controller.state(), ControllerState::Completed);
        assert_eq!(harness.notice_count(&Notice::matched()), 1);
    }

    #[tokio::test]
    async fn test_mutual_match_rereads_row_when_push_is_missed() {
        let mut harness = Harness::loaded(Some(t0())).await;
        partner_likes(&harness.backend);
        harness.backend.set_muted(true);
        harness.expire();

        harness.controller.decide(Choice::Like).unwrap();
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::Completed);
        assert!(harness.controller.is_showing_final());
        // 読み込み・購読後の読み直し・マッチ後の読み直し
        assert_eq!(harness.backend.call_counts().fetch_session, 3);
        assert_eq!(
            harness.controller.pending_navigation(),
            Some(&Route::Conversation(SessionId(CHAT.to_string())))
        );
    }

    #[tokio::test]
    async fn test_pass_ends_session_without_any_push() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.backend.set_muted(true);
        harness.expire();

        harness.controller.decide(Choice::Pass).unwrap();
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedManually);
        assert_eq!(harness.controller.pending_navigation(), Some(&Route::Lobby));
        assert_eq!(harness.notice_count(&Notice::partner_left("Sam")), 0);
        assert_eq!(harness.notice_count(&Notice::partner_ended("Sam")), 0);

        let row = harness.backend.session(CHAT).unwrap();
        assert_eq!(row.status, "ended_manually");
        assert_eq!(row.ended_by.as_deref(), Some("user1"));
        assert!(row.ended_at.is_some());
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 1);
        assert_eq!(harness.backend.call_counts().update_status, 1);
    }

    #[tokio::test]
    async fn test_pass_with_failed_status_write_stays_a_pass() {
        let mut harness = Harness::loaded(Some(t0())).await;
        partner_likes(&harness.backend);
        harness.backend.set_failures(FailurePlan {
            update_status: true,
            ..FailurePlan::default()
        });
        harness.expire();

        harness.controller.decide(Choice::Pass).unwrap();
        harness.controller.settle().await;

        // rejectは記録済み。終了更新だけが失敗した
        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);
        assert_eq!(harness.controller.gate_state(), GateState::Accepted(Choice::Pass));
        assert_eq!(harness.notice_count(&Notice::decision_failed()), 1);
        assert_eq!(
            harness.controller.decide(Choice::Like),
            Err(DecisionRejected::AlreadyDecided(Choice::Pass))
        );
        harness.controller.settle().await;
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 1);
        assert_eq!(harness.backend.session(CHAT).unwrap().status, "active");

        // 再送は終了更新のみ
        harness.backend.clear_failures();
        harness.controller.decide(Choice::Pass).unwrap();
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedManually);
        assert_eq!(harness.notice_count(&Notice::matched()), 0);
        let row = harness.backend.session(CHAT).unwrap();
        assert_eq!(row.status, "ended_manually");
        assert_eq!(row.ended_by.as_deref(), Some("user1"));
        assert_eq!(harness.backend.call_counts().handle_user_interaction, 1);
        assert_eq!(harness.backend.call_counts().update_status, 2);
    }

    #[tokio::test]
    async fn test_resubscribe_recovers_match_missed_while_offline() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.expire();
        harness.controller.decide(Choice::Like).unwrap();
        harness.controller.settle().await;
        assert!(harness.controller.is_waiting_for_partner());

        // 切断中に相手がいいねしてマッチ成立（プッシュは届かない）
        harness.backend.set_muted(true);
        partner_likes(&harness.backend);
        harness.controller.settle().await;
        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);

        harness.backend.set_muted(false);
        harness.backend.push_event(CHAT, RealtimeEvent::Resubscribed);
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::Completed);
        assert_eq!(harness.notice_count(&Notice::matched()), 1);
        assert_eq!(
            harness.controller.pending_navigation(),
            Some(&Route::Conversation(SessionId(CHAT.to_string())))
        );
    }

    #[tokio::test]
    async fn test_failed_decision_reopens_gate() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.backend.set_failures(FailurePlan {
            handle_user_interaction: true,
            ..FailurePlan::default()
        });
        harness.expire();

        harness.controller.decide(Choice::Pass).unwrap();
        harness.controller.settle().await;

        assert_eq!(harness.controller.gate_state(), GateState::Open);
        assert_eq!(harness.controller.state(), ControllerState::AwaitingDecision);
        assert_eq!(harness.notice_count(&Notice::decision_failed()), 1);
        assert_eq!(harness.backend.session(CHAT).unwrap().status, "active");

        harness.backend.clear_failures();
        assert!(harness.controller.decide(Choice::Like).is_ok());
    }
}

/// 終了・遷移テスト
#[cfg(test)]
mod termination_tests {
    use super::*;

    fn complete_with_finals(backend: &InMemoryBackend) {
        backend.mutate_session(CHAT, |row| {
            row.status = "completed".to_string();
            row.messages = Some(json!([
                wire("f1", "Nice to meet you", "user2"),
                wire("f2", "Likewise!", "user1")
            ]));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_push_navigates_exactly_once() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.backend.mutate_session(CHAT, |row| {
            row.temporary_messages = Some(json!([wire("d1", "draft only", "user2")]));
        });
        harness.controller.settle().await;
        assert_eq!(harness.controller.visible_messages().len(), 1);

        complete_with_finals(&harness.backend);
        harness.backend.push_current_row(CHAT);
        harness.backend.push_current_row(CHAT);
        harness.controller.settle().await;

        let ids: Vec<String> = harness
            .controller
            .visible_messages()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert_eq!(harness.notice_count(&Notice::matched()), 1);

        tokio::time::advance(MATCH_NAVIGATION_DELAY - Duration::from_millis(10)).await;
        assert_eq!(harness.controller.poll_navigation(), None);

        tokio::time::advance(Duration::from_millis(10)).await;
        let route = Route::Conversation(SessionId(CHAT.to_string()));
        assert_eq!(harness.controller.poll_navigation(), Some(route.clone()));

        complete_with_finals(&harness.backend);
        harness.controller.settle().await;
        tokio::time::advance(MATCH_NAVIGATION_DELAY).await;
        assert_eq!(harness.controller.poll_navigation(), None);
        assert_eq!(harness.ui.navigations(), vec![route]);
        assert!(!harness.controller.has_subscription());
    }

    #[tokio::test]
    async fn test_final_view_survives_stale_rows() {
        let mut harness = Harness::loaded(Some(t0())).await;

        complete_with_finals(&harness.backend);
        harness.controller.settle().await;
        assert!(harness.controller.is_showing_final());

        harness.backend.mutate_session(CHAT, |row| row.status = "active".to_string());
        harness.controller.settle().await;

        assert!(harness.controller.is_showing_final());
        assert_eq!(harness.controller.visible_messages().len(), 2);
        assert_eq!(harness.controller.state(), ControllerState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partner_ending_chat_notifies_once() {
        let mut harness = Harness::loaded(Some(t0())).await;

        for _ in 0..3 {
            harness.backend.mutate_session(CHAT, |row| {
                row.status = "ended_manually".to_string();
                row.ended_by = Some("user2".to_string());
            });
        }
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedManually);
        assert_eq!(harness.notice_count(&Notice::partner_ended("Sam")), 1);

        tokio::time::advance(END_NAVIGATION_DELAY - Duration::from_secs(1)).await;
        assert_eq!(harness.controller.poll_navigation(), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(harness.controller.poll_navigation(), Some(Route::Lobby));
    }

    #[tokio::test]
    async fn test_partner_departure_is_recorded() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness
            .backend
            .push_event(CHAT, RealtimeEvent::PresenceLeft(partner()));
        harness
            .backend
            .push_event(CHAT, RealtimeEvent::PresenceLeft(partner()));
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedByDeparture);
        assert_eq!(harness.notice_count(&Notice::partner_left("Sam")), 1);
        assert_eq!(harness.controller.pending_navigation(), Some(&Route::Lobby));

        let row = harness.backend.session(CHAT).unwrap();
        assert_eq!(row.status, "ended_by_departure");
        assert_eq!(row.ended_by.as_deref(), Some("user2"));
        assert_eq!(harness.backend.call_counts().update_status, 1);
    }

    /// プレゼンスフレームを追跡器に通し、得られたイベントをバックエンドから配信する
    fn relay_presence(
        backend: &InMemoryBackend,
        tracker: &mut PresenceTracker,
        event: &str,
        payload: Value,
    ) {
        let frame = PhoenixFrame {
            topic: format!("realtime:speed-chat-{}", CHAT),
            event: event.to_string(),
            payload,
            reference: None,
        };
        if let FrameAction::Presence(update) = interpret_frame(&frame, &frame.topic) {
            for event in tracker.apply(update) {
                backend.push_event(CHAT, event);
            }
        }
    }

    #[tokio::test]
    async fn test_partner_reconnect_keeps_session() {
        let mut harness = Harness::loaded(Some(t0())).await;
        let mut tracker = PresenceTracker::new();

        relay_presence(
            &harness.backend,
            &mut tracker,
            "presence_state",
            json!({"user2": {"metas": [{"phx_ref": "old"}]}}),
        );
        relay_presence(
            &harness.backend,
            &mut tracker,
            "presence_diff",
            json!({
                "joins": {"user2": {"metas": [{"phx_ref": "new"}]}},
                "leaves": {"user2": {"metas": [{"phx_ref": "old"}]}}
            }),
        );
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert_eq!(harness.backend.call_counts().update_status, 0);
        assert_eq!(harness.backend.session(CHAT).unwrap().status, "active");

        relay_presence(
            &harness.backend,
            &mut tracker,
            "presence_diff",
            json!({"joins": {}, "leaves": {"user2": {"metas": [{"phx_ref": "new"}]}}}),
        );
        harness.controller.settle().await;
        assert_eq!(harness.controller.state(), ControllerState::EndedByDeparture);
    }

    #[tokio::test]
    async fn test_own_presence_changes_are_ignored() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness
            .backend
            .push_event(CHAT, RealtimeEvent::PresenceLeft(me()));
        harness
            .backend
            .push_event(CHAT, RealtimeEvent::PresenceJoined(partner()));
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert_eq!(harness.backend.call_counts().update_status, 0);
    }

    #[tokio::test]
    async fn test_end_chat_after_confirmation() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.controller.handle_command(SessionCommand::RequestEndChat);
        assert!(harness.controller.is_end_confirmation_pending());
        harness.controller.handle_command(SessionCommand::ConfirmEndChat);
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::EndedManually);
        assert_eq!(harness.notice_count(&Notice::partner_ended("Sam")), 0);
        assert_eq!(
            harness.backend.session(CHAT).unwrap().ended_by.as_deref(),
            Some("user1")
        );
    }

    #[tokio::test]
    async fn test_end_chat_failure_keeps_session_active() {
        let mut harness = Harness::loaded(Some(t0())).await;
        harness.backend.set_failures(FailurePlan {
            update_status: true,
            ..FailurePlan::default()
        });

        harness.controller.request_end_chat();
        harness.controller.confirm_end_chat();
        harness.controller.settle().await;

        assert_eq!(harness.controller.state(), ControllerState::Active);
        assert_eq!(harness.notice_count(&Notice::end_failed()), 1);
        assert!(harness.controller.pending_navigation().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_degrades_quietly() {
        let mut harness = Harness::loaded(Some(t0())).await;

        harness.backend.push_event(
            CHAT,
            RealtimeEvent::Disconnected {
                reason: "socket closed".to_string(),
            },
        );
        harness.controller.settle().await;

        assert!(harness.controller.is_realtime_degraded());
        assert!(!harness.controller.has_subscription());
        assert_eq!(harness.notice_count(&Notice::connection_lost()), 1);
        assert_eq!(harness.controller.state(), ControllerState::Active);

        harness.controller.send("are you there?").unwrap();
        harness.controller.settle().await;
        assert_eq!(harness.controller.visible_messages().len(), 1);
    }
}

/// イベントループテスト
#[cfg(test)]
mod run_loop_tests {
    use super::*;

    async fn wait_for_subscriber(backend: &InMemoryBackend) {
        while backend.subscriber_count(CHAT) == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_run(
        backend: Arc<InMemoryBackend>,
        ui: RecordingUi,
    ) -> (
        mpsc::UnboundedSender<SessionCommand>,
        tokio::task::JoinHandle<SessionExit>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = ChatSessionController::new(
            SessionId(CHAT.to_string()),
            Some(me()),
            backend,
            Box::new(ui),
        );
        (tx, tokio::spawn(controller.run(rx)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_navigates_after_match_delay() {
        let backend = seeded_backend(Some(Utc::now()));
        let ui = RecordingUi::new();
        let (_tx, handle) = spawn_run(backend.clone(), ui.clone());

        wait_for_subscriber(&backend).await;
        let started = tokio::time::Instant::now();
        backend.mutate_session(CHAT, |row| row.status = "completed".to_string());
        backend.push_current_row(CHAT);

        let exit = handle.await.unwrap();
        let route = Route::Conversation(SessionId(CHAT.to_string()));
        assert_eq!(exit, SessionExit::Navigated(route.clone()));
        assert!(started.elapsed() >= MATCH_NAVIGATION_DELAY);
        assert_eq!(ui.navigations(), vec![route]);
        assert_eq!(backend.subscriber_count(CHAT), 0);
    }

    #[tokio::test]
    async fn test_run_leave_records_departure() {
        let backend = seeded_backend(Some(Utc::now()));
        let ui = RecordingUi::new();
        let (tx, handle) = spawn_run(backend.clone(), ui.clone());

        wait_for_subscriber(&backend).await;
        tx.send(SessionCommand::Send("bye".to_string())).unwrap();
        tx.send(SessionCommand::Leave).unwrap();

        assert_eq!(handle.await.unwrap(), SessionExit::Left);
        let row = backend.session(CHAT).unwrap();
        assert_eq!(row.status, "ended_by_departure");
        assert_eq!(row.ended_by.as_deref(), Some("user1"));
        assert_eq!(backend.subscriber_count(CHAT), 0);
        assert!(ui.navigations().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_commands_close() {
        let backend = seeded_backend(Some(Utc::now()));
        let (tx, handle) = spawn_run(backend.clone(), RecordingUi::new());

        wait_for_subscriber(&backend).await;
        drop(tx);

        assert_eq!(handle.await.unwrap(), SessionExit::Closed);
        assert_eq!(backend.subscriber_count(CHAT), 0);
        assert_eq!(backend.session(CHAT).unwrap().status, "active");
    }

    #[tokio::test]
    async fn test_run_reports_load_failure() {
        let backend = Arc::new(InMemoryBackend::new());
        let ui = RecordingUi::new();
        let (_tx, handle) = spawn_run(backend, ui.clone());

        assert_eq!(handle.await.unwrap(), SessionExit::LoadFailed);
        assert_eq!(ui.navigations(), vec![Route::Lobby]);
    }
}
