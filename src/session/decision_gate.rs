//! 決定ゲート（いいね／パス）
//!
//! タイマー終了まで閉じている。開いたあとは1セッションにつき1回だけ送信でき、
//! 失敗したときだけ再び開く。

use chrono::{DateTime, Utc};

use crate::models::{Choice, Decision, SessionId, UserId};

/// 決定を受け付けなかった理由
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRejected {
    #[error("decisions open when the timer expires")]
    NotOpen,
    #[error("a decision ({0}) is already in flight")]
    InFlight(Choice),
    #[error("a decision ({0}) was already accepted")]
    AlreadyDecided(Choice),
    #[error("no authenticated participant")]
    NotAuthenticated,
}

/// ゲートの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Closed,
    Open,
    InFlight(Choice),
    Accepted(Choice),
}

#[derive(Debug, Clone, Default)]
pub struct DecisionGate {
    state: GateState,
}

impl DecisionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// タイマー終了で開く（閉じているときのみ）
    pub fn open(&mut self) -> bool {
        if self.state == GateState::Closed {
            self.state = GateState::Open;
            true
        } else {
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }

    /// 決定を開始して送信内容を返す
    pub fn begin(
        &mut self,
        choice: Choice,
        participant: Option<&UserId>,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionRejected> {
        match self.state {
            GateState::Closed => return Err(DecisionRejected::NotOpen),
            GateState::InFlight(previous) => return Err(DecisionRejected::InFlight(previous)),
            GateState::Accepted(previous) => return Err(DecisionRejected::AlreadyDecided(previous)),
            GateState::Open => {}
        }
        let participant = participant.ok_or(DecisionRejected::NotAuthenticated)?;

        self.state = GateState::InFlight(choice);
        Ok(Decision {
            participant_id: participant.clone(),
            session_id: session_id.clone(),
            choice,
            submitted_at: now,
        })
    }

    /// 送信成功
    pub fn accept(&mut self) -> Option<Choice> {
        match self.state {
            GateState::InFlight(choice) => {
                self.state = GateState::Accepted(choice);
                Some(choice)
            }
            _ => None,
        }
    }

    /// 送信失敗。再度選べるように開き直す
    pub fn fail(&mut self) {
        if matches!(self.state, GateState::InFlight(_)) {
            self.state = GateState::Open;
        }
    }

    /// いいね送信済みで相手の決定待ち
    pub fn is_waiting_for_partner(&self) -> bool {
        matches!(
            self.state,
            GateState::InFlight(Choice::Like) | GateState::Accepted(Choice::Like)
        )
    }

    pub fn decided(&self) -> Option<Choice> {
        match self.state {
            GateState::InFlight(choice) | GateState::Accepted(choice) => Some(choice),
            _ => None,
        }
    }
}
