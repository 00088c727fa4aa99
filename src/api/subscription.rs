//! リアルタイム購読ハンドル
//!
//! 購読側（コントローラー）は `Subscription` を所有し、供給側（WebSocketタスクや
//! インメモリバックエンド）は `SubscriptionFeed` を持つ。`Subscription` のdropで
//! 供給側へキャンセルが伝わるため、画面を抜けたあとに古いイベントが届くことはない。

use tokio::sync::{mpsc, oneshot};

use crate::models::{ChatRow, UserId};

/// 購読から届くイベント
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// 行が更新された（新しい行全体）
    RowUpdated(ChatRow),
    /// 参加者がチャンネルに入った
    PresenceJoined(UserId),
    /// 参加者がチャンネルから抜けた
    PresenceLeft(UserId),
    /// 接続が切れたので再接続中
    Reconnecting { attempt: u32 },
    /// 再接続後にチャンネルへ入り直した（切断中の変更は届いていない）
    Resubscribed,
    /// 再接続を諦めた
    Disconnected { reason: String },
}

/// 購読ハンドル（所有者側）
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    events: mpsc::UnboundedReceiver<RealtimeEvent>,
    cancel_sender: Option<oneshot::Sender<()>>,
}

/// イベント供給側
#[derive(Debug)]
pub struct SubscriptionFeed {
    topic: String,
    events: mpsc::UnboundedSender<RealtimeEvent>,
    cancel_receiver: oneshot::Receiver<()>,
    cancelled: bool,
}

impl Subscription {
    /// 購読ハンドルと供給側のペアを作成
    pub fn channel(topic: impl Into<String>) -> (Subscription, SubscriptionFeed) {
        let topic = topic.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        (
            Subscription {
                topic: topic.clone(),
                events: event_rx,
                cancel_sender: Some(cancel_tx),
            },
            SubscriptionFeed {
                topic,
                events: event_tx,
                cancel_receiver: cancel_rx,
                cancelled: false,
            },
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 次のイベントを待つ。供給側が終了したらNone
    pub async fn next_event(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }

    /// 届いているイベントがあれば取り出す（待たない）
    pub fn try_next_event(&mut self) -> Option<RealtimeEvent> {
        self.events.try_recv().ok()
    }

    /// 購読を解除（何度呼んでもよい）
    pub fn cancel(&mut self) {
        if let Some(sender) = self.cancel_sender.take() {
            let _ = sender.send(());
            self.events.close();
            tracing::debug!("🔌 [SUBSCRIPTION] Cancelled {}", self.topic);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_sender.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl SubscriptionFeed {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// イベントを送る。購読側がいなくなっていればfalse
    pub fn push(&self, event: RealtimeEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// 購読側が解除済みか
    pub fn is_closed(&mut self) -> bool {
        if self.cancelled || self.events.is_closed() {
            return true;
        }
        match self.cancel_receiver.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => false,
            _ => {
                self.cancelled = true;
                true
            }
        }
    }

    /// 購読側の解除を待つ（select!で使用）
    pub async fn cancelled(&mut self) {
        if self.cancelled {
            return;
        }
        let _ = (&mut self.cancel_receiver).await;
        self.cancelled = true;
    }
}
