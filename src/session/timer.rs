//! セッションタイマー
//!
//! 残り時間は保存せず、開始時刻と現在時刻から毎回計算する。
//! - 固定の持ち時間（3分）
//! - 未来の開始時刻は経過0秒として扱う
//! - 開始時刻がなければタイマーは動かない

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// セッションの持ち時間
pub const SESSION_DURATION: Duration = Duration::from_secs(180);

/// 残りわずか表示の閾値（秒）
pub const LOW_TIME_THRESHOLD_SECS: u64 = 30;

/// 現在時刻の供給元
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// システム時計
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手動で進める時計（テスト用）
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// 描画用のタイマー状態
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSnapshot {
    /// 残り秒数（端数は切り上げ）
    pub remaining_secs: u64,
    pub expired: bool,
    /// 経過率 0.0〜100.0
    pub progress_percent: f64,
    /// 残り30秒未満
    pub low_time: bool,
    /// "m:ss" 表示
    pub clock: String,
}

/// カウントダウンタイマー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimer {
    started_at: DateTime<Utc>,
    duration: Duration,
}

impl SessionTimer {
    /// 開始時刻からタイマーを作成（開始時刻がなければNone）
    pub fn start(started_at: Option<DateTime<Utc>>) -> Option<Self> {
        started_at.map(|started_at| Self::with_duration(started_at, SESSION_DURATION))
    }

    pub fn with_duration(started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            started_at,
            duration,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// `now` 時点の経過時間（開始前なら0）
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// `now` 時点の残り時間（0〜持ち時間）
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.duration.saturating_sub(self.elapsed_at(now))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_at(now).is_zero()
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> TimerSnapshot {
        let remaining = self.remaining_at(now);
        let remaining_secs = remaining.as_millis().div_ceil(1000) as u64;
        let total = self.duration.as_secs_f64();
        let progress_percent = if total > 0.0 {
            ((total - remaining.as_secs_f64()) / total * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };

        TimerSnapshot {
            remaining_secs,
            expired: remaining.is_zero(),
            progress_percent,
            low_time: remaining_secs < LOW_TIME_THRESHOLD_SECS,
            clock: format_clock(remaining_secs),
        }
    }
}

/// 秒数を "m:ss" に整形
pub fn format_clock(total_secs: u64) -> String {
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 23, 22, 0, 0).unwrap()
    }

    #[test]
    fn test_remaining_counts_down_to_zero() {
        let timer = SessionTimer::start(Some(t0())).unwrap();

        assert_eq!(timer.remaining_at(t0()), SESSION_DURATION);
        assert_eq!(
            timer.remaining_at(t0() + chrono::Duration::seconds(60)),
            Duration::from_secs(120)
        );
        assert!(timer.is_expired_at(t0() + chrono::Duration::seconds(180)));
        assert_eq!(
            timer.remaining_at(t0() + chrono::Duration::seconds(500)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_remaining_is_monotonic() {
        let timer = SessionTimer::start(Some(t0())).unwrap();
        let mut previous = timer.remaining_at(t0() - chrono::Duration::seconds(5));

        for step in 0..400 {
            let now = t0() + chrono::Duration::milliseconds(step * 500);
            let remaining = timer.remaining_at(now);
            assert!(remaining <= previous);
            assert!(remaining <= SESSION_DURATION);
            previous = remaining;
        }
        assert_eq!(previous, Duration::ZERO);
    }

    #[test]
    fn test_future_start_counts_as_no_elapsed_time() {
        let timer = SessionTimer::start(Some(t0() + chrono::Duration::seconds(30))).unwrap();
        assert_eq!(timer.remaining_at(t0()), SESSION_DURATION);
        assert!(!timer.is_expired_at(t0()));
    }

    #[test]
    fn test_missing_start_does_not_start() {
        assert!(SessionTimer::start(None).is_none());
    }

    #[test]
    fn test_snapshot() {
        let timer = SessionTimer::start(Some(t0())).unwrap();

        let snapshot = timer.snapshot_at(t0() + chrono::Duration::seconds(45));
        assert_eq!(snapshot.remaining_secs, 135);
        assert_eq!(snapshot.clock, "2:15");
        assert!(!snapshot.low_time);
        assert!((snapshot.progress_percent - 25.0).abs() < 1e-9);

        let snapshot = timer.snapshot_at(t0() + chrono::Duration::milliseconds(170_500));
        assert_eq!(snapshot.remaining_secs, 10);
        assert_eq!(snapshot.clock, "0:10");
        assert!(snapshot.low_time);
        assert!(!snapshot.expired);

        let snapshot = timer.snapshot_at(t0() + chrono::Duration::seconds(181));
        assert!(snapshot.expired);
        assert_eq!(snapshot.clock, "0:00");
        assert_eq!(snapshot.progress_percent, 100.0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), t0() + chrono::Duration::seconds(90));

        clock.set(t0());
        assert_eq!(clock.now(), t0());
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(180), "3:00");
        assert_eq!(format_clock(59), "0:59");
        assert_eq!(format_clock(0), "0:00");
    }
}
