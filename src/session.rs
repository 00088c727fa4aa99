pub mod controller; // セッションの状態機械
pub mod decision_gate;
pub mod message_log;
pub mod notices; // 通知・遷移・UI境界
pub mod timer;

pub use controller::{
    ChatSessionController, ControllerState, SessionCommand, SessionExit, END_NAVIGATION_DELAY,
    MATCH_NAVIGATION_DELAY, TICK_INTERVAL,
};
pub use decision_gate::{DecisionGate, DecisionRejected, GateState};
pub use message_log::{MessageLog, SendRejected};
pub use notices::{Notice, NoticeLevel, RecordingUi, Route, UiContext, UiEvent};
pub use timer::{
    format_clock, Clock, ManualClock, SessionTimer, SystemClock, TimerSnapshot, SESSION_DURATION,
};
