pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod session;

// Re-export the main error types for convenience
pub use api::RemoteError;
pub use error::{SessionError, SpeedHeartResult};

// Re-export the backend seam and its implementations
pub use api::{InMemoryBackend, RemoteStateClient, SupabaseRestClient};

// Re-export the session client
pub use session::{
    ChatSessionController, ControllerState, Notice, NoticeLevel, Route, SessionCommand,
    SessionExit, UiContext,
};

pub use models::{ChatSession, Choice, Message, ParticipantProfile, SessionId, SessionStatus, UserId};
