//! Error taxonomy for the chat session client.
//!
//! Every remote failure is converted into one of these kinds at the call site.
//! The session state machine never advances on an error path.

use crate::api::RemoteError;
use thiserror::Error;

/// Errors surfaced by the session client.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session row could not be read, or does not exist
    #[error("Chat session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The partner's profile could not be read
    #[error("Failed to load participant profile {user_id}: {reason}")]
    ProfileLoadFailed { user_id: String, reason: String },

    /// The remote append procedure rejected or failed
    #[error("Message could not be delivered: {reason}")]
    MessageDeliveryFailed { reason: String },

    /// The interaction procedure or the status mutation failed
    #[error("Decision could not be submitted: {reason}")]
    DecisionSubmissionFailed { reason: String },

    /// The realtime feed dropped and could not be re-established
    #[error("Realtime connection lost: {reason}")]
    RealtimeDisconnected { reason: String },

    /// A row from the backend did not fit the expected shape
    #[error("Malformed {structure}: {reason}")]
    MalformedRow { structure: String, reason: String },

    /// Transport failure that has not been classified yet
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl SessionError {
    /// Create a session-not-found error
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a malformed row error
    pub fn malformed(structure: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            structure: structure.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error leaves nothing to render and forces the user back to the lobby
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            SessionError::SessionNotFound { .. } | SessionError::ProfileLoadFailed { .. }
        )
    }

    /// Whether the user can simply try the same action again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::MessageDeliveryFailed { .. }
                | SessionError::DecisionSubmissionFailed { .. }
                | SessionError::Remote(_)
        )
    }
}

/// Result alias used across the crate
pub type SpeedHeartResult<T> = Result<T, SessionError>;
