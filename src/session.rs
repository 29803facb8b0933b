//! Alert sessions
//!
//! A session spans one detection through to its terminal outcome. The state
//! machine owns the only live session; everything else sees clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Detected,
    CountdownActive,
    Dispatching,

    /// Every recipient slot has fired
    Resolved,

    /// Cancelled during the countdown; nothing was sent
    Cancelled,

    /// Countdown elapsed with an empty contact list; nothing was sent
    NeedsConfiguration,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Resolved | SessionState::Cancelled | SessionState::NeedsConfiguration
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSession {
    pub id: SessionId,
    pub matched_phrase: String,
    pub triggered_at: DateTime<Utc>,
    pub state: SessionState,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,

    /// When the alert text was generated, once the countdown elapsed
    pub message_composed_at: Option<DateTime<Utc>>,

    /// Recipients that had a send issued
    pub recipients_notified: usize,
}

impl AlertSession {
    pub fn new(id: SessionId, matched_phrase: impl Into<String>, triggered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            matched_phrase: matched_phrase.into(),
            triggered_at,
            state: SessionState::Detected,
            cancelled_at: None,
            closed_at: None,
            message_composed_at: None,
            recipients_notified: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `next`; terminal states are sticky
    pub fn advance(&mut self, next: SessionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.state = next;
        if next.is_terminal() {
            let now = Utc::now();
            if next == SessionState::Cancelled {
                self.cancelled_at = Some(now);
            }
            self.closed_at = Some(now);
        }
        true
    }
}
