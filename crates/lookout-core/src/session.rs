use serde::{Deserialize, Serialize};

/// Lifecycle state of one streaming session attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, connect not yet issued.
    Idle,
    /// Waiting for the gateway to issue a session token, or re-opening the
    /// stream against an existing token after a retry delay.
    Requesting,
    /// Stream consumer attached; lines may be arriving.
    Open,
    /// Channel failed; a delayed reconnect is pending.
    Retrying,
    /// Teardown initiated; local cleanup done, release call may be in flight.
    Closing,
    /// Terminal: stopped, sentinel received, or process shutdown.
    Closed,
    /// Terminal: the initial token request failed.
    Failed,
}

impl SessionState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether a live channel may currently be producing lines.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Open => "open",
            Self::Retrying => "retrying",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
