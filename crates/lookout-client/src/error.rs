/// Errors surfaced by gateway calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Session credentials missing or expired (401). Callers redirect to
    /// sign-in; the roster poller stops itself on this.
    Unauthenticated,
    /// The addressed resource no longer exists (404). Session teardown maps
    /// this to success.
    NotFound(String),
    /// The gateway rejected the request (agent unknown, unreachable, ...).
    Api { status: u16, message: String },
    /// Connection-level failure before or during a request.
    Transport(String),
}

impl GatewayError {
    /// Map an HTTP status + extracted message to the error taxonomy.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::Unauthenticated,
            404 => Self::NotFound(message),
            _ => Self::Api { status, message },
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::Api { status, message } => write!(f, "gateway error ({status}): {message}"),
            Self::Transport(m) => write!(f, "transport error: {m}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
