/// Seconds since the last health report within which an agent counts as active.
pub const ACTIVE_WINDOW_SECS: f64 = 60.0;

/// Liveness classification of an agent derived from its polling timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Inactive,
}

impl Liveness {
    pub fn label(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }
}

/// Classify an agent from its last report timestamp. The window is strict:
/// exactly `ACTIVE_WINDOW_SECS` elapsed classifies as `Inactive`.
pub fn classify(polled_time: f64, now: f64) -> Liveness {
    if now - polled_time < ACTIVE_WINDOW_SECS {
        Liveness::Active
    } else {
        Liveness::Inactive
    }
}
