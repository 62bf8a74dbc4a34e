/// Metric readings surfaced on an agent card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Temperature,
}

/// Display severity of a metric reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

/// Severity thresholds for the panel: cpu/memory above 80% and temperature
/// above 70°C are critical, disk above 80% is a warning.
pub fn severity(kind: MetricKind, value: f64) -> Severity {
    match kind {
        MetricKind::Cpu | MetricKind::Memory => {
            if value > 80.0 {
                Severity::Critical
            } else {
                Severity::Normal
            }
        },
        MetricKind::Disk => {
            if value > 80.0 {
                Severity::Warning
            } else {
                Severity::Normal
            }
        },
        MetricKind::Temperature => {
            if value > 70.0 {
                Severity::Critical
            } else {
                Severity::Normal
            }
        },
    }
}

/// Render an uptime reading as `"{d}d {h}h {m}m"`, or `"N/A"` when absent.
pub fn format_uptime(secs: Option<u64>) -> String {
    match secs {
        None => "N/A".to_string(),
        Some(secs) => {
            let days = secs / 86_400;
            let hours = (secs % 86_400) / 3_600;
            let minutes = (secs % 3_600) / 60;
            format!("{days}d {hours}h {minutes}m")
        },
    }
}

/// Render a percentage reading, or `"N/A"` when absent.
pub fn format_percent(value: Option<f64>) -> String {
    match value {
        None => "N/A".to_string(),
        Some(v) => format!("{v}%"),
    }
}
