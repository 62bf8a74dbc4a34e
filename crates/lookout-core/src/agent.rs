use serde::{Deserialize, Serialize};

/// One agent row in a roster snapshot, as reported by the gateway.
///
/// Metric readings are sampled by the agent itself and relayed verbatim;
/// each one is independently optional because agents report whatever their
/// platform exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Unique stable identifier within a snapshot.
    pub name: String,
    /// Epoch seconds of the most recent health report the gateway received.
    pub polled_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Wire shape of the roster endpoint (`GET /manage/data`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterResponse {
    #[serde(default)]
    pub data: Vec<AgentRecord>,
}
