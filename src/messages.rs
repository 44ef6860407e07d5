/// Message shapes flowing through the agent's two channels.
///
/// Inbound ("to-monitor"): a DAG seed, a status report, or the literal `KILL`.
/// Outbound ("to-status"): heartbeats emitted by the activity monitor.
///
/// On the wire every message is a single line: JSON objects for DAGs, reports and
/// heartbeats, and the bare token `KILL` (a JSON string `"KILL"` is accepted too).
use serde::{Deserialize, Serialize};

/// Reserved activity id under which the monitor reports its own liveness.
pub const MONITOR_ID: &str = "MONITOR";

/// Control token that terminates the monitor loop.
pub const KILL_TOKEN: &str = "KILL";

/// Status assigned to every activity when a campaign is seeded.
pub const PROCESSING: &str = "PROCESSING";

/// Status carried by every heartbeat.
pub const MONITORING: &str = "MONITORING";

/// The campaign DAG as seen by the monitor: its id and the activities it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagSeed {
    pub campaign_id: String,
    pub all_activity_ids: Vec<String>,
}

/// A status update for one activity, produced by whatever executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub activity_id: String,
    pub status: String,
}

impl StatusReport {
    pub fn new(activity_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            status: status.into(),
        }
    }
}

/// What the monitor itself consumes from its inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorMessage {
    Report(StatusReport),
    Kill,
}

/// Anything that can arrive on the agent's activity channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Dag(DagSeed),
    Report(StatusReport),
    Kill,
}

impl InboundMessage {
    /// Parse one line from the activity channel.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let line = line.trim();
        if line == KILL_TOKEN {
            return Ok(InboundMessage::Kill);
        }

        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| MessageError::Json { source: e })?;

        match &value {
            serde_json::Value::String(s) if s == KILL_TOKEN => Ok(InboundMessage::Kill),
            serde_json::Value::Object(map)
                if map.contains_key("campaign_id") && map.contains_key("all_activity_ids") =>
            {
                serde_json::from_value(value)
                    .map(InboundMessage::Dag)
                    .map_err(|e| MessageError::Json { source: e })
            }
            serde_json::Value::Object(map)
                if map.contains_key("activity_id") && map.contains_key("status") =>
            {
                serde_json::from_value(value)
                    .map(InboundMessage::Report)
                    .map_err(|e| MessageError::Json { source: e })
            }
            _ => Err(MessageError::Unrecognized {
                line: line.to_string(),
            }),
        }
    }

    /// Encode as a single wire line (without the trailing newline).
    pub fn encode(&self) -> Result<String, MessageError> {
        match self {
            InboundMessage::Kill => Ok(KILL_TOKEN.to_string()),
            InboundMessage::Dag(seed) => {
                serde_json::to_string(seed).map_err(|e| MessageError::Json { source: e })
            }
            InboundMessage::Report(report) => {
                serde_json::to_string(report).map_err(|e| MessageError::Json { source: e })
            }
        }
    }

    /// The monitor-facing part of this message, if any. DAG seeds are handled by the agent.
    pub fn into_monitor_message(self) -> Option<MonitorMessage> {
        match self {
            InboundMessage::Dag(_) => None,
            InboundMessage::Report(report) => Some(MonitorMessage::Report(report)),
            InboundMessage::Kill => Some(MonitorMessage::Kill),
        }
    }
}

/// Liveness signal placed on the "to-status" queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: String,
    pub activity_id: String,
    pub campaign_id: String,
    pub msg: String,
}

impl Heartbeat {
    pub fn new(campaign_id: &str, msg: impl Into<String>) -> Self {
        Self {
            status: MONITORING.to_string(),
            activity_id: MONITOR_ID.to_string(),
            campaign_id: campaign_id.to_string(),
            msg: msg.into(),
        }
    }
}

/// Errors from decoding or encoding wire messages.
#[derive(Debug)]
pub enum MessageError {
    Json { source: serde_json::Error },
    Unrecognized { line: String },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Json { source } => write!(f, "invalid message JSON: {source}"),
            MessageError::Unrecognized { line } => {
                write!(f, "unrecognized message shape: {line}")
            }
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::Json { source } => Some(source),
            MessageError::Unrecognized { .. } => None,
        }
    }
}
