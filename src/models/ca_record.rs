use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Fields shared by every CA record regardless of schema (§3 "CA Record").
#[derive(Debug, Clone, Serialize)]
pub struct CaEnvelope {
    #[serde(rename = "schemaName")]
    pub schema_name: String,
    #[serde(rename = "schemaId")]
    pub schema_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(rename = "machineName")]
    pub machine_name: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub blob: serde_json::Value,
}

/// Decoded `SerilogEvent` destined for the `Log` schema (§4.6).
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    #[serde(flatten)]
    pub envelope: CaEnvelope,
    pub level: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "messageTemplate")]
    pub message_template: Option<String>,
    #[serde(rename = "applicationName")]
    pub application_name: Option<String>,
}

/// Decoded `RoboCustosInteraction` destined for the `Interactions` schema
/// (§4.6).
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRecord {
    #[serde(flatten)]
    pub envelope: CaEnvelope,
    #[serde(rename = "robotName")]
    pub robot_name: Option<String>,
    pub environment: Option<String>,
    #[serde(rename = "testerInstanceId")]
    pub tester_instance_id: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<i64>,
    pub happiness: Option<String>,
    #[serde(rename = "happinessExplanation")]
    pub happiness_explanation: Option<String>,
}

/// Closed sum of the two schemas this pipeline ever emits to CA (§4.6
/// "fixed at construction: {Log, Interactions}").
#[derive(Debug, Clone)]
pub enum CaRecord {
    Log(LogRecord),
    Interaction(InteractionRecord),
}

impl CaRecord {
    pub fn schema_name(&self) -> &'static str {
        match self {
            CaRecord::Log(_) => "Log",
            CaRecord::Interaction(_) => "Interactions",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CaRecord::Log(r) => r.envelope.timestamp,
            CaRecord::Interaction(r) => r.envelope.timestamp,
        }
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        match self {
            CaRecord::Log(r) => serde_json::to_string(r),
            CaRecord::Interaction(r) => serde_json::to_string(r),
        }
    }
}
