//! C6 — CA Processor: decodes each event into a schema-specific record,
//! routes it to the matching sink, and drives checkpoint on flush or
//! interval (§4.6).

use crate::ca::interaction::{operation_id, root_cause};
use crate::ca::sink::CaSchemaSink;
use crate::checkpoint::{CheckpointCoordinator, PartitionCheckpointer};
use crate::errors::Result;
use crate::models::{CaEnvelope, CaRecord, InteractionRecord, LogRecord, PartitionId, RawEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const CHECKPOINT_MIN_INTERVAL: Duration = Duration::from_secs(3 * 60);

pub struct CaProcessorConfig {
    pub partition: PartitionId,
    pub stats_enabled: bool,
    pub log_schema_id: Uuid,
    pub interaction_schema_id: Uuid,
    pub checkpoint_min_interval: Duration,
}

impl CaProcessorConfig {
    pub fn new(partition: PartitionId, stats_enabled: bool, log_schema_id: Uuid, interaction_schema_id: Uuid) -> Self {
        CaProcessorConfig {
            partition,
            stats_enabled,
            log_schema_id,
            interaction_schema_id,
            checkpoint_min_interval: CHECKPOINT_MIN_INTERVAL,
        }
    }
}

#[derive(Default)]
struct DecodeStats {
    count: u64,
    min_ms: i64,
    max_ms: i64,
    total_ms: i64,
    error_count: u64,
    oldest_enqueued: Option<DateTime<Utc>>,
}

impl DecodeStats {
    fn observe(&mut self, elapsed_ms: i64, enqueued_at: DateTime<Utc>) {
        self.min_ms = if self.count == 0 { elapsed_ms } else { self.min_ms.min(elapsed_ms) };
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.count += 1;
        self.total_ms += elapsed_ms;
        self.oldest_enqueued = Some(self.oldest_enqueued.map_or(enqueued_at, |o| o.min(enqueued_at)));
    }

    fn observe_error(&mut self) {
        self.error_count += 1;
    }
}

pub struct CaProcessor<C: PartitionCheckpointer> {
    config: CaProcessorConfig,
    log_sink: Arc<CaSchemaSink>,
    interaction_sink: Arc<CaSchemaSink>,
    checkpoint: CheckpointCoordinator<C>,
    decode_stats: DecodeStats,
}

impl<C: PartitionCheckpointer> CaProcessor<C> {
    pub fn new(
        config: CaProcessorConfig,
        log_sink: Arc<CaSchemaSink>,
        interaction_sink: Arc<CaSchemaSink>,
        checkpointer: C,
    ) -> Self {
        let min_interval = config.checkpoint_min_interval;
        CaProcessor {
            config,
            log_sink,
            interaction_sink,
            checkpoint: CheckpointCoordinator::new(checkpointer, min_interval),
            decode_stats: DecodeStats::default(),
        }
    }

    pub async fn process(&mut self, batch: Vec<RawEvent>) -> Result<()> {
        let mut any_flushed = false;

        for raw in &batch {
            let started = Instant::now();
            match decode(raw, self.config.log_schema_id, self.config.interaction_schema_id) {
                Ok(Some(record)) => {
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    self.decode_stats.observe(elapsed_ms, raw.enqueued_at);
                    let sink = match &record {
                        CaRecord::Log(_) => &self.log_sink,
                        CaRecord::Interaction(_) => &self.interaction_sink,
                    };
                    any_flushed |= sink.append(&record).await?;
                }
                Ok(None) => {}
                Err(reason) => {
                    log::warn!("discarding CA event, decode failed: {reason}");
                    self.decode_stats.observe_error();
                }
            }
        }

        if any_flushed && self.config.stats_enabled && self.decode_stats.count > 0 {
            let stats_record = batch_stats_record(&self.decode_stats, self.config.partition, self.config.log_schema_id);
            any_flushed |= self.log_sink.append(&stats_record).await?;
        }

        if any_flushed || self.checkpoint.is_due() {
            self.log_sink.flush_now().await?;
            self.interaction_sink.flush_now().await?;
            self.decode_stats = DecodeStats::default();
            self.checkpoint.force_checkpoint().await?;
        }

        Ok(())
    }

    /// Best-effort drain on clean shutdown (§5 "flushAllBuffers"); on
    /// abrupt shutdown buffered records may be lost, which is accepted.
    pub async fn close(&mut self, reason: crate::host::CloseReason) -> Result<()> {
        if reason == crate::host::CloseReason::Shutdown {
            self.log_sink.flush_now().await?;
            self.interaction_sink.flush_now().await?;
            self.checkpoint.force_checkpoint().await?;
        }
        Ok(())
    }
}

fn batch_stats_record(stats: &DecodeStats, partition: PartitionId, log_schema_id: Uuid) -> CaRecord {
    let oldest_lag_ms = stats
        .oldest_enqueued
        .map(|t| (Utc::now() - t).num_milliseconds().max(0))
        .unwrap_or(0);
    let body = serde_json::json!({
        "count": stats.count,
        "minMs": stats.min_ms,
        "maxMs": stats.max_ms,
        "totalMs": stats.total_ms,
        "errorCount": stats.error_count,
        "partitionId": partition.0,
        "oldestDocLagMs": oldest_lag_ms,
    });
    CaRecord::Log(LogRecord {
        envelope: CaEnvelope {
            schema_name: "Log".to_string(),
            schema_id: log_schema_id,
            timestamp: Utc::now(),
            correlation_id: None,
            machine_name: None,
            message_id: Uuid::new_v4().to_string(),
            blob: body,
        },
        level: Some("Information".to_string()),
        message: Some("CA batch decode stats".to_string()),
        message_template: None,
        application_name: None,
    })
}

fn decode(
    raw: &RawEvent,
    log_schema_id: Uuid,
    interaction_schema_id: Uuid,
) -> std::result::Result<Option<CaRecord>, String> {
    let type_attr = raw
        .string_property("Type")
        .map_err(|f| format!("non-string {f} attribute"))?;
    match type_attr {
        Some("SerilogEvent") => decode_log(raw, log_schema_id).map(Some),
        Some("RoboCustosInteraction") => decode_interaction(raw, interaction_schema_id).map(Some),
        _ => Ok(None),
    }
}

fn decode_log(raw: &RawEvent, schema_id: Uuid) -> std::result::Result<CaRecord, String> {
    let body_str = std::str::from_utf8(&raw.body).map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_str(body_str).map_err(|e| e.to_string())?;
    let obj = value.as_object().ok_or("Serilog body is not a JSON object")?;

    let timestamp = obj
        .get("@timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let level = obj.get("level").and_then(|v| v.as_str()).map(String::from);
    let message = obj.get("message").and_then(|v| v.as_str()).map(String::from);
    let message_template = obj.get("messageTemplate").and_then(|v| v.as_str()).map(String::from);

    let mut application_name = None;
    let mut blob = serde_json::Map::new();
    if let Some(fields) = obj.get("fields").and_then(|v| v.as_object()) {
        for (key, value) in fields {
            if key == "MachineRole" {
                application_name = value.as_str().map(String::from);
            } else {
                blob.insert(key.clone(), value.clone());
            }
        }
    }

    let message_id = raw
        .string_property("MessageId")
        .ok()
        .flatten()
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(CaRecord::Log(LogRecord {
        envelope: CaEnvelope {
            schema_name: "Log".to_string(),
            schema_id,
            timestamp,
            correlation_id: None,
            machine_name: None,
            message_id,
            blob: serde_json::Value::Object(blob),
        },
        level,
        message,
        message_template,
        application_name,
    }))
}

fn decode_interaction(raw: &RawEvent, schema_id: Uuid) -> std::result::Result<CaRecord, String> {
    let body_str = std::str::from_utf8(&raw.body).map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_str(body_str).map_err(|e| e.to_string())?;
    let obj = value.as_object().ok_or("interaction body is not a JSON object")?;

    let timestamp = obj
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let message_id = obj
        .get("messageId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let robot_name = obj.get("RobotName").and_then(|v| v.as_str()).map(String::from);
    let environment = obj
        .get("Information")
        .and_then(|v| v.get("Product"))
        .and_then(|v| v.get("Environment"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let tester_instance_id = obj
        .get("Tester")
        .and_then(|v| v.get("InstanceId"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let interaction = obj.get("Interaction").ok_or("missing Interaction subtree")?;
    let duration_ms = interaction.get("TimeTaken").and_then(|v| v.as_i64());
    let happiness = interaction.get("HappinessGrade").and_then(|v| v.as_str()).map(String::from);
    let happiness_explanation = interaction
        .get("HappinessExplanation")
        .and_then(|v| v.as_str())
        .map(String::from);

    let correlation_id = match happiness.as_deref() {
        Some(grade @ ("Unacceptable" | "ReallyAnnoyed")) => root_cause(interaction, grade).and_then(operation_id),
        _ => None,
    };

    Ok(CaRecord::Interaction(InteractionRecord {
        envelope: CaEnvelope {
            schema_name: "Interactions".to_string(),
            schema_id,
            timestamp,
            correlation_id,
            machine_name: None,
            message_id,
            blob: value.clone(),
        },
        robot_name,
        environment,
        tester_instance_id,
        duration_ms,
        happiness,
        happiness_explanation,
    }))
}
