//! C8 — Host Adapter: constructs one ES/CA processor per partition-open and
//! bridges the Consumer Host contract (`open`/`process`/`close`/`checkpoint`,
//! §6) to a concrete rdkafka-backed checkpointer. The real partition broker
//! (lease management, partition assignment, message delivery) is out of
//! scope (§1); this is the minimal in-process implementation of its
//! contract that the bootstrap (§4.9) needs to be runnable standalone.

use crate::ca::{BlobAccountClient, CaProcessor, CaProcessorConfig, CaSchemaSink, SchemaSinkConfig};
use crate::checkpoint::PartitionCheckpointer;
use crate::errors::{IngestError, Result};
use crate::es::{EsProcessor, EsProcessorConfig, EsSubmitter};
use crate::models::{PartitionId, RawEvent};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::TopicPartitionList;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a partition is being closed (§6 Consumer Host contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    LeaseLost,
    Failure,
}

/// Checkpoints one partition by committing the offset last stored for it.
/// `store_offset` is called as each message is consumed (§4.9); `checkpoint`
/// only commits, keeping "track progress" and "acknowledge progress"
/// distinct the way the Checkpoint Coordinator (C7) expects.
pub struct KafkaCheckpointer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: PartitionId,
}

impl KafkaCheckpointer {
    pub fn new(consumer: Arc<StreamConsumer>, topic: String, partition: PartitionId) -> Self {
        KafkaCheckpointer {
            consumer,
            topic,
            partition,
        }
    }
}

#[async_trait]
impl PartitionCheckpointer for KafkaCheckpointer {
    async fn checkpoint(&self) -> Result<()> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, partition.0);
            consumer.commit(&tpl, CommitMode::Async)
        })
        .await
        .map_err(|err| IngestError::Config(format!("checkpoint task panicked: {err}")))?
        .map_err(IngestError::Kafka)
    }
}

/// Owns the ES pipeline's cross-partition resources (the shared
/// `EsSubmitter`, §5) and one `EsProcessor` per open partition.
pub struct EsHost {
    submitter: Arc<EsSubmitter>,
    stats_enabled: bool,
    max_failed_doc_retries: u32,
    max_abandoned_doc_retries: u32,
    checkpoint_min_interval: Duration,
    processors: Mutex<HashMap<i32, EsProcessor<KafkaCheckpointer>>>,
}

impl EsHost {
    pub fn new(submitter: Arc<EsSubmitter>, stats_enabled: bool, checkpoint_min_interval: Duration) -> Self {
        EsHost {
            submitter,
            stats_enabled,
            max_failed_doc_retries: 10,
            max_abandoned_doc_retries: 10,
            checkpoint_min_interval,
            processors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(&self, partition: PartitionId, checkpointer: KafkaCheckpointer, cancellation: CancellationToken) {
        let mut config = EsProcessorConfig::new(partition, self.stats_enabled);
        config.max_failed_doc_retries = self.max_failed_doc_retries;
        config.max_abandoned_doc_retries = self.max_abandoned_doc_retries;
        config.checkpoint_min_interval = self.checkpoint_min_interval;
        let processor = EsProcessor::new(config, self.submitter.clone(), checkpointer, cancellation);
        self.processors.lock().await.insert(partition.0, processor);
        log::info!("ES partition {partition} opened");
    }

    pub async fn process(&self, partition: PartitionId, batch: Vec<RawEvent>) -> Result<()> {
        let mut processors = self.processors.lock().await;
        match processors.get_mut(&partition.0) {
            Some(processor) => processor.process(batch).await,
            None => {
                log::warn!("ES process() called for unopened partition {partition}");
                Ok(())
            }
        }
    }

    pub async fn close(&self, partition: PartitionId, reason: CloseReason) -> Result<()> {
        let mut processors = self.processors.lock().await;
        if let Some(processor) = processors.get_mut(&partition.0) {
            processor.close(reason).await?;
        }
        processors.remove(&partition.0);
        log::info!("ES partition {partition} closed ({reason:?})");
        Ok(())
    }

    pub async fn close_all(&self, reason: CloseReason) {
        let partitions: Vec<i32> = self.processors.lock().await.keys().copied().collect();
        for p in partitions {
            if let Err(err) = self.close(PartitionId(p), reason).await {
                log::error!("error closing ES partition {p}: {err}");
            }
        }
    }
}

/// Per-schema sink configuration shared across every partition's sinks,
/// everything except the schema name/id itself (§6 configuration keys).
pub struct CaSinkTemplate {
    pub capacity_bytes: usize,
    pub compression_enabled: bool,
    pub base_container_name: String,
    pub notification_endpoint: String,
    pub instrumentation_key: String,
    pub max_blob_write_attempts: u32,
    pub notification_max_retries: u32,
}

/// Owns the CA pipeline's cross-partition resources: only the blob-account
/// client list and the notification HTTP client are shared across
/// partitions (§5). The two schema sinks are partition-local (§3) and are
/// constructed fresh, one pair per partition, in `open()` — sharing one
/// `CaSchemaSink` across partitions would let one partition's flush drain
/// and reset another partition's buffer.
pub struct CaHost {
    sink_template: CaSinkTemplate,
    blob_accounts: Vec<Arc<dyn BlobAccountClient>>,
    http: reqwest::Client,
    cancellation: CancellationToken,
    log_schema_id: Uuid,
    interaction_schema_id: Uuid,
    stats_enabled: bool,
    checkpoint_min_interval: Duration,
    processors: Mutex<HashMap<i32, CaProcessor<KafkaCheckpointer>>>,
}

impl CaHost {
    pub fn new(
        sink_template: CaSinkTemplate,
        blob_accounts: Vec<Arc<dyn BlobAccountClient>>,
        http: reqwest::Client,
        cancellation: CancellationToken,
        log_schema_id: Uuid,
        interaction_schema_id: Uuid,
        stats_enabled: bool,
        checkpoint_min_interval: Duration,
    ) -> Self {
        CaHost {
            sink_template,
            blob_accounts,
            http,
            cancellation,
            log_schema_id,
            interaction_schema_id,
            stats_enabled,
            checkpoint_min_interval,
            processors: Mutex::new(HashMap::new()),
        }
    }

    fn build_sink(&self, schema_name: &'static str, schema_id: Uuid) -> Arc<CaSchemaSink> {
        Arc::new(CaSchemaSink::new(
            SchemaSinkConfig {
                schema_name,
                schema_id,
                capacity_bytes: self.sink_template.capacity_bytes,
                compression_enabled: self.sink_template.compression_enabled,
                base_container_name: self.sink_template.base_container_name.clone(),
                notification_endpoint: self.sink_template.notification_endpoint.clone(),
                instrumentation_key: self.sink_template.instrumentation_key.clone(),
                max_blob_write_attempts: self.sink_template.max_blob_write_attempts,
                notification_max_retries: self.sink_template.notification_max_retries,
            },
            self.blob_accounts.clone(),
            self.http.clone(),
            self.cancellation.clone(),
        ))
    }

    pub async fn open(&self, partition: PartitionId, checkpointer: KafkaCheckpointer) {
        let log_sink = self.build_sink("Log", self.log_schema_id);
        let interaction_sink = self.build_sink("Interactions", self.interaction_schema_id);
        let mut config =
            CaProcessorConfig::new(partition, self.stats_enabled, self.log_schema_id, self.interaction_schema_id);
        config.checkpoint_min_interval = self.checkpoint_min_interval;
        let processor = CaProcessor::new(config, log_sink, interaction_sink, checkpointer);
        self.processors.lock().await.insert(partition.0, processor);
        log::info!("CA partition {partition} opened");
    }

    pub async fn process(&self, partition: PartitionId, batch: Vec<RawEvent>) -> Result<()> {
        let mut processors = self.processors.lock().await;
        match processors.get_mut(&partition.0) {
            Some(processor) => processor.process(batch).await,
            None => {
                log::warn!("CA process() called for unopened partition {partition}");
                Ok(())
            }
        }
    }

    pub async fn close(&self, partition: PartitionId, reason: CloseReason) -> Result<()> {
        let mut processors = self.processors.lock().await;
        if let Some(processor) = processors.get_mut(&partition.0) {
            processor.close(reason).await?;
        }
        processors.remove(&partition.0);
        log::info!("CA partition {partition} closed ({reason:?})");
        Ok(())
    }

    pub async fn close_all(&self, reason: CloseReason) {
        let partitions: Vec<i32> = self.processors.lock().await.keys().copied().collect();
        for p in partitions {
            if let Err(err) = self.close(PartitionId(p), reason).await {
                log::error!("error closing CA partition {p}: {err}");
            }
        }
    }
}
