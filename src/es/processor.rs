//! C4 — ES Processor: orchestrates one `process(partition, batch)` call —
//! classify, frame, submit, retry failures, quarantine survivors, drive
//! checkpoint (§4.4).

use crate::checkpoint::{CheckpointCoordinator, PartitionCheckpointer};
use crate::classifier::classify;
use crate::errors::{IngestError, Result};
use crate::es::framer::{frame_batch, BatchStats};
use crate::es::submitter::{is_clean_success, is_transport_success, EsResponse, EsSubmitter};
use crate::models::{BulkItem, ClassifiedEvent, PartitionId, RawEvent};
use crate::retry::{es_backoff, send_with_retries, Cancelled, RetryBudget};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MAX_FAILED_DOC_RETRIES: u32 = 10;
const MAX_ABANDONED_DOC_RETRIES: u32 = 10;
const CHECKPOINT_MIN_INTERVAL: Duration = Duration::from_secs(60);

pub struct EsProcessorConfig {
    pub partition: PartitionId,
    pub stats_enabled: bool,
    pub max_failed_doc_retries: u32,
    pub max_abandoned_doc_retries: u32,
    pub checkpoint_min_interval: Duration,
}

impl EsProcessorConfig {
    pub fn new(partition: PartitionId, stats_enabled: bool) -> Self {
        EsProcessorConfig {
            partition,
            stats_enabled,
            max_failed_doc_retries: MAX_FAILED_DOC_RETRIES,
            max_abandoned_doc_retries: MAX_ABANDONED_DOC_RETRIES,
            checkpoint_min_interval: CHECKPOINT_MIN_INTERVAL,
        }
    }
}

pub struct EsProcessor<C: PartitionCheckpointer> {
    config: EsProcessorConfig,
    submitter: Arc<EsSubmitter>,
    checkpoint: CheckpointCoordinator<C>,
    cancellation: CancellationToken,
    stats: BatchStats,
}

impl<C: PartitionCheckpointer> EsProcessor<C> {
    pub fn new(
        config: EsProcessorConfig,
        submitter: Arc<EsSubmitter>,
        checkpointer: C,
        cancellation: CancellationToken,
    ) -> Self {
        let min_interval = config.checkpoint_min_interval;
        EsProcessor {
            config,
            submitter,
            checkpoint: CheckpointCoordinator::new(checkpointer, min_interval),
            cancellation,
            stats: BatchStats::default(),
        }
    }

    pub async fn process(&mut self, batch: Vec<RawEvent>) -> Result<()> {
        let batch_size = batch.len();
        let mut valid: Vec<BulkItem> = Vec::with_capacity(batch_size);
        let mut invalid_abandoned: Vec<BulkItem> = Vec::new();

        for raw in &batch {
            match classify(raw) {
                ClassifiedEvent::Valid(item) => valid.push(item),
                ClassifiedEvent::Invalid(item) => invalid_abandoned.push(BulkItem::abandoned(
                    &item.doc_id,
                    &item.body,
                    &item.invalid_reason,
                    item.timestamp,
                )),
            }
        }

        let mut error_reasons: HashMap<String, String> = HashMap::new();
        let mut failed_items: Vec<BulkItem> = Vec::new();

        let framed = frame_batch(&valid, self.config.partition, self.config.stats_enabled, &self.stats);
        if !framed.body.is_empty() {
            let started = Instant::now();
            let response = self.submit_with_retries(framed.body, RetryBudget::Unbounded, is_transport_success).await?;
            self.stats.last_batch_elapsed_ms = started.elapsed().as_millis() as i64;

            record_failures(&response, &valid, &mut error_reasons);
            failed_items = valid
                .iter()
                .filter(|i| error_reasons.contains_key(&i.doc_id))
                .cloned()
                .collect();
        }
        self.stats.last_batch_failed_docs = failed_items.len() as u64;

        if !failed_items.is_empty() {
            let framed = frame_batch(&failed_items, self.config.partition, false, &BatchStats::default());
            let response = self
                .submit_with_retries(
                    framed.body,
                    RetryBudget::Bounded(self.config.max_failed_doc_retries),
                    is_clean_success,
                )
                .await?;
            record_failures(&response, &failed_items, &mut error_reasons);
            let still_failing: Vec<BulkItem> = failed_items
                .iter()
                .filter(|i| error_reasons.contains_key(&i.doc_id))
                .cloned()
                .collect();
            for item in &still_failing {
                let reason = error_reasons
                    .get(&item.doc_id)
                    .cloned()
                    .unwrap_or_else(|| "ES indexing failed".to_string());
                invalid_abandoned.push(BulkItem::abandoned(&item.doc_id, &item.body, &reason, item.timestamp));
            }
        }

        self.stats.last_batch_abandoned_docs = invalid_abandoned.len() as u64;

        if !invalid_abandoned.is_empty() {
            let framed = frame_batch(&invalid_abandoned, self.config.partition, false, &BatchStats::default());
            self.submit_with_retries(
                framed.body,
                RetryBudget::Bounded(self.config.max_abandoned_doc_retries),
                is_clean_success,
            )
            .await?;
        }

        self.checkpoint.maybe_checkpoint().await?;
        Ok(())
    }

    /// Unconditional checkpoint on clean shutdown only (§4.4 "Close behavior").
    pub async fn close(&mut self, reason: crate::host::CloseReason) -> Result<()> {
        if reason == crate::host::CloseReason::Shutdown {
            self.checkpoint.force_checkpoint().await?;
        }
        Ok(())
    }

    async fn submit_with_retries(
        &self,
        body: String,
        budget: RetryBudget,
        predicate: impl FnMut(&EsResponse) -> bool,
    ) -> Result<EsResponse> {
        let submitter = self.submitter.clone();
        let partition = self.config.partition;
        let result = send_with_retries(
            budget,
            es_backoff,
            &self.cancellation,
            move |attempt| {
                if attempt > 1 && attempt % 10 == 0 {
                    log::warn!("ES submit for partition {partition} still retrying after {attempt} attempts");
                }
                let submitter = submitter.clone();
                let body = body.clone();
                async move { submitter.submit(body).await }
            },
            predicate,
        )
        .await;

        match result {
            Ok(response) => Ok(response),
            Err(Cancelled) => {
                log::info!("ES submit cancelled for partition {}", self.config.partition);
                Err(IngestError::Cancelled)
            }
        }
    }
}

/// Folds one submit response's outcome into the running failed-doc-id map.
/// `candidates` is only consulted for `ServerErrorStructured`, where the
/// response carries no per-item detail and every item in the attempt must
/// be treated as failing.
fn record_failures(response: &EsResponse, candidates: &[BulkItem], error_reasons: &mut HashMap<String, String>) {
    match response {
        EsResponse::ServerSuccess(body) => {
            if body.errors {
                for item in &body.items {
                    if item.is_error() {
                        let reason = item
                            .error
                            .as_ref()
                            .map(|e| e.reason.clone())
                            .unwrap_or_else(|| "ES indexing failed".to_string());
                        error_reasons.insert(item.id.clone(), reason);
                    } else {
                        error_reasons.remove(&item.id);
                    }
                }
            } else {
                error_reasons.clear();
            }
        }
        EsResponse::ServerErrorStructured { status, body } => {
            let reason = format!("ES returned HTTP {status}: {}", truncate(body, 500));
            for item in candidates {
                error_reasons.insert(item.doc_id.clone(), reason.clone());
            }
        }
        EsResponse::TransportFailed => {}
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
