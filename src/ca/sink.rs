//! C5 — CA Schema Sink: a per-schema append-only buffer that flushes to a
//! randomly-chosen blob account once full, optionally gzip-compressed, and
//! registers the upload with the analytics service via a notification
//! callback (§4.5).

use crate::errors::{IngestError, Result};
use crate::models::CaRecord;
use crate::retry::{send_with_retries, standard_backoff, RetryBudget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use rand::Rng;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result of a blob account operation, distinguishing "container doesn't
/// exist yet" from every other failure so the sink can create-and-retry
/// only in that one case (§4.5).
#[derive(Debug)]
pub enum BlobError {
    NotFound,
    Other(String),
}

#[async_trait]
pub trait BlobAccountClient: Send + Sync {
    fn account_name(&self) -> &str;

    async fn upload_blob(
        &self,
        container: &str,
        blob_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> std::result::Result<(), BlobError>;

    async fn create_container(&self, container: &str) -> std::result::Result<(), BlobError>;

    /// A read-only SAS URI for the given blob, valid for `ttl`.
    async fn sas_uri(&self, container: &str, blob_name: &str, ttl: Duration) -> String;
}

/// Seam over the gzip step so a compression failure can be forced in tests
/// without fabricating bad input bytes (§9 design note: a mid-flush failure
/// here must leave the buffer intact for a later retry).
trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| IngestError::Compression(e.to_string()))?;
        encoder.finish().map_err(|e| IngestError::Compression(e.to_string()))
    }
}

pub struct SchemaSinkConfig {
    pub schema_name: &'static str,
    pub schema_id: Uuid,
    pub capacity_bytes: usize,
    pub compression_enabled: bool,
    pub base_container_name: String,
    pub notification_endpoint: String,
    pub instrumentation_key: String,
    pub max_blob_write_attempts: u32,
    pub notification_max_retries: u32,
}

#[derive(Default)]
struct FlushBufferState {
    buf: Vec<u8>,
    event_count: u64,
    oldest_doc: Option<DateTime<Utc>>,
}

pub struct CaSchemaSink {
    config: SchemaSinkConfig,
    state: Mutex<FlushBufferState>,
    accounts: Vec<Arc<dyn BlobAccountClient>>,
    http: reqwest::Client,
    cancellation: CancellationToken,
    compressor: Box<dyn Compressor>,
}

impl CaSchemaSink {
    pub fn new(
        config: SchemaSinkConfig,
        accounts: Vec<Arc<dyn BlobAccountClient>>,
        http: reqwest::Client,
        cancellation: CancellationToken,
    ) -> Self {
        assert!(!accounts.is_empty(), "CA sink needs at least one blob account");
        CaSchemaSink {
            config,
            state: Mutex::new(FlushBufferState::default()),
            accounts,
            http,
            cancellation,
            compressor: Box::new(GzipCompressor),
        }
    }

    /// Appends one record, flushing first if it wouldn't fit. Returns
    /// whether a flush occurred (§4.5 step 2-3).
    pub async fn append(&self, record: &CaRecord) -> Result<bool> {
        let bytes = record.to_json_line()?.into_bytes();
        if bytes.len() > self.config.capacity_bytes {
            let prefix = String::from_utf8_lossy(&bytes[..bytes.len().min(1000)]).into_owned();
            log::error!(
                "dropping oversize CA record for schema {} ({} bytes > capacity {}): {}",
                self.config.schema_name,
                bytes.len(),
                self.config.capacity_bytes,
                prefix
            );
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let separator_len: usize = if state.buf.is_empty() { 0 } else { 2 };
        if state.buf.len() + separator_len + bytes.len() <= self.config.capacity_bytes {
            if separator_len > 0 {
                state.buf.extend_from_slice(b"\r\n");
            }
            state.buf.extend_from_slice(&bytes);
            state.event_count += 1;
            let ts = record.timestamp();
            state.oldest_doc = Some(state.oldest_doc.map_or(ts, |o| o.min(ts)));
            Ok(false)
        } else {
            self.flush_locked(&mut state).await?;
            state.buf.extend_from_slice(&bytes);
            state.event_count = 1;
            state.oldest_doc = Some(record.timestamp());
            Ok(true)
        }
    }

    /// Explicit flush regardless of threshold, used on periodic checkpoint
    /// and on shutdown. A no-op on an empty buffer.
    pub async fn flush_now(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.buf.is_empty() {
            return Ok(());
        }
        self.flush_locked(&mut state).await
    }

    pub fn event_count(&self) -> u64 {
        // Best-effort snapshot; only used for instrumentation, so a
        // try_lock miss just reports zero rather than blocking.
        self.state.try_lock().map(|s| s.event_count).unwrap_or(0)
    }

    async fn flush_locked(&self, state: &mut FlushBufferState) -> Result<()> {
        let payload = if self.config.compression_enabled {
            self.compressor.compress(&state.buf)?
        } else {
            state.buf.clone()
        };
        let ext = if self.config.compression_enabled { "json.gz" } else { "json" };
        let content_type = if self.config.compression_enabled {
            "application/gzip"
        } else {
            "application/json"
        };

        let now = Utc::now();
        let blob_name = format!(
            "{}_{}_{}.{}",
            Uuid::new_v4(),
            now.format("%Y-%m-%d-%H-%M-%S"),
            self.config.schema_name,
            ext
        );

        let (account_idx, container) = self
            .upload_with_retries(&blob_name, payload, content_type)
            .await?;
        self.notify(account_idx, &container, &blob_name).await;

        state.buf.clear();
        state.event_count = 0;
        state.oldest_doc = None;
        Ok(())
    }

    /// Returns the account index and container name that the upload
    /// ultimately succeeded against, so the notification callback can mint
    /// its SAS URI from the same account.
    async fn upload_with_retries(
        &self,
        blob_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(usize, String)> {
        let mut account_idx = self.pick_account_index();
        let mut container = container_name(&self.config.base_container_name);
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_blob_write_attempts {
            let account = &self.accounts[account_idx];
            match account
                .upload_blob(&container, blob_name, payload.clone(), content_type)
                .await
            {
                Ok(()) => return Ok((account_idx, container)),
                Err(BlobError::NotFound) => {
                    if let Err(err) = account.create_container(&container).await {
                        last_error = format!("container create failed: {err:?}");
                    } else if let Err(err) = account
                        .upload_blob(&container, blob_name, payload.clone(), content_type)
                        .await
                    {
                        last_error = format!("{err:?}");
                    } else {
                        return Ok((account_idx, container));
                    }
                }
                Err(BlobError::Other(msg)) => {
                    last_error = msg;
                    account_idx = self.pick_account_index();
                    container = container_name(&self.config.base_container_name);
                }
            }

            if attempt < self.config.max_blob_write_attempts {
                tokio::time::sleep(standard_backoff(attempt)).await;
            }
        }

        Err(IngestError::CaFlushExhausted {
            attempts: self.config.max_blob_write_attempts,
            last_error,
        })
    }

    async fn notify(&self, account_idx: usize, container: &str, blob_name: &str) {
        let sas_uri = self.accounts[account_idx]
            .sas_uri(container, blob_name, Duration::from_secs(24 * 3600))
            .await;

        let payload = serde_json::json!({
            "ver": "1",
            "name": format!("{}OpenSchema", self.config.schema_name),
            "time": Utc::now().to_rfc3339(),
            "iKey": self.config.instrumentation_key,
            "data": {
                "baseType": "OpenSchemaData",
                "baseData": {
                    "ver": "2",
                    "blobSasUri": sas_uri,
                    "sourceName": self.config.schema_id.to_string(),
                    "sourceVersion": "1.0",
                }
            }
        });

        let endpoint = self.config.notification_endpoint.clone();
        let http = self.http.clone();
        let result = send_with_retries(
            RetryBudget::Bounded(self.config.notification_max_retries),
            standard_backoff,
            &self.cancellation,
            move |_attempt| {
                let http = http.clone();
                let endpoint = endpoint.clone();
                let payload = payload.clone();
                async move { http.post(&endpoint).json(&payload).send().await }
            },
            |r: &std::result::Result<reqwest::Response, reqwest::Error>| {
                matches!(r, Ok(resp) if resp.status().is_success())
            },
        )
        .await;

        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {}
            Ok(Ok(resp)) => log::error!(
                "CA notification callback exhausted {} attempts with status {}",
                self.config.notification_max_retries,
                resp.status()
            ),
            Ok(Err(err)) => log::error!(
                "CA notification callback exhausted {} attempts: {err}",
                self.config.notification_max_retries
            ),
            Err(_cancelled) => log::info!("CA notification callback cancelled"),
        }
    }

    fn pick_account_index(&self) -> usize {
        rand::thread_rng().gen_range(0..self.accounts.len())
    }
}

fn container_name(base: &str) -> String {
    let date_key = Utc::now().format("%Y-%m-%d-%H").to_string();
    let mut hasher = Md5::new();
    hasher.update(date_key.as_bytes());
    let digest = hasher.finalize();
    let hash_hex = format!("{digest:x}");
    format!("{}-{}-{}", &hash_hex[..5], base, date_key)
}
