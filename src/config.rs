//! C9 — Config Loader: layers an optional `config.toml` under
//! `SIEM_INGEST__`-prefixed environment variables, the same strategy as
//! `siem_clickhouse_ingestion::config::Config::load_with_overrides` (double
//! underscore separating section and key). Fails fast on an invalid or
//! incomplete configuration rather than deferring to a runtime error deep
//! inside a pipeline.

use anyhow::{bail, Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub kafka: KafkaConfig,
    pub es: EsConfig,
    pub ca: CaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub es_group_id: String,
    pub ca_group_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

#[derive(Deserialize)]
pub struct EsConfig {
    pub endpoint: String,
    pub username: Option<String>,
    /// Never printed: the custom `Debug` impl below redacts it.
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub stats_enabled: bool,
    #[serde(default = "default_es_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

#[derive(Deserialize)]
pub struct CaConfig {
    pub notification_endpoint: String,
    /// Never printed: the custom `Debug` impl below redacts it.
    pub instrumentation_key: String,
    pub base_container: String,
    pub buffer_capacity_bytes: usize,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_true")]
    pub stats_enabled: bool,
    /// Each entry is `account_name:access_key`; never printed in full.
    pub blob_accounts: Vec<String>,
    pub schema_log_id: Uuid,
    pub schema_interactions_id: Uuid,
    #[serde(default = "default_ca_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

fn default_topic() -> String {
    "ingest-events".to_string()
}
fn default_true() -> bool {
    true
}
fn default_es_checkpoint_interval() -> u64 {
    60
}
fn default_ca_checkpoint_interval() -> u64 {
    180
}

impl EsConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

impl CaConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

/// Manual `Debug` so secrets (ES basic-auth password, blob-account keys,
/// instrumentation key) never end up in a log line via `{:?}` (§4.8).
impl std::fmt::Debug for EsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("stats_enabled", &self.stats_enabled)
            .field("checkpoint_interval_secs", &self.checkpoint_interval_secs)
            .finish()
    }
}

impl Clone for EsConfig {
    fn clone(&self) -> Self {
        EsConfig {
            endpoint: self.endpoint.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            stats_enabled: self.stats_enabled,
            checkpoint_interval_secs: self.checkpoint_interval_secs,
        }
    }
}

impl std::fmt::Debug for CaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaConfig")
            .field("notification_endpoint", &self.notification_endpoint)
            .field("instrumentation_key", &"<redacted>")
            .field("base_container", &self.base_container)
            .field("buffer_capacity_bytes", &self.buffer_capacity_bytes)
            .field("compression_enabled", &self.compression_enabled)
            .field("stats_enabled", &self.stats_enabled)
            .field("blob_accounts", &vec!["<redacted>"; self.blob_accounts.len()])
            .field("schema_log_id", &self.schema_log_id)
            .field("schema_interactions_id", &self.schema_interactions_id)
            .field("checkpoint_interval_secs", &self.checkpoint_interval_secs)
            .finish()
    }
}

impl Clone for CaConfig {
    fn clone(&self) -> Self {
        CaConfig {
            notification_endpoint: self.notification_endpoint.clone(),
            instrumentation_key: self.instrumentation_key.clone(),
            base_container: self.base_container.clone(),
            buffer_capacity_bytes: self.buffer_capacity_bytes,
            compression_enabled: self.compression_enabled,
            stats_enabled: self.stats_enabled,
            blob_accounts: self.blob_accounts.clone(),
            schema_log_id: self.schema_log_id,
            schema_interactions_id: self.schema_interactions_id,
            checkpoint_interval_secs: self.checkpoint_interval_secs,
        }
    }
}

impl AppConfig {
    /// Loads `$SIEM_INGEST_CONFIG_PATH` (default `config.toml`, if present)
    /// and layers `SIEM_INGEST__`-prefixed environment variables over it,
    /// then validates. Mirrors `Config::load_with_overrides` in the
    /// teacher's ingestion crate.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("SIEM_INGEST_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = ConfigBuilder::builder();
        if Path::new(&config_path).exists() {
            builder = builder.add_source(File::new(&config_path, FileFormat::Toml));
        }
        builder = builder.add_source(Environment::with_prefix("SIEM_INGEST").separator("__").try_parsing(true));

        let config: AppConfig = builder
            .build()
            .with_context(|| format!("failed to assemble configuration from {config_path}"))?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            bail!("kafka.brokers must not be empty");
        }
        if self.kafka.es_group_id.trim().is_empty() || self.kafka.ca_group_id.trim().is_empty() {
            bail!("kafka.es_group_id and kafka.ca_group_id must not be empty");
        }
        Url::parse(&self.es.endpoint).with_context(|| format!("invalid es.endpoint: {}", self.es.endpoint))?;
        Url::parse(&self.ca.notification_endpoint)
            .with_context(|| format!("invalid ca.notification_endpoint: {}", self.ca.notification_endpoint))?;
        if self.ca.buffer_capacity_bytes == 0 {
            bail!("ca.buffer_capacity_bytes must be greater than 0");
        }
        if self.ca.blob_accounts.is_empty() {
            bail!("ca.blob_accounts must list at least one account");
        }
        for entry in &self.ca.blob_accounts {
            if !entry.contains(':') {
                bail!("ca.blob_accounts entries must be \"account_name:access_key\"");
            }
        }
        Ok(())
    }
}
