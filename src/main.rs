//! C10 — Process Bootstrap: logger init, config load, Kafka consumer
//! construction, shared HTTP clients, per-partition processor factories,
//! and signal-driven shutdown (§4.9). Ordering mirrors `siem_consumer::main`
//! (`dotenvy::dotenv()` then `env_logger::init()` before anything else).
//!
//! The real partition broker (lease management, partition assignment,
//! message delivery) is out of scope (§1); everything below this line is
//! the minimal rdkafka-backed implementation of the Consumer Host contract
//! (§6) needed to run the pipeline standalone. Partitions are opened
//! lazily on first message and closed on clean shutdown; a production
//! deployment would instead drive `open`/`close` from a real rebalance
//! listener (see DESIGN.md).

use axum::{extract::State, routing::get, Json, Router};
use event_gateway::ca::{AzureBlobAccountClient, BlobAccountClient};
use event_gateway::config::AppConfig;
use event_gateway::es::EsSubmitter;
use event_gateway::host::{CaHost, CaSinkTemplate, CloseReason, EsHost, KafkaCheckpointer};
use event_gateway::models::{PartitionId, PropertyValue, RawEvent};
use log::{error, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Process-wide counters backing the `/metrics` endpoint (§4.9), scoped to
/// this system's own concerns rather than a generic framework's.
#[derive(Default)]
struct Metrics {
    es_events_processed: AtomicU64,
    ca_events_processed: AtomicU64,
    es_batches: AtomicU64,
    ca_batches: AtomicU64,
}

async fn get_metrics(State(metrics): State<Arc<Metrics>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "esEventsProcessed": metrics.es_events_processed.load(Ordering::Relaxed),
        "caEventsProcessed": metrics.ca_events_processed.load(Ordering::Relaxed),
        "esBatches": metrics.es_batches.load(Ordering::Relaxed),
        "caBatches": metrics.ca_batches.load(Ordering::Relaxed),
    }))
}

async fn get_healthz() -> &'static str {
    "ok"
}

fn build_consumer(brokers: &str, group_id: &str) -> anyhow::Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "10000")
        .create()?;
    Ok(consumer)
}

/// Extracts the `Type`/`MessageId`/`Timestamp`/`Source` properties the
/// classifier reads (§6) from Kafka message headers; every other header is
/// dropped, since the pipeline never consults them.
fn raw_event_from_message(msg: &BorrowedMessage<'_>) -> RawEvent {
    let mut properties = HashMap::new();
    if let Some(headers) = msg.headers() {
        for idx in 0..headers.count() {
            let header = headers.get(idx);
            if let Some(value) = header.value {
                if let Ok(s) = std::str::from_utf8(value) {
                    properties.insert(header.key.to_string(), PropertyValue::Str(s.to_string()));
                }
            }
        }
    }
    let enqueued_at = msg
        .timestamp()
        .to_millis()
        .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
        .unwrap_or_else(chrono::Utc::now);
    RawEvent {
        body: msg.payload().unwrap_or_default().to_vec(),
        enqueued_at,
        properties,
    }
}

/// Drains the consumer's stream, grouping consecutive messages into
/// per-partition batches, and dispatches each batch to `process`. A
/// partition is opened (lazily) the first time a message for it arrives and
/// its offset is stored once its batch has been durably handled, so the
/// partition's `KafkaCheckpointer` always commits progress the pipeline has
/// actually delivered.
async fn run_pipeline<F, FutOpen, G, FutProcess>(
    pipeline: &'static str,
    consumer: Arc<StreamConsumer>,
    topic: String,
    batch_size: usize,
    batch_timeout: Duration,
    cancellation: CancellationToken,
    opened: Arc<Mutex<std::collections::HashSet<i32>>>,
    mut ensure_open: F,
    mut process: G,
) where
    F: FnMut(PartitionId) -> FutOpen,
    FutOpen: std::future::Future<Output = event_gateway::Result<()>>,
    G: FnMut(PartitionId, Vec<RawEvent>) -> FutProcess,
    FutProcess: std::future::Future<Output = event_gateway::Result<()>>,
{
    consumer
        .subscribe(&[topic.as_str()])
        .unwrap_or_else(|err| panic!("{pipeline}: failed to subscribe to {topic}: {err}"));

    let mut batches: HashMap<i32, (Vec<RawEvent>, i64)> = HashMap::new();
    let mut ticker = tokio::time::interval(batch_timeout);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                info!("{pipeline}: shutdown signal received, draining remaining batches");
                for (partition, (batch, last_offset)) in batches.drain() {
                    flush_one(pipeline, &consumer, &topic, partition, batch, last_offset, &mut process).await;
                }
                return;
            }
            _ = ticker.tick() => {
                let ready: Vec<i32> = batches.keys().copied().collect();
                for partition in ready {
                    if let Some((batch, last_offset)) = batches.remove(&partition) {
                        if !batch.is_empty() {
                            flush_one(pipeline, &consumer, &topic, partition, batch, last_offset, &mut process).await;
                        }
                    }
                }
            }
            msg = consumer.recv() => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("{pipeline}: consumer error: {err}");
                        continue;
                    }
                };
                let partition = msg.partition();
                if opened.lock().await.insert(partition) {
                    if let Err(err) = ensure_open(PartitionId(partition)).await {
                        error!("{pipeline}: failed to open partition {partition}: {err}");
                        continue;
                    }
                }
                let offset = msg.offset();
                let raw = raw_event_from_message(&msg);
                let entry = batches.entry(partition).or_insert_with(|| (Vec::new(), offset));
                entry.0.push(raw);
                entry.1 = offset;
                if entry.0.len() >= batch_size {
                    if let Some((batch, last_offset)) = batches.remove(&partition) {
                        flush_one(pipeline, &consumer, &topic, partition, batch, last_offset, &mut process).await;
                    }
                }
            }
        }
    }
}

async fn flush_one<Fut>(
    pipeline: &'static str,
    consumer: &StreamConsumer,
    topic: &str,
    partition: i32,
    batch: Vec<RawEvent>,
    last_offset: i64,
    process: &mut impl FnMut(PartitionId, Vec<RawEvent>) -> Fut,
) where
    Fut: std::future::Future<Output = event_gateway::Result<()>>,
{
    let batch_len = batch.len();
    match process(PartitionId(partition), batch).await {
        Ok(()) => {
            if let Err(err) = consumer.store_offset(topic, partition, last_offset + 1) {
                warn!("{pipeline}: failed to store offset for partition {partition}: {err}");
            }
        }
        Err(err) => {
            error!("{pipeline}: batch of {batch_len} failed for partition {partition}, will be redelivered: {err}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    info!("starting event_gateway");
    let config = AppConfig::load()?;
    info!("configuration loaded: {:?} / {:?} / {:?}", config.kafka, config.es, config.ca);

    let http_client = reqwest::Client::builder().gzip(true).build()?;
    let cancellation = CancellationToken::new();

    let es_submitter = Arc::new(EsSubmitter::new(
        http_client.clone(),
        config.es.endpoint.clone(),
        config.es.username.clone(),
        config.es.password.clone(),
    ));
    let es_host = Arc::new(EsHost::new(es_submitter, config.es.stats_enabled, config.es.checkpoint_interval()));

    let blob_accounts: Vec<Arc<dyn BlobAccountClient>> = config
        .ca
        .blob_accounts
        .iter()
        .filter_map(|entry| AzureBlobAccountClient::from_connection_entry(entry))
        .map(|client| Arc::new(client) as Arc<dyn BlobAccountClient>)
        .collect();
    if blob_accounts.is_empty() {
        anyhow::bail!("no usable ca.blob_accounts entries (expected \"account_name:access_key\")");
    }

    let ca_sink_template = CaSinkTemplate {
        capacity_bytes: config.ca.buffer_capacity_bytes,
        compression_enabled: config.ca.compression_enabled,
        base_container_name: config.ca.base_container.clone(),
        notification_endpoint: config.ca.notification_endpoint.clone(),
        instrumentation_key: config.ca.instrumentation_key.clone(),
        max_blob_write_attempts: 10,
        notification_max_retries: 10,
    };
    let ca_host = Arc::new(CaHost::new(
        ca_sink_template,
        blob_accounts,
        http_client.clone(),
        cancellation.clone(),
        config.ca.schema_log_id,
        config.ca.schema_interactions_id,
        config.ca.stats_enabled,
        config.ca.checkpoint_interval(),
    ));

    let es_consumer = Arc::new(build_consumer(&config.kafka.brokers, &config.kafka.es_group_id)?);
    let ca_consumer = Arc::new(build_consumer(&config.kafka.brokers, &config.kafka.ca_group_id)?);

    let metrics = Arc::new(Metrics::default());

    let es_task = {
        let es_host = es_host.clone();
        let es_consumer = es_consumer.clone();
        let topic = config.kafka.topic.clone();
        let checkpoint_topic = config.kafka.topic.clone();
        let run_cancellation = cancellation.clone();
        let partition_cancellation = cancellation.clone();
        let metrics = metrics.clone();
        let opened = Arc::new(Mutex::new(std::collections::HashSet::new()));
        tokio::spawn(async move {
            run_pipeline(
                "es",
                es_consumer.clone(),
                topic,
                500,
                Duration::from_secs(1),
                run_cancellation,
                opened,
                {
                    let es_host = es_host.clone();
                    let es_consumer = es_consumer.clone();
                    move |partition| {
                        let es_host = es_host.clone();
                        let es_consumer = es_consumer.clone();
                        let checkpoint_topic = checkpoint_topic.clone();
                        let cancellation = partition_cancellation.clone();
                        async move {
                            let checkpointer = KafkaCheckpointer::new(es_consumer, checkpoint_topic, partition);
                            es_host.open(partition, checkpointer, cancellation).await;
                            Ok(())
                        }
                    }
                },
                move |partition, batch| {
                    let es_host = es_host.clone();
                    let metrics = metrics.clone();
                    let n = batch.len() as u64;
                    async move {
                        let result = es_host.process(partition, batch).await;
                        if result.is_ok() {
                            metrics.es_events_processed.fetch_add(n, Ordering::Relaxed);
                            metrics.es_batches.fetch_add(1, Ordering::Relaxed);
                        }
                        result
                    }
                },
            )
            .await;
        })
    };

    let ca_task = {
        let ca_host = ca_host.clone();
        let ca_consumer = ca_consumer.clone();
        let topic = config.kafka.topic.clone();
        let checkpoint_topic = config.kafka.topic.clone();
        let run_cancellation = cancellation.clone();
        let metrics = metrics.clone();
        let opened = Arc::new(Mutex::new(std::collections::HashSet::new()));
        tokio::spawn(async move {
            run_pipeline(
                "ca",
                ca_consumer.clone(),
                topic,
                500,
                Duration::from_secs(1),
                run_cancellation,
                opened,
                {
                    let ca_host = ca_host.clone();
                    let ca_consumer = ca_consumer.clone();
                    move |partition| {
                        let ca_host = ca_host.clone();
                        let ca_consumer = ca_consumer.clone();
                        let checkpoint_topic = checkpoint_topic.clone();
                        async move {
                            let checkpointer = KafkaCheckpointer::new(ca_consumer, checkpoint_topic, partition);
                            ca_host.open(partition, checkpointer).await;
                            Ok(())
                        }
                    }
                },
                move |partition, batch| {
                    let ca_host = ca_host.clone();
                    let metrics = metrics.clone();
                    let n = batch.len() as u64;
                    async move {
                        let result = ca_host.process(partition, batch).await;
                        if result.is_ok() {
                            metrics.ca_events_processed.fetch_add(n, Ordering::Relaxed);
                            metrics.ca_batches.fetch_add(1, Ordering::Relaxed);
                        }
                        result
                    }
                },
            )
            .await;
        })
    };

    let app = Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:9091").await?;
    info!("status endpoints listening on http://0.0.0.0:9091 (/healthz, /metrics)");
    let http_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("status server error: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, closing all partitions");
    cancellation.cancel();
    es_host.close_all(CloseReason::Shutdown).await;
    ca_host.close_all(CloseReason::Shutdown).await;
    http_task.abort();

    let _ = tokio::time::timeout(Duration::from_secs(5), es_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), ca_task).await;

    info!("event_gateway stopped");
    Ok(())
}
