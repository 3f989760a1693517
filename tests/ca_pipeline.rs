//! CA schema sink flush/notification scenarios (spec.md §8 scenario 7,
//! §4.5's byte-accounting invariant), exercised against a real `reqwest`
//! client talking to a `wiremock`-mocked notification endpoint and an
//! in-memory fake in place of the Azure blob client, matching the split the
//! unit tests in `src/ca/sink.rs` already use for the blob side.

use async_trait::async_trait;
use event_gateway::ca::{BlobAccountClient, BlobError, CaSchemaSink, SchemaSinkConfig};
use event_gateway::models::{CaEnvelope, CaRecord, LogRecord};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FakeAccount {
    uploaded_bytes: Mutex<Vec<usize>>,
}

#[async_trait]
impl BlobAccountClient for FakeAccount {
    fn account_name(&self) -> &str {
        "fake"
    }

    async fn upload_blob(
        &self,
        _container: &str,
        _blob_name: &str,
        payload: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BlobError> {
        self.uploaded_bytes.lock().unwrap().push(payload.len());
        Ok(())
    }

    async fn create_container(&self, _container: &str) -> Result<(), BlobError> {
        Ok(())
    }

    async fn sas_uri(&self, container: &str, blob_name: &str, _ttl: Duration) -> String {
        format!("https://fake.blob.example/{container}/{blob_name}?sas=1")
    }
}

fn log_record(message: &str) -> CaRecord {
    CaRecord::Log(LogRecord {
        envelope: CaEnvelope {
            schema_name: "Log".to_string(),
            schema_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            correlation_id: None,
            machine_name: None,
            message_id: Uuid::new_v4().to_string(),
            blob: serde_json::json!({}),
        },
        level: Some("Information".to_string()),
        message: Some(message.to_string()),
        message_template: None,
        application_name: None,
    })
}

fn sink_with(server: &MockServer, account: Arc<FakeAccount>, capacity: usize) -> CaSchemaSink {
    CaSchemaSink::new(
        SchemaSinkConfig {
            schema_name: "Log",
            schema_id: Uuid::new_v4(),
            capacity_bytes: capacity,
            compression_enabled: false,
            base_container_name: "logs".to_string(),
            notification_endpoint: format!("{}/openschema", server.uri()),
            instrumentation_key: "ikey".to_string(),
            max_blob_write_attempts: 10,
            notification_max_retries: 2,
        },
        vec![account as Arc<dyn BlobAccountClient>],
        reqwest::Client::new(),
        CancellationToken::new(),
    )
}

/// §8: "total bytes uploaded (ignoring compression) = S + (#appends -
/// #flushes) separator bytes", exercised with compression disabled so the
/// uploaded length is directly comparable to the appended JSON lines.
#[tokio::test]
async fn byte_accounting_matches_appended_size_plus_separators() {
    let server = MockServer::start().await;
    let notifications = Arc::new(AtomicU32::new(0));
    {
        let notifications = notifications.clone();
        Mock::given(method("POST"))
            .respond_with(move |_req: &wiremock::Request| {
                notifications.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200)
            })
            .mount(&server)
            .await;
    }

    let account = Arc::new(FakeAccount {
        uploaded_bytes: Mutex::new(Vec::new()),
    });
    // Small capacity so a handful of short log lines force exactly one flush.
    let sink = sink_with(&server, account.clone(), 64);

    let records: Vec<CaRecord> = (0..6).map(|i| log_record(&format!("line {i}"))).collect();
    let encoded: Vec<usize> = records.iter().map(|r| r.to_json_line().unwrap().len()).collect();

    for record in &records {
        sink.append(record).await.unwrap();
    }
    // Drains whatever is still buffered after the size-triggered flushes
    // above; a no-op if the last append already emptied the buffer.
    sink.flush_now().await.unwrap();

    let total_flushes = account.uploaded_bytes.lock().unwrap().len();
    let total_uploaded: usize = account.uploaded_bytes.lock().unwrap().iter().sum();
    let s: usize = encoded.iter().sum();
    // Each flush's buffer has one fewer `\r\n` separator than it has
    // records; summed across flushes that's (#appends - #flushes).
    let separator_bytes = 2 * (records.len() - total_flushes);
    assert_eq!(total_uploaded, s + separator_bytes);
    assert!(notifications.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let account = Arc::new(FakeAccount {
        uploaded_bytes: Mutex::new(Vec::new()),
    });
    let sink = sink_with(&server, account.clone(), 4096);

    sink.append(&log_record("hello")).await.unwrap();
    // The blob is already durably uploaded even though every notification
    // attempt below will fail (§4.5, §7 Notification-CallbackError): the
    // flush must still report success.
    sink.flush_now().await.unwrap();

    assert_eq!(account.uploaded_bytes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn flush_now_on_empty_buffer_contacts_neither_blob_nor_notification() {
    let server = MockServer::start().await;
    let notifications = Arc::new(AtomicU32::new(0));
    {
        let notifications = notifications.clone();
        Mock::given(method("POST"))
            .respond_with(move |_req: &wiremock::Request| {
                notifications.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200)
            })
            .mount(&server)
            .await;
    }

    let account = Arc::new(FakeAccount {
        uploaded_bytes: Mutex::new(Vec::new()),
    });
    let sink = sink_with(&server, account.clone(), 4096);
    sink.flush_now().await.unwrap();

    assert_eq!(account.uploaded_bytes.lock().unwrap().len(), 0);
    assert_eq!(notifications.load(Ordering::SeqCst), 0);
}
