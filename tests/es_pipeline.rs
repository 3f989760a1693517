//! End-to-end ES pipeline scenarios (spec.md §8), driven against a mocked
//! bulk endpoint with `wiremock` rather than a real Elasticsearch cluster —
//! the same HTTP-boundary-mocking idiom the teacher's dev-dependency set
//! (`wiremock`, `tempfile`) is meant for, even though the teacher's own
//! smoke tests spawn a live process instead of exercising it.

use async_trait::async_trait;
use chrono::Utc;
use event_gateway::checkpoint::PartitionCheckpointer;
use event_gateway::es::{EsProcessor, EsProcessorConfig, EsSubmitter};
use event_gateway::models::{PartitionId, PropertyValue, RawEvent};
use event_gateway::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct CountingCheckpointer(Arc<AtomicU32>);

#[async_trait]
impl PartitionCheckpointer for CountingCheckpointer {
    async fn checkpoint(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn serilog_event(message_id: &str, body: &str) -> RawEvent {
    let mut properties = HashMap::new();
    properties.insert("Type".to_string(), PropertyValue::Str("SerilogEvent".to_string()));
    properties.insert("MessageId".to_string(), PropertyValue::Str(message_id.to_string()));
    RawEvent {
        body: body.as_bytes().to_vec(),
        enqueued_at: Utc::now(),
        properties,
    }
}

fn processor(
    server: &MockServer,
    checkpoints: Arc<AtomicU32>,
) -> EsProcessor<CountingCheckpointer> {
    processor_with_stats(server, checkpoints, false)
}

fn processor_with_stats(
    server: &MockServer,
    checkpoints: Arc<AtomicU32>,
    stats_enabled: bool,
) -> EsProcessor<CountingCheckpointer> {
    let submitter = Arc::new(EsSubmitter::new(reqwest::Client::new(), server.uri(), None, None));
    let config = EsProcessorConfig::new(PartitionId(0), stats_enabled);
    EsProcessor::new(
        config,
        submitter,
        CountingCheckpointer(checkpoints),
        CancellationToken::new(),
    )
}

/// Extracts the `_id` of every bulk action line in a request body, in order.
fn doc_ids_in_request(body: &str) -> Vec<String> {
    body.lines()
        .step_by(2)
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|v| v["index"]["_id"].as_str().map(str::to_string))
        .collect()
}

fn bulk_success_body(ids: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "errors": false,
        "items": ids.iter().map(|id| serde_json::json!({"index": {"_id": id, "status": 201}})).collect::<Vec<_>>(),
    })
}

#[tokio::test]
async fn single_valid_event_no_errors_submits_exactly_once() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(move |_req: &Request| {
                calls.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(bulk_success_body(&["m-1"]))
            })
            .mount(&server)
            .await;
    }

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor(&server, checkpoints);
    proc.process(vec![serilog_event("m-1", "hello world")]).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// §8 scenario: "Single event; ES returns 502 Bad Gateway 100 times then
/// 200 → exactly 101 submit calls; lastBatchFailed=0, lastBatchAbandoned=0."
///
/// Runs on a paused virtual clock: the unbounded first-submit retry backs
/// off up to 5s between attempts, so 100 retries would otherwise take
/// minutes of real wall-clock time for no benefit.
#[tokio::test(start_paused = true)]
async fn transient_502s_are_retried_until_success() {
    struct FlakyThenOk {
        calls: Arc<AtomicU32>,
        fail_for: u32,
    }

    impl Respond for FlakyThenOk {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_for {
                ResponseTemplate::new(502)
            } else {
                ResponseTemplate::new(200).set_body_json(bulk_success_body(&["m-1"]))
            }
        }
    }

    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(FlakyThenOk {
            calls: calls.clone(),
            fail_for: 100,
        })
        .mount(&server)
        .await;

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor(&server, checkpoints);
    proc.process(vec![serilog_event("m-1", "hello world")]).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 101);
}

/// §8 scenario: "Batch of 3: valid, empty-body, valid (all Serilog) → first
/// submit sees 3 items; failed-items retry up to 10 times; then 1 quarantine
/// submit. Total = 1 + 10 + 1 = 12 submit calls; lastBatchFailed=1,
/// lastBatchAbandoned=1."
#[tokio::test]
async fn one_permanently_failing_item_is_retried_then_quarantined() {
    struct AlwaysFailOneDoc {
        calls: Arc<AtomicU32>,
        failing_doc_id: String,
    }

    impl Respond for AlwaysFailOneDoc {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = std::str::from_utf8(&request.body).unwrap();
            let ids = doc_ids_in_request(body);
            let any_failing = ids.iter().any(|id| *id == self.failing_doc_id);
            let items: Vec<_> = ids
                .iter()
                .map(|id| {
                    if *id == self.failing_doc_id {
                        serde_json::json!({"index": {"_id": id, "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "forced failure"}}})
                    } else {
                        serde_json::json!({"index": {"_id": id, "status": 201}})
                    }
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"errors": any_failing, "items": items}))
        }
    }

    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(AlwaysFailOneDoc {
            calls: calls.clone(),
            failing_doc_id: "bad-1".to_string(),
        })
        .mount(&server)
        .await;

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor(&server, checkpoints);
    proc.process(vec![
        serilog_event("ok-1", "first valid event"),
        serilog_event("bad-1", ""),
        serilog_event("ok-2", "second valid event"),
    ])
    .await
    .unwrap();

    // 1 initial submit (3 items) + 10 bounded failed-item retries (always
    // failing) + 1 quarantine submit (the abandoned record, a fresh id the
    // mock never marks as failing, so it succeeds on the first attempt).
    assert_eq!(calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn empty_batch_does_not_submit() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(move |_req: &Request| {
                calls.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(bulk_success_body(&[]))
            })
            .mount(&server)
            .await;
    }

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor(&server, checkpoints.clone());
    proc.process(vec![]).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // Batch of zero still checkpoints (it's the first call for the
    // partition, so the minimum interval hasn't been established yet).
    assert_eq!(checkpoints.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn newline_in_body_is_quarantined_without_a_normal_submit() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(move |request: &Request| {
                calls.fetch_add(1, Ordering::SeqCst);
                let body = std::str::from_utf8(&request.body).unwrap();
                let ids = doc_ids_in_request(body);
                ResponseTemplate::new(200).set_body_json(bulk_success_body(
                    &ids.iter().map(String::as_str).collect::<Vec<_>>(),
                ))
            })
            .mount(&server)
            .await;
    }

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor(&server, checkpoints);
    proc.process(vec![serilog_event("m-1", "line one\nline two")]).await.unwrap();

    // No user-valid items in the batch and stats are disabled, so the
    // normal-path submit is skipped entirely; only the quarantine submit
    // for the invalid item happens.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Stats are enabled by default in production (`config.rs`'s
/// `EsConfig::stats_enabled` default), and `frame_batch` only ever appends
/// the batchstats/perpartitionstats items when there is at least one *valid*
/// item to frame alongside them (`es/framer.rs`). So an empty batch produces
/// an empty framed body even with stats enabled, and must not submit.
#[tokio::test]
async fn empty_batch_does_not_submit_even_with_stats_enabled() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(move |_req: &Request| {
                calls.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(bulk_success_body(&[]))
            })
            .mount(&server)
            .await;
    }

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor_with_stats(&server, checkpoints, true);
    proc.process(vec![]).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Same as `newline_in_body_is_quarantined_without_a_normal_submit` but with
/// stats enabled (the production default): an all-invalid batch still has
/// zero *valid* items, so `frame_batch` still produces an empty normal-path
/// body and the normal-path submit must still be skipped, leaving only the
/// quarantine submit (§8 scenario 6).
#[tokio::test]
async fn all_invalid_batch_skips_normal_submit_even_with_stats_enabled() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(move |request: &Request| {
                calls.fetch_add(1, Ordering::SeqCst);
                let body = std::str::from_utf8(&request.body).unwrap();
                let ids = doc_ids_in_request(body);
                ResponseTemplate::new(200).set_body_json(bulk_success_body(
                    &ids.iter().map(String::as_str).collect::<Vec<_>>(),
                ))
            })
            .mount(&server)
            .await;
    }

    let checkpoints = Arc::new(AtomicU32::new(0));
    let mut proc = processor_with_stats(&server, checkpoints, true);
    proc.process(vec![serilog_event("m-1", "line one\nline two")]).await.unwrap();

    // Only the quarantine submit for the invalid item; no normal-path submit
    // with an empty body.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
