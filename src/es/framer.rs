//! C2 — ES Bulk Framer: serializes a set of `BulkItem`s into the ES bulk
//! wire format and, when enabled, appends the batch's self-instrumentation
//! items (§4.2).

use crate::models::{BulkItem, PartitionId};
use chrono::Utc;

/// Carried across batches within one partition: `lastBatchElapsed` is
/// reported in the *next* batch's stats item, not the batch it was measured
/// on (§4.4 "Timing").
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub last_batch_elapsed_ms: i64,
    pub last_batch_failed_docs: u64,
    pub last_batch_abandoned_docs: u64,
}

pub struct FramedBatch {
    pub body: String,
    /// doc ids in the exact order they appear in `body`, so submitter
    /// responses (which are positional) can be matched back to items.
    pub doc_ids: Vec<String>,
}

pub fn frame_batch(
    items: &[BulkItem],
    partition: PartitionId,
    stats_enabled: bool,
    prior: &BatchStats,
) -> FramedBatch {
    let mut lines = Vec::with_capacity(items.len() * 2 + 4);
    let mut doc_ids = Vec::with_capacity(items.len() + 2);

    for item in items {
        push_item(&mut lines, &mut doc_ids, item);
    }

    if stats_enabled && !items.is_empty() {
        let now = Utc::now();
        let oldest = items.iter().min_by_key(|i| i.enqueue_time).expect("non-empty");
        let oldest_by_timestamp = items.iter().min_by_key(|i| i.timestamp).expect("non-empty");
        let newest = items.iter().max_by_key(|i| i.timestamp).expect("non-empty");

        let lag_ms = nonneg_millis(now, newest.enqueue_time);
        let max_lag_ms = nonneg_millis(now, oldest.enqueue_time);
        let lag_from_creation_min = nonneg_millis(now, newest.timestamp) / 60_000;
        let max_lag_from_creation_min = nonneg_millis(now, oldest.timestamp) / 60_000;

        let batch_stats_body = serde_json::json!({
            "lastMessageTimestampInBatch": newest.timestamp.to_rfc3339(),
            "lastMessageEnqueueTimeInBatch": newest.enqueue_time.to_rfc3339(),
            "oldestMessageTimestampInBatch": oldest_by_timestamp.timestamp.to_rfc3339(),
            "oldestMessageEnqueueTimeInBatch": oldest.enqueue_time.to_rfc3339(),
            "idOfOldestMessageInBatch": oldest_by_timestamp.doc_id,
            "idOfOldestEnqueuedMessageInBatch": oldest.doc_id,
            "lagInMilliseconds": lag_ms,
            "maxLagInMilliseconds": max_lag_ms,
            "lagInMinutes": lag_ms / 60_000,
            "maxLagInMinutes": max_lag_ms / 60_000,
            "lagFromMessageCreationTimeInMinutes": lag_from_creation_min,
            "maxLagFromMessageCreationTimeInMinutes": max_lag_from_creation_min,
            "timestamp": now.to_rfc3339(),
            "lastBatchElapsedTimeInMilliseconds": prior.last_batch_elapsed_ms,
            "taskId": partition.0,
            "batchSize": items.len(),
            "lastBatchFailedDocuments": prior.last_batch_failed_docs,
            "lastBatchAbandonedDocuments": prior.last_batch_abandoned_docs,
        });
        let batch_stats_item = BulkItem::batch_stats(newest.enqueue_time, batch_stats_body);
        push_item(&mut lines, &mut doc_ids, &batch_stats_item);

        let per_partition_body = serde_json::json!({
            "partitionId": partition.0,
            "taskId": partition.0,
            "timestamp": now.to_rfc3339(),
            "batchSize": items.len(),
        });
        let per_partition_item = BulkItem::per_partition_stats(newest.enqueue_time, per_partition_body);
        push_item(&mut lines, &mut doc_ids, &per_partition_item);
    }

    FramedBatch {
        body: lines.join("\n"),
        doc_ids,
    }
}

fn push_item(lines: &mut Vec<String>, doc_ids: &mut Vec<String>, item: &BulkItem) {
    let action = serde_json::json!({
        "index": {
            "_index": item.index_name,
            "_type": item.doc_type,
            "_id": item.doc_id,
        }
    });
    lines.push(action.to_string());
    lines.push(item.body.clone());
    doc_ids.push(item.doc_id.clone());
}

fn nonneg_millis(now: chrono::DateTime<Utc>, then: chrono::DateTime<Utc>) -> i64 {
    (now - then).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(doc_id: &str) -> BulkItem {
        BulkItem::new(
            "logstash",
            "logevent",
            doc_id,
            Utc::now(),
            Utc::now() - Duration::seconds(5),
            "hello".to_string(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn frames_one_action_and_body_line_per_item() {
        let items = vec![item("a"), item("b")];
        let framed = frame_batch(&items, PartitionId(0), false, &BatchStats::default());
        assert_eq!(framed.body.lines().count(), 4);
        assert_eq!(framed.doc_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stats_items_are_appended_when_enabled() {
        let items = vec![item("a")];
        let framed = frame_batch(&items, PartitionId(3), true, &BatchStats::default());
        assert_eq!(framed.body.lines().count(), 2 + 4);
        assert_eq!(framed.doc_ids.len(), 3);
    }

    #[test]
    fn stats_are_skipped_for_an_empty_batch() {
        let framed = frame_batch(&[], PartitionId(0), true, &BatchStats::default());
        assert_eq!(framed.body, "");
        assert!(framed.doc_ids.is_empty());
    }

    /// When timestamp order and enqueue order disagree, the "oldest" fields
    /// must split accordingly: `idOfOldestMessageInBatch` follows `timestamp`,
    /// `idOfOldestEnqueuedMessageInBatch` follows `enqueue_time`.
    #[test]
    fn oldest_by_timestamp_and_oldest_by_enqueue_time_can_differ() {
        let now = Utc::now();
        let reordered = BulkItem::new(
            "logstash",
            "logevent",
            "reordered",
            now - Duration::seconds(60),
            now - Duration::seconds(1),
            "body".to_string(),
            false,
        )
        .unwrap();
        let in_order = BulkItem::new(
            "logstash",
            "logevent",
            "in-order",
            now - Duration::seconds(5),
            now - Duration::seconds(10),
            "body".to_string(),
            false,
        )
        .unwrap();

        let framed = frame_batch(&[reordered, in_order], PartitionId(0), true, &BatchStats::default());
        let batch_stats_body = framed.body.lines().nth(5).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(batch_stats_body).unwrap();

        assert_eq!(parsed["idOfOldestMessageInBatch"], "reordered");
        assert_eq!(parsed["idOfOldestEnqueuedMessageInBatch"], "in-order");
    }
}
