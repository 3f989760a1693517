use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The in-pipeline normalized form of a classified, routable event (§3).
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub index_base: String,
    pub index_name: String,
    pub doc_type: String,
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
    pub enqueue_time: DateTime<Utc>,
    /// UTF-8 text. Invariant: never contains `\n` — enforced at construction.
    pub body: String,
}

impl BulkItem {
    /// Builds a `BulkItem`, resolving `index_name` from the time-partitioning
    /// rule in §3. Returns `Err` with the invariant-violation reason if the
    /// body contains a newline; callers must route that to `InvalidItem`.
    pub fn new(
        index_base: impl Into<String>,
        doc_type: impl Into<String>,
        doc_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        enqueue_time: DateTime<Utc>,
        body: String,
        flat_index: bool,
    ) -> Result<Self, &'static str> {
        if body.contains('\n') {
            return Err("Document body contains newlines");
        }
        let index_base = index_base.into();
        let index_name = if flat_index {
            index_base.clone()
        } else {
            format!("{}-{}", index_base, timestamp.format("%Y.%m.%d"))
        };
        Ok(BulkItem {
            index_base,
            doc_type: doc_type.into(),
            doc_id: doc_id.into(),
            timestamp,
            enqueue_time,
            body,
            index_name,
        })
    }

    /// `ingestionstats` / `batchstats` self-instrumentation item (§4.2).
    pub fn batch_stats(enqueue_time: DateTime<Utc>, body: serde_json::Value) -> BulkItem {
        let now = Utc::now();
        BulkItem {
            index_base: "ingestionstats".to_string(),
            index_name: format!("ingestionstats-{}", now.format("%Y.%m.%d")),
            doc_type: "batchstats".to_string(),
            doc_id: Uuid::new_v4().to_string(),
            timestamp: now,
            enqueue_time,
            body: body.to_string(),
        }
    }

    /// `ingestionstats` / `perpartitionstats` self-instrumentation item (§4.2).
    pub fn per_partition_stats(enqueue_time: DateTime<Utc>, body: serde_json::Value) -> BulkItem {
        let now = Utc::now();
        BulkItem {
            index_base: "ingestionstats".to_string(),
            index_name: format!("ingestionstats-{}", now.format("%Y.%m.%d")),
            doc_type: "perpartitionstats".to_string(),
            doc_id: Uuid::new_v4().to_string(),
            timestamp: now,
            enqueue_time,
            body: body.to_string(),
        }
    }

    /// `abandoneddocs` quarantine record for a document that failed delivery
    /// or classification (§3 AbandonedItem).
    pub fn abandoned(doc_id: &str, original_body: &str, last_error: &str, timestamp: DateTime<Utc>) -> BulkItem {
        let now = Utc::now();
        let doc_content: String = original_body.chars().take(1024).collect();
        let body = serde_json::json!({
            "docId": doc_id,
            "docContent": doc_content,
            "lastError": last_error,
            "timestamp": timestamp.to_rfc3339(),
        })
        .to_string();
        BulkItem {
            index_base: "abandoneddocs".to_string(),
            index_name: format!("abandoneddocs-{}", now.format("%Y.%m.%d")),
            doc_type: "abandoneddocinfo".to_string(),
            doc_id: Uuid::new_v4().to_string(),
            timestamp: now,
            enqueue_time: now,
            body,
        }
    }
}

/// An event that could not become a valid `BulkItem` (§3). Quarantined
/// immediately, never retried, never resubmitted to the normal path.
#[derive(Debug, Clone)]
pub struct InvalidItem {
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
    pub enqueue_time: DateTime<Utc>,
    pub body: String,
    pub invalid_reason: String,
}

/// Output of the Event Classifier (C1): exactly one of these per `RawEvent`.
#[derive(Debug, Clone)]
pub enum ClassifiedEvent {
    Valid(BulkItem),
    Invalid(InvalidItem),
}

/// Type alias kept for readability at call sites; `AbandonedItem` is
/// represented as a plain `BulkItem` (see `BulkItem::abandoned`) since it
/// shares the exact same shape once built.
pub type AbandonedItem = BulkItem;
