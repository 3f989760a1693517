use thiserror::Error;

/// Error surface for the classification and delivery pipelines.
///
/// Mirrors the error-kind taxonomy in the design doc: classification and
/// body-invariant failures never reach this type (they are folded into an
/// `InvalidItem` at the classifier boundary instead); everything here is a
/// transport, partial-delivery, or cancellation failure that can cross an
/// `await` point.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Elasticsearch transport error: {0}")]
    EsTransport(#[from] reqwest::Error),

    #[error("blob upload exhausted {attempts} attempts: {last_error}")]
    CaFlushExhausted { attempts: u32, last_error: String },

    #[error("gzip compression failed: {0}")]
    Compression(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, IngestError>;
