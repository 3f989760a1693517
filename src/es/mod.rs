mod framer;
mod processor;
mod submitter;

pub use framer::{frame_batch, BatchStats, FramedBatch};
pub use processor::{EsProcessor, EsProcessorConfig};
pub use submitter::{BulkResponseBody, BulkResponseItem, EsResponse, EsSubmitter};
