mod blob_client;
mod interaction;
mod processor;
mod sink;

pub use blob_client::AzureBlobAccountClient;
pub use processor::{CaProcessor, CaProcessorConfig};
pub use sink::{BlobAccountClient, BlobError, CaSchemaSink, SchemaSinkConfig};
