//! Azure Blob Storage implementation of [`BlobAccountClient`] (§4.5),
//! grounded in the same `azure_storage_blobs` idiom `siem_backup_manager`
//! uses for its own Azure upload path (`ClientBuilder::new(..).blob_service_client()`
//! then `container_client(..).blob_client(..)`).

use crate::ca::sink::{BlobAccountClient, BlobError};
use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use std::time::Duration;
use time::OffsetDateTime;

/// One configured blob-storage account from the comma-separated
/// `blob_accounts` connection-string list (§6). Each entry is
/// `account_name:access_key`.
pub struct AzureBlobAccountClient {
    account_name: String,
    service_client: BlobServiceClient,
}

impl AzureBlobAccountClient {
    pub fn new(account_name: impl Into<String>, access_key: impl Into<String>) -> Self {
        let account_name = account_name.into();
        let credentials = StorageCredentials::access_key(account_name.clone(), access_key.into());
        let service_client = ClientBuilder::new(account_name.clone(), credentials).blob_service_client();
        AzureBlobAccountClient {
            account_name,
            service_client,
        }
    }

    /// Parses one `blob_accounts` list entry (§6 "comma-separated
    /// blob-account credentials") as `account_name:access_key`.
    pub fn from_connection_entry(entry: &str) -> Option<Self> {
        let (account, key) = entry.split_once(':')?;
        Some(Self::new(account.trim(), key.trim()))
    }
}

#[async_trait]
impl BlobAccountClient for AzureBlobAccountClient {
    fn account_name(&self) -> &str {
        &self.account_name
    }

    async fn upload_blob(
        &self,
        container: &str,
        blob_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        let blob_client = self.service_client.container_client(container).blob_client(blob_name);
        blob_client
            .put_block_blob(payload)
            .content_type(content_type)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }

    async fn create_container(&self, container: &str) -> Result<(), BlobError> {
        self.service_client
            .container_client(container)
            .create()
            .await
            .map(|_| ())
            .map_err(|err| BlobError::Other(err.to_string()))
    }

    async fn sas_uri(&self, container: &str, blob_name: &str, ttl: Duration) -> String {
        let blob_client = self.service_client.container_client(container).blob_client(blob_name);
        let expiry = OffsetDateTime::now_utc() + time::Duration::seconds(ttl.as_secs() as i64);
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };
        match blob_client.shared_access_signature(permissions, expiry).await {
            Ok(sas) => blob_client.generate_signed_blob_url(&sas).unwrap_or_default(),
            Err(err) => {
                log::error!("failed to mint SAS URI for {container}/{blob_name}: {err}");
                String::new()
            }
        }
    }
}

/// The Azure SDK surfaces a missing container as an HTTP 404 inside an
/// opaque `azure_core::Error`; string-matching the status is the only way
/// to recover the distinction the sink's create-on-404 fallback needs.
fn classify_error(err: azure_core::Error) -> BlobError {
    let message = err.to_string();
    if message.contains("404") || message.to_lowercase().contains("containernotfound") {
        BlobError::NotFound
    } else {
        BlobError::Other(message)
    }
}
