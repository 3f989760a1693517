//! C3 — ES Submitter: posts one framed bulk body and classifies the result
//! (§4.3). Retry policy lives in [`crate::retry`]; this module only knows
//! how to make one attempt and how to read its outcome.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BulkItemError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponseItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub status: u16,
    pub error: Option<BulkItemError>,
}

impl BulkResponseItem {
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status >= 300
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponseBody {
    pub errors: bool,
    pub items: Vec<BulkResponseItem>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    index: BulkResponseItem,
}

#[derive(Debug, Deserialize)]
struct RawBulkResponseBody {
    errors: bool,
    items: Vec<RawBulkItem>,
}

/// Outcome of a single submit attempt (§4.3).
#[derive(Debug)]
pub enum EsResponse {
    /// Exception during send, or a non-2xx response with no structured body
    /// to classify.
    TransportFailed,
    ServerSuccess(BulkResponseBody),
    ServerErrorStructured { status: u16, body: String },
}

/// Retained across retry attempts: succeeds as soon as the ES cluster
/// accepted the request at all, regardless of per-item outcome.
pub fn is_transport_success(response: &EsResponse) -> bool {
    !matches!(response, EsResponse::TransportFailed)
}

/// Succeeds only when the cluster accepted the request *and* every item in
/// it indexed cleanly. Used for the failed-item retry and quarantine phases
/// (§4.4 steps 5-6), which must keep retrying until nothing is left failing
/// or the bounded budget runs out.
pub fn is_clean_success(response: &EsResponse) -> bool {
    matches!(response, EsResponse::ServerSuccess(body) if !body.errors)
}

pub struct EsSubmitter {
    client: reqwest::Client,
    bulk_endpoint: String,
    username: Option<String>,
    password: Option<String>,
}

impl EsSubmitter {
    pub fn new(
        client: reqwest::Client,
        bulk_endpoint: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        EsSubmitter {
            client,
            bulk_endpoint: bulk_endpoint.into(),
            username,
            password,
        }
    }

    pub async fn submit(&self, body: String) -> EsResponse {
        let mut request = self
            .client
            .post(&self.bulk_endpoint)
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => {
                log::warn!("ES bulk submit transport failure: {err}");
                return EsResponse::TransportFailed;
            }
        };

        let status = response.status();
        if status.is_success() {
            let text = match response.text().await {
                Ok(t) => t,
                Err(err) => {
                    log::warn!("ES bulk response body read failed: {err}");
                    return EsResponse::TransportFailed;
                }
            };
            match serde_json::from_str::<RawBulkResponseBody>(&text) {
                Ok(raw) => EsResponse::ServerSuccess(BulkResponseBody {
                    errors: raw.errors,
                    items: raw.items.into_iter().map(|i| i.index).collect(),
                }),
                Err(err) => {
                    log::warn!("ES bulk response did not parse: {err}");
                    EsResponse::TransportFailed
                }
            }
        } else if status.is_server_error() {
            // 5xx is the cluster/gateway being transiently unavailable, the
            // same class of failure as a dropped connection (§4.3
            // "HTTP-level failure") — retried indefinitely by the unbounded
            // first-submit policy rather than handed to the caller.
            log::warn!("ES bulk submit got HTTP {status}");
            EsResponse::TransportFailed
        } else {
            let body = response.text().await.unwrap_or_default();
            EsResponse::ServerErrorStructured {
                status: status.as_u16(),
                body,
            }
        }
    }
}
