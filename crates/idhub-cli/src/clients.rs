// HTTP implementations of the workflow collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use idhub_core::RemoteError;
use idhub_core::workflows::{
    CredentialIssuer, HolderCredentialRequest, IssuanceProcess, IssuerClient, IssuerStatus,
    RequestedCredential,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> anyhow::Result<Client> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Appends percent-encoded path segments to `base`.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = Url::parse(base)
        .map_err(|err| RemoteError::Permanent(format!("invalid endpoint {base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| RemoteError::Permanent(format!("endpoint {base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn classify_status(status: StatusCode, url: &Url) -> Option<RemoteError> {
    if status.is_success() {
        None
    } else if status.is_server_error() {
        Some(RemoteError::Transient(format!("{url} returned {status}")))
    } else {
        Some(RemoteError::Permanent(format!("{url} returned {status}")))
    }
}

fn classify_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() || err.is_builder() {
        RemoteError::Permanent(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

async fn checked(response: Result<Response, reqwest::Error>) -> Result<Response, RemoteError> {
    let response = response.map_err(classify_error)?;
    match classify_status(response.status(), response.url()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRequestMessage<'a> {
    holder_pid: &'a str,
    credentials: &'a [RequestedCredential],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRequestAck {
    issuer_pid: String,
}

#[derive(Deserialize)]
struct StatusMessage {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Talks to the issuer service on behalf of a holder.
pub struct HttpIssuerClient {
    http: Client,
    endpoint: String,
}

impl HttpIssuerClient {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl IssuerClient for HttpIssuerClient {
    async fn request_credentials(
        &self,
        request: &HolderCredentialRequest,
    ) -> Result<String, RemoteError> {
        let url = endpoint(&self.endpoint, &["credentials"])?;
        debug!(entity_id = %request.meta.id, %url, "sending credential request");
        let response = checked(
            self.http
                .post(url)
                .json(&CredentialRequestMessage {
                    holder_pid: &request.meta.id,
                    credentials: &request.requested_credentials,
                })
                .send()
                .await,
        )
        .await?;
        let ack: CredentialRequestAck = response.json().await.map_err(classify_error)?;
        Ok(ack.issuer_pid)
    }

    async fn request_status(
        &self,
        request: &HolderCredentialRequest,
    ) -> Result<IssuerStatus, RemoteError> {
        let Some(issuer_pid) = request.issuer_pid.as_deref() else {
            return Err(RemoteError::Permanent("request has no issuer process id".to_string()));
        };
        let url = endpoint(&self.endpoint, &["requests", issuer_pid])?;
        let response = checked(self.http.get(url).send().await).await?;
        let message: StatusMessage = response.json().await.map_err(classify_error)?;
        match message.status.to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(IssuerStatus::Received),
            "ISSUED" => Ok(IssuerStatus::Issued),
            "REJECTED" => Ok(IssuerStatus::Rejected(message.reason)),
            other => Err(RemoteError::Permanent(format!(
                "issuer reported unknown status `{other}`"
            ))),
        }
    }
}

/// Delivers the credentials of an issuance process to the holder's
/// storage service.
pub struct HttpCredentialIssuer {
    http: Client,
    endpoint: String,
}

impl HttpCredentialIssuer {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self, process: &IssuanceProcess) -> Result<(), RemoteError> {
        let url = endpoint(&self.endpoint, &["issuance", &process.meta.id])?;
        debug!(entity_id = %process.meta.id, %url, "delivering credentials");
        checked(self.http.post(url).json(process).send().await).await?;
        Ok(())
    }
}
