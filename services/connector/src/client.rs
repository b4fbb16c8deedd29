//! Control plane API client.
//!
//! Three endpoints under the configured base URL:
//! - `POST /self-host/pair` exchanges a pairing token for credentials
//! - `GET /self-host/next` returns the next pending command, or 204
//! - `POST /self-host/ack` reports a command's outcome

use std::time::Duration;

use connector_protocol::{Acknowledgment, CommandEnvelope, PairRequest, PairResponse};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::{normalize_base_url, Configuration};

/// Per-request timeout.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced a response.
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The control plane answered, but not with what was expected.
    #[error("{message}")]
    Protocol {
        /// HTTP status, when the failure is a non-success status.
        status: Option<u16>,
        message: String,
    },
}

impl ClientError {
    fn status(context: &str, status: StatusCode, body: &str) -> Self {
        Self::Protocol {
            status: Some(status.as_u16()),
            message: format!("{context} failed ({}): {}", status.as_u16(), body.trim()),
        }
    }

    fn decode(context: &str, error: serde_json::Error) -> Self {
        Self::Protocol {
            status: None,
            message: format!("{context} decode: {error}"),
        }
    }
}

/// HTTP client for the self-host endpoints.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ControlPlaneClient {
    /// Create a client. `token` is sent as a bearer token when present.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url).to_string(),
            token,
        })
    }

    /// Create an authenticated client from a paired configuration.
    pub fn from_config(config: &Configuration) -> Result<Self, ClientError> {
        Self::new(config.base_url(), Some(config.connector_token.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange a pairing token for connector credentials.
    pub async fn pair(&self, request: &PairRequest) -> Result<PairResponse, ClientError> {
        let url = format!("{}/self-host/pair", self.base_url);
        debug!(url = %url, "Pairing connector");

        let response = self.client.post(&url).json(request).send().await?;
        decode_success("pair", response).await
    }

    /// Fetch the next pending command. `None` when there is nothing to do.
    pub async fn next_command(&self) -> Result<Option<CommandEnvelope>, ClientError> {
        let url = format!("{}/self-host/next", self.base_url);

        let response = self.authorized(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let envelope: CommandEnvelope = decode_success("poll", response).await?;
        debug!(id = %envelope.id, action = %envelope.action, "Fetched command");
        Ok(Some(envelope))
    }

    /// Report a command's outcome.
    pub async fn ack(&self, ack: &Acknowledgment) -> Result<(), ClientError> {
        let url = format!("{}/self-host/ack", self.base_url);
        debug!(id = %ack.id, status = %ack.status, "Acknowledging command");

        let response = self.authorized(self.client.post(&url)).json(ack).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::status("ack", status, &body));
        }
        Ok(())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn decode_success<T: DeserializeOwned>(
    context: &str,
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(ClientError::status(
            context,
            status,
            &String::from_utf8_lossy(&body),
        ));
    }

    serde_json::from_slice(&body).map_err(|e| ClientError::decode(context, e))
}
