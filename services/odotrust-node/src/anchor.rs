//! HTTP anchor client
//!
//! `POST {endpoint}/anchors` submits a commitment and returns a receipt;
//! `GET {endpoint}/anchors/{reference}` reports whether it is final.
//! Transport errors and 5xx answers are `Unavailable` (retried); 4xx
//! answers are `Rejected`.

use async_trait::async_trait;
use odotrust_core::AnchorConfig;
use odotrust_pipeline::{AnchorClient, AnchorPayload, AnchorReceipt, ExternalError, ExternalResult};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "anchor";
const CREDENTIAL_HEADER: &str = "x-wallet-credential";

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    confirmed: bool,
}

pub struct HttpAnchorClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpAnchorClient {
    pub fn new(config: &AnchorConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn check_status(status: StatusCode, body: String) -> ExternalResult<()> {
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(ExternalError::Rejected {
                service: SERVICE,
                detail: format!("{}: {}", status, body),
            })
        } else {
            Err(ExternalError::unavailable(SERVICE, format!("{}: {}", status, body)))
        }
    }
}

fn transport(err: reqwest::Error) -> ExternalError {
    ExternalError::unavailable(SERVICE, err.to_string())
}

#[async_trait]
impl AnchorClient for HttpAnchorClient {
    async fn submit(&self, payload: &AnchorPayload) -> ExternalResult<AnchorReceipt> {
        let mut request = self
            .http
            .post(format!("{}/anchors", self.endpoint))
            .json(payload);
        if let Some(credential) = &payload.credential {
            request = request.header(CREDENTIAL_HEADER, credential.handle());
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            Self::check_status(status, body)?;
            unreachable!("check_status errs on non-success status");
        }

        let receipt: AnchorReceipt = response.json().await.map_err(transport)?;
        debug!(batch_id = %payload.batch_id, reference = %receipt.reference, "Anchor accepted commitment");
        Ok(receipt)
    }

    async fn confirm(&self, reference: &str) -> ExternalResult<bool> {
        let response = self
            .http
            .get(format!("{}/anchors/{}", self.endpoint, reference))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            Self::check_status(status, body)?;
            unreachable!("check_status errs on non-success status");
        }

        let body: ConfirmationResponse = response.json().await.map_err(transport)?;
        Ok(body.confirmed)
    }
}
