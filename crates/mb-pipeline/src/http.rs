//! HTTP adapters for the identity service and export destinations.
//!
//! Base URLs come from the environment variables named in settings; they are
//! deployment secrets and are never logged.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use mb_config::{DestinationSettings, IdentifySettings};
use mb_schemas::{ExportTransaction, NewExportTransaction, PaymentTransaction, PendingExport, ResolvedIdentity};

use crate::error::ExportAgentError;
use crate::export::{ExportAgent, ExportMode};
use crate::identify::IdentityResolver;

fn client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .context("http client build failed")
}

fn url_from_env(var: &str) -> Result<String> {
    let url = std::env::var(var).with_context(|| format!("missing env var {var}"))?;
    if url.trim().is_empty() {
        return Err(anyhow!("env var {var} is empty"));
    }
    Ok(url.trim_end_matches('/').to_string())
}

// ---------------------------------------------------------------------------
// Identity service
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct IdentifyRequest<'a> {
    transaction_id: &'a str,
    provider_slug: &'a str,
    card_token: &'a str,
    first_six: Option<&'a str>,
    last_four: Option<&'a str>,
}

/// `POST {base}/identify`. 404 is "not enrolled"; any other non-success
/// status is a service fault.
#[derive(Debug, Clone)]
pub struct HttpIdentityResolver {
    http: Client,
    base_url: String,
}

impl HttpIdentityResolver {
    pub fn new_with_base_url(base_url: String, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            http: client(timeout_ms)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(s: &IdentifySettings) -> Result<Self> {
        Self::new_with_base_url(url_from_env(&s.service_url_env)?, s.timeout_ms)
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, payment: &PaymentTransaction) -> Result<Option<ResolvedIdentity>> {
        let body = IdentifyRequest {
            transaction_id: &payment.transaction_id,
            provider_slug: &payment.provider_slug,
            card_token: &payment.card_token,
            first_six: payment.first_six.as_deref(),
            last_four: payment.last_four.as_deref(),
        };
        let resp = self
            .http
            .post(format!("{}/identify", self.base_url))
            .json(&body)
            .send()
            .await
            .context("identity request failed")?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(transaction_id = %payment.transaction_id, "identity service: not enrolled");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("identity service http error status={}", status.as_u16()));
        }
        let identity: ResolvedIdentity = resp
            .json()
            .await
            .context("identity response json decode failed")?;
        Ok(Some(identity))
    }
}

// ---------------------------------------------------------------------------
// Export destination
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BatchBody<'a> {
    sequence_number: i64,
    transactions: Vec<&'a NewExportTransaction>,
}

/// Posts export snapshots as JSON.
///
/// Singular mode: `POST {base}/transactions` with one snapshot and the
/// `export_uid` as `Idempotency-Key`. Batch mode: `POST {base}/batches` with
/// the file sequence number and every snapshot in the chunk.
#[derive(Debug, Clone)]
pub struct HttpExportAgent {
    http: Client,
    base_url: String,
    mode: ExportMode,
}

impl HttpExportAgent {
    pub fn new_with_base_url(base_url: String, mode: ExportMode, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            http: client(timeout_ms)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            mode,
        })
    }

    pub fn from_settings(d: &DestinationSettings, timeout_ms: u64) -> Result<Self> {
        let mode = if d.batch {
            ExportMode::Batch
        } else {
            ExportMode::Singular
        };
        let base_url = url_from_env(&d.url_env)
            .with_context(|| format!("export destination '{}'", d.slug))?;
        Self::new_with_base_url(base_url, mode, timeout_ms)
    }

    async fn post<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        idempotency_key: Option<String>,
    ) -> Result<(), ExportAgentError> {
        let mut req = self.http.post(format!("{}/{path}", self.base_url)).json(body);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        let resp = req
            .send()
            .await
            .context("export request failed")
            .map_err(ExportAgentError::Transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ExportAgentError::Rejected(format!(
                "status={} body={}",
                status.as_u16(),
                text.trim()
            )))
        } else {
            Err(ExportAgentError::Transport(anyhow!(
                "export http error status={}",
                status.as_u16()
            )))
        }
    }
}

#[async_trait]
impl ExportAgent for HttpExportAgent {
    fn mode(&self) -> ExportMode {
        self.mode
    }

    async fn export(
        &self,
        export: &ExportTransaction,
        _pending: &PendingExport,
    ) -> Result<(), ExportAgentError> {
        self.post(
            "transactions",
            &export.fields,
            Some(export.fields.export_uid.to_string()),
        )
        .await
    }

    async fn export_batch(
        &self,
        exports: &[ExportTransaction],
        sequence_number: i64,
    ) -> Result<(), ExportAgentError> {
        let body = BatchBody {
            sequence_number,
            transactions: exports.iter().map(|e| &e.fields).collect(),
        };
        self.post("batches", &body, None).await
    }
}
