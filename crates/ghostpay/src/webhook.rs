use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::error::{GhostpayError, Result};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::metrics;

/// Upper bound on a single delivery attempt.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body POSTed to an invoice's webhook URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub invoice_id: String,
    pub status: InvoiceStatus,
}

/// Outbound status callbacks. Delivery is at most once and never reports back.
pub trait Notifier: Send + Sync {
    fn deliver(&self, url: &str, payload: WebhookPayload);
}

/// Notify `invoice`'s webhook about its move into `status`, if that state is
/// one merchants hear about and a webhook is configured.
pub fn notify_status(notifier: &dyn Notifier, invoice: &Invoice, status: InvoiceStatus) {
    if !status.notifies() {
        return;
    }
    if let Some(url) = invoice.webhook_url.as_deref() {
        notifier.deliver(
            url,
            WebhookPayload {
                invoice_id: invoice.id.clone(),
                status,
            },
        );
    }
}

/// Check a caller-supplied webhook URL. Only http and https are accepted; plain
/// http and private hosts are allowed with a warning (local development).
pub fn validate_webhook_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let url = Url::parse(raw)
        .map_err(|e| GhostpayError::Validation(format!("invalid webhook_url '{raw}': {e}")))?;

    match url.scheme() {
        "https" => {}
        "http" => tracing::warn!(
            url = %url,
            "webhook URL does not use HTTPS, payloads will be sent in cleartext"
        ),
        other => {
            return Err(GhostpayError::Validation(format!(
                "webhook_url must use http or https, got '{other}'"
            )))
        }
    }
    if url.host().is_none() {
        return Err(GhostpayError::Validation(format!(
            "webhook_url '{raw}' has no host"
        )));
    }
    if crate::network::targets_private_host(&url) {
        tracing::warn!(url = %url, "webhook URL targets a private or loopback host");
    }
    Ok(raw.to_string())
}

/// Fire-and-forget JSON POST, optionally signed with HMAC-SHA256.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    secret: Option<Vec<u8>>,
}

impl HttpNotifier {
    pub fn new(secret: Option<Vec<u8>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| GhostpayError::Configuration(format!("webhook client: {e}")))?;
        Ok(Self { client, secret })
    }
}

impl Notifier for HttpNotifier {
    fn deliver(&self, url: &str, payload: WebhookPayload) {
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize webhook payload");
                return;
            }
        };
        let signature = match self.secret.as_deref().map(|s| crate::hmac::sign_payload(s, &body)) {
            Some(Ok(sig)) => Some(sig),
            Some(Err(e)) => {
                tracing::error!(error = %e, "failed to sign webhook payload");
                return;
            }
            None => None,
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %url, "no async runtime, webhook dropped");
            return;
        };

        let client = self.client.clone();
        let url = url.to_string();
        handle.spawn(async move {
            let mut req = client
                .post(&url)
                .header("content-type", "application/json");
            if let Some(ref sig) = signature {
                req = req.header(crate::hmac::SIGNATURE_HEADER, sig.as_str());
            }

            match req.body(body).send().await {
                Ok(resp) => {
                    metrics::WEBHOOKS.with_label_values(&["delivered"]).inc();
                    tracing::debug!(
                        url = %url,
                        invoice_id = %payload.invoice_id,
                        status = %resp.status(),
                        "webhook delivered"
                    )
                }
                Err(e) => {
                    metrics::WEBHOOKS.with_label_values(&["failed"]).inc();
                    tracing::warn!(
                        url = %url,
                        invoice_id = %payload.invoice_id,
                        error = %e,
                        "webhook delivery failed"
                    )
                }
            }
        });
    }
}
