//! Mail transport abstraction.

use async_trait::async_trait;
use cadence_core::error::CadenceResult;
use tracing::info;
use uuid::Uuid;

/// A fully rendered email ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: String,
}

/// Sends one email. `Ok` carries the provider message id; any `Err` means
/// the message was not accepted and may be retried.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> CadenceResult<String>;
}

/// Transport that only logs. Used for dry runs.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, email: &OutboundEmail) -> CadenceResult<String> {
        let message_id = format!("dry-run-{}", Uuid::new_v4().simple());
        info!(
            to = %email.to,
            subject = %email.subject,
            bytes = email.html_body.len(),
            message_id = %message_id,
            "Dry run: email not sent"
        );
        metrics::counter!("transport.dry_run").increment(1);
        Ok(message_id)
    }
}
