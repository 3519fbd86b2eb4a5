//! SMTP email delivery via lettre.

use crate::transport::{MailTransport, OutboundEmail};
use async_trait::async_trait;
use cadence_core::config::SmtpConfig;
use cadence_core::error::{CadenceError, CadenceResult};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SMTP transport with a fixed sender.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    /// Domain used for generated Message-ID headers.
    message_domain: String,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, timeout: Duration) -> CadenceResult<Self> {
        let from_address: Address = config.from_email.parse().map_err(|e| {
            CadenceError::Config(format!("invalid from_email {}: {e}", config.from_email))
        })?;
        let message_domain = from_address.domain().to_string();
        let from = Mailbox::new(Some(config.from_name.clone()), from_address);

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| CadenceError::Config(format!("smtp relay {}: {e}", config.host)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port).timeout(Some(timeout));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(
            host = %config.host,
            port = config.port,
            from = %config.from_email,
            starttls = config.starttls,
            "SMTP transport initialized"
        );

        Ok(Self {
            mailer: builder.build(),
            from,
            message_domain,
        })
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> CadenceResult<Message> {
        let to_address: Address = email
            .to
            .parse()
            .map_err(|e| CadenceError::Transport(format!("invalid recipient {}: {e}", email.to)))?;
        let to = Mailbox::new(email.to_name.clone().filter(|n| !n.is_empty()), to_address);

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .message_id(Some(message_id.to_string()))
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .map_err(|e| CadenceError::Transport(format!("failed to build message: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, email: &OutboundEmail) -> CadenceResult<String> {
        let start = std::time::Instant::now();
        let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), self.message_domain);
        let message = self.build_message(email, &message_id)?;

        debug!(to = %email.to, subject = %email.subject, "Sending email via SMTP");

        match self.mailer.send(message).await {
            Ok(response) => {
                metrics::counter!("smtp.emails_sent").increment(1);
                metrics::histogram!("smtp.latency_ms").record(start.elapsed().as_millis() as f64);
                debug!(code = %response.code(), message_id = %message_id, "SMTP accepted message");
                Ok(message_id)
            }
            Err(e) => {
                metrics::counter!("smtp.send_errors").increment(1);
                warn!(to = %email.to, error = %e, "SMTP send failed");
                Err(CadenceError::Transport(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            starttls: false,
            from_email: "news@example.org".into(),
            ..SmtpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_sender() {
        let mut cfg = config();
        cfg.from_email = "not-an-address".into();
        assert!(matches!(
            SmtpTransport::new(&cfg, Duration::from_secs(5)),
            Err(CadenceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_message_rejects_invalid_recipient() {
        let transport = SmtpTransport::new(&config(), Duration::from_secs(5)).unwrap();
        assert_eq!(transport.message_domain, "example.org");
        let email = OutboundEmail {
            to: "broken".into(),
            to_name: None,
            subject: "s".into(),
            html_body: "b".into(),
        };
        assert!(matches!(
            transport.build_message(&email, "<x@example.org>"),
            Err(CadenceError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_build_message_ok() {
        let transport = SmtpTransport::new(&config(), Duration::from_secs(5)).unwrap();
        let email = OutboundEmail {
            to: "ada@example.com".into(),
            to_name: Some("Ada".into()),
            subject: "Welcome".into(),
            html_body: "<p>hi</p>".into(),
        };
        let message = transport.build_message(&email, "<abc@example.org>").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Welcome"));
        assert!(raw.contains("<abc@example.org>"));
    }
}
