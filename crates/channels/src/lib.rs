//! Outbound email delivery and engagement-tracking instrumentation.
//!
//! Transports: SMTP via lettre, and a logging transport for dry runs.
//! Tracking: click-redirect link rewriting and the open beacon.

pub mod email;
pub mod tracking;
pub mod transport;

pub use email::SmtpTransport;
pub use tracking::TrackingLinks;
pub use transport::{LogTransport, MailTransport, OutboundEmail};
