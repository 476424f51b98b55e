//! Outbound email transport.
//!
//! Messages are built once with lettre and then either handed to an SMTP
//! relay (`SmtpTransport`) or written as RFC 5322 `.eml` files into a pickup
//! directory (`SpoolTransport`). A message counts as sent once the relay
//! accepts it or its file is fully written; there is no delivery callback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{MailConfig, MailTransportKind, SmtpSecurity};
use crate::error::{DunningError, DunningResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

impl OutgoingEmail {
    pub fn html(to: &str, subject: &str, html_body: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_message(&self, email: &OutgoingEmail) -> DunningResult<SendReceipt>;

    async fn send(&self, to: &str, subject: &str, html_body: &str) -> DunningResult<SendReceipt> {
        self.send_message(&OutgoingEmail::html(to, subject, html_body))
            .await
    }
}

/// The transport selected by `mail.transport`.
pub fn transport_from_config(config: &MailConfig) -> DunningResult<Arc<dyn EmailTransport>> {
    Ok(match config.transport {
        MailTransportKind::Spool => Arc::new(SpoolTransport::from_config(config)),
        MailTransportKind::Smtp => Arc::new(SmtpTransport::from_config(config)?),
    })
}

// ── Message building ──────────────────────────────────────────────

/// Sender identity plus the domain used for generated Message-IDs.
#[derive(Debug, Clone)]
struct Sender {
    from_email: String,
    from_name: String,
}

impl Sender {
    fn new(from_email: &str, from_name: &str) -> Self {
        Self {
            from_email: from_email.to_string(),
            from_name: from_name.to_string(),
        }
    }

    fn domain(&self) -> &str {
        self.from_email
            .rsplit_once('@')
            .map(|(_, d)| d)
            .filter(|d| !d.is_empty())
            .unwrap_or("localhost")
    }

    fn mailbox(&self) -> DunningResult<Mailbox> {
        let address: Address = self.from_email.parse().map_err(|e| {
            DunningError::Transport(format!("invalid sender address '{}': {e}", self.from_email))
        })?;
        let name = Some(self.from_name.trim().to_string()).filter(|n| !n.is_empty());
        Ok(Mailbox::new(name, address))
    }

    fn next_message_id(&self) -> String {
        format!("<{}@{}>", uuid::Uuid::new_v4(), self.domain())
    }

    /// HTML body always goes out base64 encoded; attachments become parts
    /// of a `multipart/mixed` message.
    fn build(
        &self,
        email: &OutgoingEmail,
        message_id: &str,
        date: DateTime<Utc>,
    ) -> DunningResult<Message> {
        check_header_value("To", &email.to)?;
        check_header_value("Subject", &email.subject)?;
        let to: Mailbox = email.to.trim().parse().map_err(|e| {
            DunningError::Transport(format!("invalid recipient address '{}': {e}", email.to))
        })?;

        let builder = Message::builder()
            .from(self.mailbox()?)
            .to(to)
            .subject(email.subject.as_str())
            .date(SystemTime::from(date))
            .message_id(Some(message_id.to_string()));

        let html = SinglePart::builder()
            .header(ContentType::TEXT_HTML)
            .header(ContentTransferEncoding::Base64)
            .body(email.html_body.clone());

        let message = if email.attachments.is_empty() {
            builder.singlepart(html)
        } else {
            let mut parts = MultiPart::mixed().singlepart(html);
            for a in &email.attachments {
                check_header_value("attachment filename", &a.filename)?;
                let content_type = ContentType::parse(&a.content_type).map_err(|e| {
                    DunningError::Transport(format!(
                        "invalid content type '{}' for {}: {e}",
                        a.content_type, a.filename
                    ))
                })?;
                parts = parts.singlepart(
                    MimeAttachment::new(a.filename.clone()).body(a.data.clone(), content_type),
                );
            }
            builder.multipart(parts)
        };
        message.map_err(|e| DunningError::Transport(format!("cannot build message: {e}")))
    }
}

fn check_header_value(name: &str, value: &str) -> DunningResult<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(DunningError::Transport(format!(
            "{name} must not contain line breaks"
        )));
    }
    Ok(())
}

// ── SMTP ──────────────────────────────────────────────────────────

/// Relay delivery over SMTP. One connection per message.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    sender: Sender,
    host: String,
    port: u16,
}

impl SmtpTransport {
    pub fn from_config(config: &MailConfig) -> DunningResult<Self> {
        let host = config.smtp_host.trim();
        if host.is_empty() {
            return Err(DunningError::Config("mail.smtp_host must be set for SMTP delivery".into()));
        }
        let builder = match config.smtp_security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            SmtpSecurity::Plain => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };
        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.smtp_timeout_secs)));
        if let (Some(user), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            sender: Sender::new(&config.from_email, &config.from_name),
            host: host.to_string(),
            port: config.smtp_port,
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send_message(&self, email: &OutgoingEmail) -> DunningResult<SendReceipt> {
        let message_id = self.sender.next_message_id();
        let sent_at = Utc::now();
        let message = self.sender.build(email, &message_id, sent_at)?;

        let response = self.mailer.send(message).await.map_err(|e| {
            log::error!("smtp {}:{} refused mail to {}: {e}", self.host, self.port, email.to);
            DunningError::from(e)
        })?;
        log::info!(
            "smtp {}:{} accepted {message_id} for {} ({})",
            self.host,
            self.port,
            email.to,
            response.code()
        );
        Ok(SendReceipt {
            message_id,
            sent_at,
        })
    }
}

// ── Pickup directory ──────────────────────────────────────────────

pub struct SpoolTransport {
    dir: PathBuf,
    sender: Sender,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>, from_email: &str, from_name: &str) -> Self {
        Self {
            dir: dir.into(),
            sender: Sender::new(from_email, from_name),
        }
    }

    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(&config.spool_dir, &config.from_email, &config.from_name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full message text including headers.
    pub fn render(
        &self,
        email: &OutgoingEmail,
        message_id: &str,
        date: DateTime<Utc>,
    ) -> DunningResult<Vec<u8>> {
        Ok(self.sender.build(email, message_id, date)?.formatted())
    }
}

#[async_trait]
impl EmailTransport for SpoolTransport {
    async fn send_message(&self, email: &OutgoingEmail) -> DunningResult<SendReceipt> {
        let id = uuid::Uuid::new_v4();
        let message_id = format!("<{}@{}>", id, self.sender.domain());
        let sent_at = Utc::now();
        let bytes = self.render(email, &message_id, sent_at)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        // Write under a temp name, then rename: the pickup side never sees a partial file.
        let tmp = self.dir.join(format!(".{id}.tmp"));
        let path = self.dir.join(format!("{id}.eml"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::info!("spooled message {message_id} to {} at {}", email.to, path.display());
        Ok(SendReceipt {
            message_id,
            sent_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Sender {
        Sender::new("ar@x.io", "AR")
    }

    #[test]
    fn header_injection_is_rejected() {
        let email = OutgoingEmail::html("a@b.io\r\nBcc: evil@x.io", "s", "b");
        assert!(matches!(
            sender().build(&email, "<id@x.io>", Utc::now()),
            Err(DunningError::Transport(_))
        ));
        let email = OutgoingEmail::html("a@b.io", "hi\nBcc: evil@x.io", "b");
        assert!(sender().build(&email, "<id@x.io>", Utc::now()).is_err());
    }

    #[test]
    fn bad_addresses_are_transport_errors() {
        let email = OutgoingEmail::html("nobody", "s", "b");
        assert!(matches!(
            sender().build(&email, "<id@x.io>", Utc::now()),
            Err(DunningError::Transport(_))
        ));
        let bad_sender = Sender::new("not an address", "AR");
        let email = OutgoingEmail::html("a@b.io", "s", "b");
        assert!(bad_sender.build(&email, "<id@x.io>", Utc::now()).is_err());
    }

    #[test]
    fn message_ids_use_the_sender_domain() {
        let id = sender().next_message_id();
        assert!(id.starts_with('<') && id.ends_with("@x.io>"));
        assert_eq!(Sender::new("broken", "AR").domain(), "localhost");
    }

    #[test]
    fn smtp_needs_a_host() {
        let mut mail = crate::config::AppConfig::default_test().mail;
        mail.smtp_host = "  ".into();
        assert!(matches!(
            SmtpTransport::from_config(&mail),
            Err(DunningError::Config(_))
        ));
    }
}
