//! Operator notifications at alert boundaries.
//!
//! Delivery is best-effort: a failed notification is logged and never
//! interrupts the alert lifecycle.

use crate::config::{NotifierConfig, NotifierKind};
use async_trait::async_trait;
use lettre::message::header::{ContentType, ContentTypeErr};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::multipart::{Form, Part};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid notifier endpoint {url}: {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification endpoint returned status {0}")]
    Status(u16),

    #[error("Failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid email address {address}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("Invalid attachment content type: {0}")]
    ContentType(#[from] ContentTypeErr),

    #[error("Failed to build email: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Boundary at which a notification is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    Activated,
    Deactivated,
    CheckIn,
    /// An alert was abandoned because the camera or storage failed
    Fault,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::Activated => "activated",
            AlertEvent::Deactivated => "deactivated",
            AlertEvent::CheckIn => "check_in",
            AlertEvent::Fault => "fault",
        }
    }
}

/// One message to the operator.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: AlertEvent,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

/// Subject lines per event.
#[derive(Debug, Clone)]
pub struct Subjects {
    pub activated: String,
    pub deactivated: String,
    pub check_in: String,
    pub fault: String,
}

impl Subjects {
    pub fn from_config(config: &NotifierConfig) -> Self {
        Self {
            activated: config.activated_subject.clone(),
            deactivated: config.deactivated_subject.clone(),
            check_in: config.checkin_subject.clone(),
            fault: config.fault_subject.clone(),
        }
    }

    pub fn for_event(&self, event: AlertEvent) -> &str {
        match event {
            AlertEvent::Activated => &self.activated,
            AlertEvent::Deactivated => &self.deactivated,
            AlertEvent::CheckIn => &self.check_in,
            AlertEvent::Fault => &self.fault,
        }
    }

    pub fn notification(
        &self,
        event: AlertEvent,
        body: impl Into<String>,
        attachment: Option<PathBuf>,
    ) -> Notification {
        Notification {
            event,
            subject: self.for_event(event).to_string(),
            body: body.into(),
            attachment,
        }
    }
}

impl Default for Subjects {
    fn default() -> Self {
        Self::from_config(&NotifierConfig::default())
    }
}

/// Notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Send `notification`, logging instead of propagating failures. Returns
/// whether delivery succeeded.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: &Notification) -> bool {
    match notifier.notify(notification).await {
        Ok(()) => {
            debug!(event = notification.event.as_str(), "Notification delivered");
            true
        }
        Err(e) => {
            warn!(
                event = notification.event.as_str(),
                subject = %notification.subject,
                error = %e,
                "Notification failed"
            );
            false
        }
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            event = notification.event.as_str(),
            subject = %notification.subject,
            body = %notification.body,
            attachment = ?notification.attachment,
            "Notification"
        );
        Ok(())
    }
}

/// Posts notifications as `multipart/form-data` with `event`, `subject`,
/// `body` and an optional `attachment` file part.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, NotifyError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| NotifyError::InvalidEndpoint {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: parsed,
        })
    }

    async fn build_form(&self, notification: &Notification) -> Result<Form, NotifyError> {
        let mut form = Form::new()
            .text("event", notification.event.as_str())
            .text("subject", notification.subject.clone())
            .text("body", notification.body.clone());

        if let Some(path) = &notification.attachment {
            let bytes = read_attachment(path).await?;
            let part = Part::bytes(bytes)
                .file_name(attachment_name(path))
                .mime_str("image/jpeg")?;
            form = form.part("attachment", part);
        }

        Ok(form)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let form = self.build_form(notification).await?;
        let response = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Sends notifications as email through an SMTP relay using STARTTLS. The
/// still, when present, travels as a JPEG attachment.
#[derive(Clone)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let host = config
            .smtp_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NotifyError::InvalidEndpoint {
                url: String::new(),
                message: "smtp_host is not set".to_string(),
            })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
            .port(config.smtp_port)
            .timeout(Some(config.timeout()));
        if let (Some(user), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        let from = parse_mailbox(config.email_from.as_deref().unwrap_or_default())?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| parse_mailbox(r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transport: builder.build(),
            from,
            recipients,
        })
    }

    fn build_message(
        &self,
        notification: &Notification,
        attachment: Option<(String, Vec<u8>)>,
    ) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.subject.clone());
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        let text = SinglePart::plain(notification.body.clone());
        let message = match attachment {
            Some((name, bytes)) => {
                let image = Attachment::new(name).body(bytes, ContentType::parse("image/jpeg")?);
                builder.multipart(MultiPart::mixed().singlepart(text).singlepart(image))?
            }
            None => builder.singlepart(text)?,
        };
        Ok(message)
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let attachment = match &notification.attachment {
            Some(path) => Some((attachment_name(path), read_attachment(path).await?)),
            None => None,
        };
        let message = self.build_message(notification, attachment)?;
        let response = self.transport.send(message).await?;
        debug!(code = %response.code(), "SMTP relay accepted message");
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|source| NotifyError::Address {
        address: address.to_string(),
        source,
    })
}

async fn read_attachment(path: &Path) -> Result<Vec<u8>, NotifyError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| NotifyError::Attachment {
            path: path.to_path_buf(),
            source,
        })
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

/// Build the notifier selected in configuration.
pub fn from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Webhook => {
            let url = config.webhook_url.as_deref().unwrap_or_default();
            Ok(Arc::new(WebhookNotifier::new(url, config.timeout())?))
        }
        NotifierKind::Email => Ok(Arc::new(EmailNotifier::new(config)?)),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_subjects() {
        let subjects = Subjects::default();
        assert_eq!(subjects.for_event(AlertEvent::Activated), "Alert Activated");
        assert_eq!(subjects.for_event(AlertEvent::Deactivated), "Alert Deactivated");
        assert_eq!(subjects.for_event(AlertEvent::CheckIn), "Checking In");
        assert_eq!(subjects.for_event(AlertEvent::Fault), "Alert Fault");
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failure() {
        let notifier = RecordingNotifier::failing();
        let notification = Subjects::default().notification(AlertEvent::CheckIn, "1.00Gb", None);

        assert!(!notify_best_effort(&notifier, &notification).await);
        assert_eq!(notifier.events(), vec![AlertEvent::CheckIn]);
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let notification = Subjects::default().notification(AlertEvent::Activated, "", None);
        assert!(notify_best_effort(&LogNotifier, &notification).await);
    }

    #[test]
    fn test_webhook_rejects_invalid_url() {
        let err = WebhookNotifier::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, NotifyError::InvalidEndpoint { .. }));
    }

    #[tokio::test]
    async fn test_webhook_missing_attachment() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let notification = Subjects::default().notification(
            AlertEvent::Activated,
            "",
            Some(PathBuf::from("/definitely/not/here.jpeg")),
        );

        let err = notifier.notify(&notification).await.unwrap_err();
        assert!(matches!(err, NotifyError::Attachment { .. }));
    }

    fn create_test_email_config() -> NotifierConfig {
        NotifierConfig {
            kind: NotifierKind::Email,
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_username: Some("vigil".to_string()),
            smtp_password: Some("secret".to_string()),
            email_from: Some("Vigil <vigil@example.com>".to_string()),
            recipients: vec![
                "owner@example.com".to_string(),
                "Neighbour <next.door@example.com>".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_email_message_carries_still() {
        let notifier = EmailNotifier::new(&create_test_email_config()).unwrap();
        let notification = Subjects::default().notification(
            AlertEvent::Activated,
            "Alert activated at 2024-03-09 07:05:04",
            Some(PathBuf::from("/alerts/alertActivated.jpeg")),
        );

        let message = notifier
            .build_message(
                &notification,
                Some(("alertActivated.jpeg".to_string(), vec![0xFF, 0xD8, 0xFF, 0xD9])),
            )
            .unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(formatted.contains("Subject: Alert Activated"));
        assert!(formatted.contains("Alert activated at 2024-03-09 07:05:04"));
        assert!(formatted.contains("alertActivated.jpeg"));
        assert!(formatted.contains("image/jpeg"));
        assert!(formatted.contains("multipart/mixed"));
        assert_eq!(message.envelope().to().len(), 2);
    }

    #[test]
    fn test_email_message_without_still_is_plain() {
        let notifier = EmailNotifier::new(&create_test_email_config()).unwrap();
        let notification =
            Subjects::default().notification(AlertEvent::CheckIn, "Free space 12.50Gb", None);

        let message = notifier.build_message(&notification, None).unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(formatted.contains("Subject: Checking In"));
        assert!(formatted.contains("Free space 12.50Gb"));
        assert!(!formatted.contains("multipart/mixed"));
    }

    #[test]
    fn test_email_rejects_bad_recipient() {
        let mut config = create_test_email_config();
        config.recipients.push("not an address".to_string());

        let err = EmailNotifier::new(&config).err().unwrap();
        assert!(matches!(err, NotifyError::Address { address, .. } if address == "not an address"));
    }

    #[tokio::test]
    async fn test_email_missing_attachment() {
        let notifier = EmailNotifier::new(&create_test_email_config()).unwrap();
        let notification = Subjects::default().notification(
            AlertEvent::Deactivated,
            "",
            Some(PathBuf::from("/definitely/not/here.jpeg")),
        );

        let err = notifier.notify(&notification).await.unwrap_err();
        assert!(matches!(err, NotifyError::Attachment { .. }));
    }

    #[test]
    fn test_from_config_selects_backend() {
        let config = NotifierConfig {
            kind: NotifierKind::Webhook,
            webhook_url: Some("https://example.com/hook".to_string()),
            ..Default::default()
        };
        assert!(from_config(&config).is_ok());

        let broken = NotifierConfig {
            kind: NotifierKind::Webhook,
            webhook_url: None,
            ..Default::default()
        };
        assert!(from_config(&broken).is_err());

        assert!(from_config(&create_test_email_config()).is_ok());
        let no_relay = NotifierConfig {
            smtp_host: None,
            ..create_test_email_config()
        };
        assert!(matches!(
            from_config(&no_relay).err(),
            Some(NotifyError::InvalidEndpoint { .. })
        ));
    }
}
