//! SMTP notifier.
//!
//! Uses the `lettre` crate. Failure alerts are plain text with the diagnostic
//! log attached; history digests are HTML rendered by [`super::digest`].

use std::path::PathBuf;

use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use super::{describe, digest, Notifier, NotifyError};
use crate::history::HistoryMap;
use crate::stat::Stat;

/// SMTP connection and message settings.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Upgrade with STARTTLS. Wins over `ssl` when both are set.
    pub starttls: bool,
    /// Connect with implicit TLS.
    pub ssl: bool,
    pub insecure_skip_verify: bool,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub history_subject: String,
    /// Custom digest template; the built-in one is used when unset.
    pub history_template: Option<PathBuf>,
    /// Diagnostic log attached to failure alerts when readable.
    pub attach_log: Option<PathBuf>,
}

pub struct EmailNotifier {
    settings: EmailSettings,
}

impl EmailNotifier {
    pub fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    fn mailbox(addr: &str) -> Result<Mailbox, NotifyError> {
        addr.parse().map_err(|_| NotifyError::Address(addr.to_string()))
    }

    fn envelope(&self, subject: &str) -> Result<lettre::message::MessageBuilder, NotifyError> {
        let mut builder = Message::builder()
            .from(Self::mailbox(&self.settings.from)?)
            .subject(subject);
        for to in &self.settings.to {
            builder = builder.to(Self::mailbox(to)?);
        }
        Ok(builder)
    }

    /// Build the failure alert for `stat`, attaching `log` if given.
    fn alert_message(
        &self,
        stat: &Stat,
        log: Option<(String, Vec<u8>)>,
    ) -> Result<Message, NotifyError> {
        let mut body = MultiPart::mixed().singlepart(SinglePart::plain(describe(stat)));
        if let Some((filename, content)) = log {
            let attachment = Attachment::new(filename).body(content, ContentType::TEXT_PLAIN);
            body = body.singlepart(attachment);
        }
        self.envelope(&self.settings.subject)?
            .multipart(body)
            .map_err(|e| NotifyError::Message(e.to_string()))
    }

    fn history_message(&self, html: String) -> Result<Message, NotifyError> {
        self.envelope(&self.settings.history_subject)?
            .singlepart(SinglePart::html(html))
            .map_err(|e| NotifyError::Message(e.to_string()))
    }

    async fn read_log(&self) -> Option<(String, Vec<u8>)> {
        let path = self.settings.attach_log.as_ref()?;
        match tokio::fs::read(path).await {
            Ok(content) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "log.txt".to_string());
                Some((filename, content))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot attach log to alert");
                None
            }
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let s = &self.settings;

        let tls = if s.starttls || s.ssl {
            let params = TlsParameters::builder(s.host.clone())
                .dangerous_accept_invalid_certs(s.insecure_skip_verify)
                .build()
                .map_err(|e| NotifyError::Transport(format!("TLS parameters error: {e}")))?;
            if s.starttls {
                Tls::Required(params)
            } else {
                Tls::Wrapper(params)
            }
        } else {
            Tls::None
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(s.host.as_str())
            .port(s.port)
            .tls(tls);
        if !s.user.is_empty() {
            builder = builder.credentials(Credentials::new(s.user.clone(), s.pass.clone()));
        }
        Ok(builder.build())
    }

    async fn send(&self, message: Message) -> Result<(), NotifyError> {
        self.transport()?
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        debug!(host = %self.settings.host, "email sent");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, stat: &Stat) -> Result<(), NotifyError> {
        let log = self.read_log().await;
        let message = self.alert_message(stat, log)?;
        self.send(message).await
    }

    async fn notify_history(&self, history: &HistoryMap) -> Result<(), NotifyError> {
        if history.is_empty() {
            return Err(NotifyError::EmptyHistory);
        }
        let custom = match &self.settings.history_template {
            Some(path) => Some(digest::load_template(path)?),
            None => None,
        };
        let html = digest::render(history, custom.as_deref())?;
        let message = self.history_message(html)?;
        self.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::DEFAULT_TIME_FORMAT;

    fn settings() -> EmailSettings {
        EmailSettings {
            host: "127.0.0.1".into(),
            port: 1,
            user: String::new(),
            pass: String::new(),
            starttls: false,
            ssl: false,
            insecure_skip_verify: false,
            from: "backup@example.com".into(),
            to: vec!["ops@example.com".into(), "dba@example.com".into()],
            subject: "Database Backup Failure".into(),
            history_subject: "Database Backup History".into(),
            history_template: None,
            attach_log: None,
        }
    }

    fn failed() -> Stat {
        Stat::new("mysqldump", DEFAULT_TIME_FORMAT).finish(Some("exit 2".into()))
    }

    #[test]
    fn test_alert_message_with_attachment() {
        let notifier = EmailNotifier::new(settings());
        let log = Some(("cronguard.log".to_string(), b"line one\n".to_vec()));
        let message = notifier.alert_message(&failed(), log).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Database Backup Failure"));
        assert!(raw.contains("cronguard.log"));
        assert!(raw.contains("exit 2"));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let mut s = settings();
        s.from = "not an address".into();
        let notifier = EmailNotifier::new(s);
        assert!(matches!(
            notifier.alert_message(&failed(), None),
            Err(NotifyError::Address(_))
        ));
    }

    #[test]
    fn test_history_message_is_html() {
        let notifier = EmailNotifier::new(settings());
        let message = notifier.history_message("<p>ok</p>".into()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Database Backup History"));
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn test_notify_history_empty() {
        let notifier = EmailNotifier::new(settings());
        let result = notifier.notify_history(&HistoryMap::new()).await;
        assert!(matches!(result, Err(NotifyError::EmptyHistory)));
    }

    #[tokio::test]
    async fn test_notify_unreachable_server_fails() {
        let notifier = EmailNotifier::new(settings());
        let result = notifier.notify(&failed()).await;
        assert!(matches!(result, Err(NotifyError::Transport(_))));
    }
}
