use axum::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Mutex;
use tracing::{debug, error};

use crate::config::SmtpConfig;

/// Outbound email capability. The identity core only ever needs this one
/// operation; delivery internals stay behind it.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> anyhow::Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let creds = Credentials::new(cfg.username.clone(), cfg.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
            .port(cfg.port)
            .credentials(creds)
            .build();
        let from: Mailbox = cfg.from.parse()?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                text.to_string(),
                html.to_string(),
            ))?;
        let response = self.transport.send(message).await.map_err(|e| {
            error!(error = %e, "smtp send failed");
            anyhow::anyhow!(e)
        })?;
        debug!(code = %response.code(), "email accepted by relay");
        Ok(())
    }
}

/// A sent message captured by [`MemoryMailer`].
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Mailer that keeps messages in memory instead of delivering them. Used by
/// `AppState::fake()` and when running without an SMTP relay.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentEmail>>,
}

impl MemoryMailer {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().expect("mailer mutex poisoned").clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .expect("mailer mutex poisoned")
            .push(SentEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}

/// Render the password-reset email as `(html, text)`.
pub fn password_reset_email(
    reset_url: &str,
    name: Option<&str>,
    ttl_minutes: i64,
) -> (String, String) {
    let greeting = match name {
        Some(n) => format!("Hello {n},"),
        None => "Hello,".to_string(),
    };
    let html = format!(
        "<html><body>\
         <h2>Password Reset Request</h2>\
         <p>{greeting}</p>\
         <p>We received a request to reset the password for your account.</p>\
         <p><a href=\"{reset_url}\">Reset Password</a></p>\
         <p><strong>This link will expire in {ttl_minutes} minutes</strong> for security reasons.</p>\
         <p>If you didn't request this password reset, you can safely ignore this email.</p>\
         </body></html>"
    );
    let text = format!(
        "Password Reset Request\n\n\
         {greeting}\n\n\
         We received a request to reset the password for your account.\n\n\
         Reset your password by visiting this link:\n{reset_url}\n\n\
         This link will expire in {ttl_minutes} minutes for security reasons.\n\n\
         If you didn't request this password reset, you can safely ignore this email.\n"
    );
    (html, text)
}
