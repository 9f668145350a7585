//! Outbound email: the verification message and the transports that deliver it.

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{info, instrument};

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()>;
}

pub const VERIFICATION_SUBJECT: &str = "Verify Your Email Address";

/// Builds the verification message sent after registration, resend and re-issue.
pub fn verification_email(to_email: &str, to_name: &str, link: &str) -> OutgoingEmail {
    let text = format!(
        "Hello {to_name},\n\n\
         Thank you for registering with Job Finder. To complete your registration, \
         please verify your email address by opening the link below:\n\n\
         {link}\n\n\
         This verification link will expire in 1 hour.\n\n\
         If you didn't create an account with Job Finder, you can safely ignore this email.\n"
    );
    let name = html_escape(to_name);
    let href = html_escape(link);
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{VERIFICATION_SUBJECT}</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
  <div style="background-color: #4F46E5; color: white; padding: 20px; text-align: center; border-radius: 8px 8px 0 0;">
    <h1>Welcome to Job Finder!</h1>
  </div>
  <div style="background-color: #f9f9f9; padding: 30px; border-radius: 0 0 8px 8px;">
    <h2>Hello {name},</h2>
    <p>Thank you for registering with Job Finder. To complete your registration, please verify your email address by clicking the button below:</p>
    <div style="text-align: center;">
      <a href="{href}" style="display: inline-block; background-color: #4F46E5; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; margin: 20px 0;">Verify Email Address</a>
    </div>
    <p>If the button doesn't work, you can copy and paste this link into your browser:</p>
    <p style="word-break: break-all; color: #4F46E5;">{href}</p>
    <p><strong>Important:</strong> This verification link will expire in 1 hour for security reasons.</p>
    <p>If you didn't create an account with Job Finder, you can safely ignore this email.</p>
  </div>
  <div style="text-align: center; margin-top: 30px; color: #666; font-size: 14px;">
    <p>This email was sent from Job Finder. Please do not reply to this email.</p>
  </div>
</body>
</html>
"#
    );
    OutgoingEmail {
        to_email: to_email.to_string(),
        to_name: Some(to_name.to_string()),
        subject: VERIFICATION_SUBJECT.to_string(),
        html,
        text,
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(cfg: &MailConfig, host: &str) -> anyhow::Result<Self> {
        let builder = if cfg.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .with_context(|| format!("smtp relay {}", host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let mut builder = builder.port(cfg.smtp_port);

        if let (Some(user), Some(pass)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = Mailbox::new(
            Some(cfg.from_name.clone()),
            cfg.from_address.parse().context("parse MAIL_FROM_ADDRESS")?,
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip(self, email), fields(to = %email.to_email))]
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        let to = Mailbox::new(
            email.to_name.clone(),
            email.to_email.parse().context("parse recipient address")?,
        );
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject)
            .multipart(MultiPart::alternative_plain_html(email.text, email.html))
            .context("build email")?;
        self.transport.send(message).await.context("smtp send")?;
        info!("email sent");
        Ok(())
    }
}

/// Used when no SMTP host is configured: the message is written to the log instead.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        info!(to = %email.to_email, subject = %email.subject, body = %email.text, "smtp not configured; email logged");
        Ok(())
    }
}

pub fn mailer_from_config(cfg: &MailConfig) -> anyhow::Result<std::sync::Arc<dyn Mailer>> {
    match cfg.smtp_host.as_deref() {
        Some(host) => Ok(std::sync::Arc::new(SmtpMailer::from_config(cfg, host)?)),
        None => {
            tracing::warn!("SMTP_HOST not set; verification emails will only be logged");
            Ok(std::sync::Arc::new(LogMailer))
        }
    }
}

/// Captures outgoing mail; can be switched to fail every send.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMailer {
    sent: std::sync::Mutex<Vec<OutgoingEmail>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    /// Token carried by the link in the most recent message.
    pub fn last_token(&self) -> Option<String> {
        let sent = self.sent.lock().unwrap();
        let text = &sent.last()?.text;
        let start = text.find("token=")? + "token=".len();
        Some(
            text[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect(),
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("mail transport unavailable");
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}
