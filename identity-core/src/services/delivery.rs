use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SmtpConfig;

/// Out-of-band channel for second-factor codes.
///
/// A failed send is terminal for the login that triggered it.
#[async_trait]
pub trait ChallengeDelivery: Send + Sync {
    async fn send(&self, destination: &str, code: &str) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct EmailChallengeDelivery {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailChallengeDelivery {
    pub fn new(config: &SmtpConfig) -> Result<Self, anyhow::Error> {
        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay '{}': {}", config.host, e))?
            .timeout(Some(Duration::from_secs(10)));

        if !config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.user.clone(),
                config.password.expose_secret().clone(),
            ));
        }

        tracing::info!(host = %config.host, "Challenge delivery initialized with SMTP");

        Ok(Self {
            mailer: builder.build(),
            from_email: config.from.clone(),
        })
    }
}

#[async_trait]
impl ChallengeDelivery for EmailChallengeDelivery {
    async fn send(&self, destination: &str, code: &str) -> Result<(), anyhow::Error> {
        let email = Message::builder()
            .from(self.from_email.parse()?)
            .to(destination.parse()?)
            .subject("Your verification code")
            .header(ContentType::TEXT_PLAIN)
            .body(format!(
                "Your verification code is {}.\n\nIt expires in 5 minutes. If you did not try to sign in, you can ignore this message.",
                code
            ))?;

        // Send email in blocking thread pool to avoid blocking async runtime
        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await?
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send verification code");
                anyhow::anyhow!("SMTP send failed: {}", e)
            })?;

        tracing::info!("Verification code sent");
        Ok(())
    }
}

/// Records sends instead of delivering them.
#[derive(Default)]
pub struct MockChallengeDelivery {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl MockChallengeDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_code_for(&self, destination: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|(to, _)| to == destination)
            .map(|(_, code)| code)
    }
}

#[async_trait]
impl ChallengeDelivery for MockChallengeDelivery {
    async fn send(&self, destination: &str, code: &str) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("mock delivery failure"));
        }
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("Mutex poisoned"))?
            .push((destination.to_string(), code.to_string()));
        Ok(())
    }
}
