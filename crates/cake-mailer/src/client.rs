//! HTTP email provider client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{EmailTransport, MailerError};

/// Sends birthday greetings through `{endpoint}/send-email`.
pub struct HttpMailer {
    http: Client,
    endpoint: Option<String>,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    email: &'a str,
    message: String,
}

impl HttpMailer {
    /// Create a mailer. With no endpoint every send fails as unconfigured.
    pub fn new(endpoint: Option<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            endpoint: endpoint
                .map(|e| e.trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty()),
        }
    }

    /// The greeting body sent to the provider.
    pub fn greeting(display_name: &str) -> String {
        format!("Hey, {} it’s your birthday", display_name)
    }

    /// Deliver one greeting, reporting why it failed.
    pub async fn deliver(&self, display_name: &str, email: &str) -> Result<(), MailerError> {
        let endpoint = self.endpoint.as_deref().ok_or(MailerError::NotConfigured)?;
        let url = format!("{}/send-email", endpoint);

        let response = self
            .http
            .post(&url)
            .json(&SendEmailRequest {
                email,
                message: Self::greeting(display_name),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl EmailTransport for HttpMailer {
    async fn send(&self, display_name: &str, email: &str) -> bool {
        match self.deliver(display_name, email).await {
            Ok(()) => {
                debug!(email, "birthday email accepted by provider");
                true
            }
            Err(e) => {
                warn!(email, error = %e, "failed to send email");
                false
            }
        }
    }
}
