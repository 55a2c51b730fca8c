//! HTTP postback messenger.
//!
//! POSTs each message as a JSON document to an operator-configured endpoint.
//! 4xx responses are permanent rejections, 5xx and transport failures are
//! transient.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::models::{Message, PostbackPayload};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::{MessengerError, PermanentError, Result, TransientError},
    Messenger,
};

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_max_conns() -> usize {
    10
}

/// Configuration for one postback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostbackConfig {
    /// Registry name of this messenger.
    pub name: String,

    /// Endpoint URL the JSON document is POSTed to.
    pub root_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Request timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connection pool size towards the endpoint.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
}

/// A messenger that delivers over HTTP POST.
#[derive(Debug)]
pub struct PostbackMessenger {
    config: PostbackConfig,
    client: Client,
}

impl PostbackMessenger {
    /// Build the messenger and its HTTP client.
    ///
    /// # Errors
    /// If the configuration is incomplete or the client cannot be built.
    pub fn new(config: PostbackConfig) -> Result<Self> {
        if config.name.trim().is_empty() || config.root_url.trim().is_empty() {
            return Err(MessengerError::Permanent(PermanentError::Configuration(
                "postback messenger needs a name and a root_url".to_string(),
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.max_conns)
            .build()
            .map_err(|e| {
                MessengerError::Permanent(PermanentError::Configuration(format!(
                    "error building HTTP client: {e}"
                )))
            })?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Messenger for PostbackMessenger {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn push(&self, message: &Message) -> Result<()> {
        let payload = PostbackPayload::from(message);

        let mut request = self.client.post(&self.config.root_url).json(&payload);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MessengerError::Transient(TransientError::Timeout(e.to_string()))
            } else {
                MessengerError::Transient(TransientError::ConnectionFailed(e.to_string()))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("{status}: {}", body.chars().take(512).collect::<String>());

        if status.is_client_error() {
            Err(MessengerError::Permanent(PermanentError::Rejected(detail)))
        } else {
            Err(MessengerError::Transient(TransientError::ServerBusy(
                detail,
            )))
        }
    }
}
