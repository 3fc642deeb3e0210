//! Telegram Bot API transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tracing::debug;

use super::NotificationTransport;
use crate::error::NotifyError;

/// Public Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum bytes of an error body kept in [`NotifyError::Rejected`].
const MAX_ERROR_BODY: usize = 256;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Sends notifications to one chat through a bot.
pub struct TelegramTransport {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

// never print the token
impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

impl TelegramTransport {
    /// Creates a transport for `chat_id`. `api_base` defaults to
    /// [`DEFAULT_API_BASE`].
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::InvalidConfig`] if the token or chat id is
    /// empty, or [`NotifyError::Http`] if the HTTP client cannot be built.
    pub fn new(
        token: &str,
        chat_id: &str,
        api_base: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        if token.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("bot token is empty".to_string()));
        }
        if chat_id.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("chat id is empty".to_string()));
        }
        let base = api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(http)?;
        Ok(Self {
            client,
            endpoint: format!("{base}/bot{token}"),
            chat_id: chat_id.to_string(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.endpoint)
    }

    async fn check(response: reqwest::Response) -> Result<(), NotifyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Wraps a client error without its URL, which carries the bot token.
fn http(err: reqwest::Error) -> NotifyError {
    NotifyError::Http(err.without_url())
}

#[async_trait]
impl NotificationTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        debug!(chars = text.chars().count(), "telegram sendMessage");
        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .map_err(http)?;
        Self::check(response).await
    }

    async fn send_photo(&self, png: &[u8], caption: &str) -> Result<(), NotifyError> {
        debug!(bytes = png.len(), "telegram sendPhoto");
        let photo = Part::bytes(png.to_vec())
            .file_name("snapshot.png")
            .mime_str("image/png")
            .map_err(http)?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .part("photo", photo);
        let response = self
            .client
            .post(self.url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(http)?;
        Self::check(response).await
    }
}
