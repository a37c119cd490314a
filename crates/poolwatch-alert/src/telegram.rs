//! Telegram Bot API notifier.

use crate::error::{AlertError, AlertResult};
use crate::notifier::Notifier;
use poolwatch_core::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Default Bot API base URL.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends messages to one chat through `sendMessage`.
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("api_url", &self.api_url)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(
        api_url: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> AlertResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_url, self.bot_token)
    }

    async fn post_message(&self, text: String) -> AlertResult<()> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: true,
        };

        // The endpoint embeds the bot token; keep it out of error text.
        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body: Option<SendMessageResponse> = response.json().await.ok();

        match body {
            Some(body) if status.is_success() && body.ok => {
                debug!(chat_id = %self.chat_id, "Telegram message accepted");
                Ok(())
            }
            Some(body) => Err(AlertError::Rejected(format!(
                "HTTP {status}: {}",
                body.description.unwrap_or_else(|| "no description".to_string())
            ))),
            None => Err(AlertError::Rejected(format!("HTTP {status}: unreadable response"))),
        }
    }
}

impl Notifier for TelegramNotifier {
    fn send(&self, text: String) -> BoxFuture<'_, AlertResult<()>> {
        Box::pin(self.post_message(text))
    }
}
