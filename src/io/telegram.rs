//! Telegram Bot API client implementing the send capability
//!
//! POST {api_base}/bot{token}/sendMessage with a JSON body. The token is part
//! of the URL, so URLs are never logged.

use crate::domain::types::ChatId;
use crate::infra::config::Config;
use crate::services::dispatcher::{MessageSender, SendError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Envelope every Bot API method answers with
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

/// Map a Bot API response to a send result.
///
/// `ok: false` is an API-level rejection (blocked bot, unknown chat, ...).
/// A body that is not a Bot API envelope is a transport problem.
pub fn parse_api_response(status: u16, body: &[u8]) -> Result<(), SendError> {
    match serde_json::from_slice::<ApiResponse>(body) {
        Ok(resp) if resp.ok => Ok(()),
        Ok(resp) => Err(SendError::Rejected {
            code: resp.error_code.unwrap_or(i64::from(status)),
            description: resp.description.unwrap_or_else(|| "no description".to_string()),
        }),
        Err(e) => Err(SendError::Transport(format!("http {status}: unreadable response: {e}"))),
    }
}

pub struct TelegramClient {
    client: reqwest::Client,
    send_url: String,
    timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_token(config.telegram_api_base(), &config.telegram_token(), config.send_timeout())
    }

    pub fn with_token(api_base: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        if token.is_empty() {
            anyhow::bail!("telegram bot token is not configured");
        }
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            send_url: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
            timeout,
        })
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send(&self, chat: ChatId, text: &str) -> Result<(), SendError> {
        let start = Instant::now();
        let body = serde_json::json!({ "chat_id": chat.0, "text": text });
        let body = serde_json::to_vec(&body).map_err(|e| SendError::Transport(e.to_string()))?;

        let response = self
            .client
            .post(&self.send_url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout(self.timeout)
                } else {
                    // without_url keeps the token out of the message
                    SendError::Transport(e.without_url().to_string())
                }
            })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SendError::Transport(e.without_url().to_string()))?;

        let result = parse_api_response(status, &bytes);
        debug!(
            chat_id = %chat,
            status = %status,
            ok = %result.is_ok(),
            latency_ms = %start.elapsed().as_millis(),
            "telegram_send_message"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok() {
        let body = br#"{"ok":true,"result":{"message_id":42}}"#;
        assert_eq!(parse_api_response(200, body), Ok(()));
    }

    #[test]
    fn test_parse_blocked_bot() {
        let body = br#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#;
        assert_eq!(
            parse_api_response(403, body),
            Err(SendError::Rejected {
                code: 403,
                description: "Forbidden: bot was blocked by the user".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejection_without_code_uses_status() {
        let body = br#"{"ok":false}"#;
        assert!(matches!(parse_api_response(400, body), Err(SendError::Rejected { code: 400, .. })));
    }

    #[test]
    fn test_parse_garbage_is_transport() {
        assert!(matches!(
            parse_api_response(502, b"<html>Bad Gateway</html>"),
            Err(SendError::Transport(_))
        ));
    }

    #[test]
    fn test_missing_token_rejected() {
        assert!(TelegramClient::with_token("https://api.telegram.org", "", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_send_url() {
        let client =
            TelegramClient::with_token("http://localhost:8081/", "123:abc", Duration::from_secs(1)).unwrap();
        assert_eq!(client.send_url, "http://localhost:8081/bot123:abc/sendMessage");
    }
}
