use std::fmt;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use indoc::formatdoc;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::{
    address::Address,
    balance::{Balance, Threshold},
    oracle::NATIVE_SYMBOL,
    store::SubscriberId,
};

use super::Notifier;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

// Used to escape characters in telegram messages.
// https://core.telegram.org/bots/api#markdownv2-style
pub fn escape_str(input: &str) -> String {
    let mut output = String::new();
    for c in input.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' | '\\' => {
                output.push('\\');
            }
            _ => (),
        };
        output.push(c);
    }
    output
}

/// A message that is safe to send with `parse_mode` MarkdownV2 and fits
/// within the Telegram character limit.
#[derive(Clone, Debug, PartialEq)]
pub struct TelegramSafeAlert(String);

const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

impl TelegramSafeAlert {
    /// Caps `input` at the Telegram limit. A cut that would leave a dangling
    /// escape drops the backslash with it.
    pub fn from_escaped_string(input: String) -> Self {
        if input.chars().count() <= TELEGRAM_MAX_MESSAGE_LENGTH {
            return Self(input);
        }

        tracing::warn!(
            "telegram alert too long, truncating to {} characters",
            TELEGRAM_MAX_MESSAGE_LENGTH
        );
        let mut truncated: String = input.chars().take(TELEGRAM_MAX_MESSAGE_LENGTH).collect();
        let trailing_backslashes = truncated.chars().rev().take_while(|c| *c == '\\').count();
        if trailing_backslashes % 2 == 1 {
            truncated.pop();
        }
        Self(truncated)
    }

    /// The alert a subscriber receives when `address` dropped below their
    /// threshold.
    pub fn low_balance(address: &Address, balance: &Balance, threshold: &Threshold) -> Self {
        let message = formatdoc!(
            "
            🚨 *Low gas balance*

            📍 Address: `{address}`
            💰 Balance: {balance} {symbol}
            ⚠️ Threshold: {threshold} {symbol}

            Top up soon to keep transactions going\\!",
            address = address.short(),
            balance = escape_str(&balance.to_string()),
            threshold = escape_str(&threshold.to_string()),
            symbol = NATIVE_SYMBOL,
        );
        Self::from_escaped_string(message)
    }
}

impl fmt::Display for TelegramSafeAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sends alerts as direct messages, the subscriber id being the chat id.
#[derive(Clone)]
pub struct TelegramNotifier {
    api_key: String,
    api_url: Url,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client, api_url: Url, api_key: String) -> Self {
        Self {
            api_key,
            api_url,
            client,
        }
    }

    async fn send_message_request(
        &self,
        chat_id: SubscriberId,
        message: &TelegramSafeAlert,
    ) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_url.as_str().trim_end_matches('/'),
            self.api_key
        );

        let json_body = serde_json::json!({
            "chat_id": chat_id,
            "text": message.0,
            "parse_mode": "MarkdownV2",
            "disable_web_page_preview": true,
        });

        let response = self.client.post(&url).json(&json_body).send().await?;

        match response.status() {
            StatusCode::OK => {
                debug!(chat_id, %message, "sent telegram message");
                Ok(())
            }
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => {
                let body = response.text().await?;
                Err(anyhow!("failed to send telegram message: {}", body))
            }
            status => Err(anyhow!(
                "failed to send telegram message, status: {:?}",
                status
            )),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        subscriber: SubscriberId,
        address: &Address,
        balance: &Balance,
        threshold: &Threshold,
    ) -> Result<()> {
        let message = TelegramSafeAlert::low_balance(address, balance, threshold);
        self.send_message_request(subscriber, &message).await
    }
}
