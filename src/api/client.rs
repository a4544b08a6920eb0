//! HTTP client for the conversation API
//!
//! Wraps reqwest::Client with bearer session-token auth.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::ChatApi;
use crate::models::wire::{OutgoingMessage, WireMessage};
use crate::room::ConversationKey;

pub struct HttpChatApi {
    http: reqwest::Client,
    base: Url,
    token: String,
}

/// History responses come either bare or wrapped.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Bare(Vec<WireMessage>),
    Wrapped { messages: Vec<WireMessage> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SendResponse {
    Wrapped { message: WireMessage },
    Bare(WireMessage),
}

impl HttpChatApi {
    pub fn new(base: Url, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            token: token.into(),
        }
    }

    /// `{base}/conversations/{key}/messages`
    fn messages_url(&self, key: &ConversationKey) -> Result<Url> {
        let room = key.to_string();
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("{} cannot be used as an API base URL", self.base))?
            .pop_if_empty()
            .extend(["conversations", room.as_str(), "messages"]);
        Ok(url)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<WireMessage>> {
        let url = self.messages_url(key)?;
        tracing::debug!("History GET {}", url);

        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("History GET {} failed", url))?;

        let body = check_response(resp, url.as_str())
            .await?
            .text()
            .await
            .context("Failed to read history response")?;
        parse_history(&body)
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        outgoing: &OutgoingMessage,
    ) -> Result<WireMessage> {
        let url = self.messages_url(key)?;
        tracing::debug!("Message POST {}", url);

        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(outgoing)
            .send()
            .await
            .with_context(|| format!("Message POST {} failed", url))?;

        let body = check_response(resp, url.as_str())
            .await?
            .text()
            .await
            .context("Failed to read send response")?;
        parse_sent(&body)
    }
}

fn parse_history(body: &str) -> Result<Vec<WireMessage>> {
    let parsed: HistoryResponse =
        serde_json::from_str(body).context("Failed to parse history response")?;
    Ok(match parsed {
        HistoryResponse::Bare(messages) | HistoryResponse::Wrapped { messages } => messages,
    })
}

fn parse_sent(body: &str) -> Result<WireMessage> {
    let parsed: SendResponse =
        serde_json::from_str(body).context("Failed to parse send response")?;
    Ok(match parsed {
        SendResponse::Wrapped { message } | SendResponse::Bare(message) => message,
    })
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Session token may be invalid -- run 'chat-sync login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
