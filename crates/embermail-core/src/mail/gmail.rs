//! Gmail adapter
//!
//! Implements [`MailClient`](super::MailClient) over the Gmail REST API.
//! Sends build an RFC 822 payload and go through `messages/send`; label
//! operations go through `messages/{id}/modify`; refresh exchanges the
//! refresh token at the OAuth token endpoint.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use embermail_common::types::OauthTokens;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{InboundMessage, MailClient, MailError, SentMessage};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Cap on how many message stubs a single list call expands
const LIST_PAGE_SIZE: u32 = 50;

/// Gmail REST client
pub struct GmailClient {
    http: Client,
    api_base: String,
    token_url: String,
}

impl GmailClient {
    /// Create a client with a 30 second deadline on every call
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }

    /// Point the client at a different API base (integration tests)
    pub fn with_endpoints(api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        let mut client = Self::new();
        client.api_base = api_base.into();
        client.token_url = token_url.into();
        client
    }

    fn classify_transport(e: reqwest::Error) -> MailError {
        MailError::Transient(format!("HTTP transport: {}", e))
    }

    fn classify_status(status: StatusCode, body: &str) -> MailError {
        if status == StatusCode::UNAUTHORIZED {
            MailError::PermanentAuth(format!("{}: {}", status, body))
        } else if status == StatusCode::FORBIDDEN
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            MailError::Transient(format!("{}: {}", status, body))
        } else {
            MailError::PermanentOther(format!("{}: {}", status, body))
        }
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        creds: &OauthTokens,
        url: &str,
        body: &B,
    ) -> Result<T, MailError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&creds.access_token)
            .json(body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| MailError::PermanentOther(format!("Malformed API response: {}", e)))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        creds: &OauthTokens,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MailError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&creds.access_token)
            .query(query)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| MailError::PermanentOther(format!("Malformed API response: {}", e)))
    }

    /// Expand message stubs from a list query into header summaries
    async fn fetch_summaries(
        &self,
        creds: &OauthTokens,
        query: String,
    ) -> Result<Vec<InboundMessage>, MailError> {
        let url = format!("{}/messages", self.api_base);
        let list: MessageList = self
            .get_json(
                creds,
                &url,
                &[
                    ("q", query),
                    ("maxResults", LIST_PAGE_SIZE.to_string()),
                ],
            )
            .await?;

        let mut summaries = Vec::new();
        for stub in list.messages.unwrap_or_default() {
            let url = format!("{}/messages/{}", self.api_base, stub.id);
            let detail: MessageDetail = self
                .get_json(
                    creds,
                    &url,
                    &[
                        ("format", "metadata".to_string()),
                        ("metadataHeaders", "From".to_string()),
                        ("metadataHeaders", "Subject".to_string()),
                    ],
                )
                .await?;

            let from = detail.header("From").unwrap_or_default();
            let subject = detail.header("Subject").unwrap_or_default();
            summaries.push(InboundMessage {
                provider_msg_id: detail.id,
                provider_thread_id: detail.thread_id,
                from,
                subject,
            });
        }

        Ok(summaries)
    }

    async fn modify_labels(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), MailError> {
        let url = format!("{}/messages/{}/modify", self.api_base, provider_msg_id);
        let body = ModifyRequest {
            add_label_ids: add.iter().map(|s| s.to_string()).collect(),
            remove_label_ids: remove.iter().map(|s| s.to_string()).collect(),
        };
        let _: MessageStub = self.post_json(creds, &url, &body).await?;
        Ok(())
    }
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble an RFC 822 HTML message
fn build_rfc822(
    from: &str,
    to: &str,
    subject: &str,
    html: &str,
    in_reply_to: Option<&str>,
) -> String {
    let mut raw = String::new();
    raw.push_str(&format!("From: {}\r\n", from));
    raw.push_str(&format!("To: {}\r\n", to));
    raw.push_str(&format!("Subject: {}\r\n", subject));
    if let Some(msg_id) = in_reply_to {
        raw.push_str(&format!("In-Reply-To: {}\r\n", msg_id));
        raw.push_str(&format!("References: {}\r\n", msg_id));
    }
    raw.push_str("MIME-Version: 1.0\r\n");
    raw.push_str("Content-Type: text/html; charset=UTF-8\r\n");
    raw.push_str("\r\n");
    raw.push_str(html);
    raw
}

#[async_trait]
impl MailClient for GmailClient {
    async fn send(
        &self,
        creds: &OauthTokens,
        from: &str,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<SentMessage, MailError> {
        let raw = build_rfc822(from, to, subject, html, None);
        let url = format!("{}/messages/send", self.api_base);
        let body = SendRequest {
            raw: URL_SAFE_NO_PAD.encode(raw),
            thread_id: None,
        };

        let sent: MessageStub = self.post_json(creds, &url, &body).await?;
        debug!(to = %to, "Gmail send accepted");

        Ok(SentMessage {
            provider_msg_id: sent.id,
            provider_thread_id: sent.thread_id,
        })
    }

    async fn send_reply(
        &self,
        creds: &OauthTokens,
        from: &str,
        to: &str,
        original_thread_id: &str,
        original_msg_id: &str,
        subject: &str,
        html: &str,
    ) -> Result<SentMessage, MailError> {
        let reply_subject = if subject.trim().to_lowercase().starts_with("re:") {
            subject.to_string()
        } else {
            format!("Re: {}", subject)
        };

        let raw = build_rfc822(from, to, &reply_subject, html, Some(original_msg_id));
        let url = format!("{}/messages/send", self.api_base);
        let body = SendRequest {
            raw: URL_SAFE_NO_PAD.encode(raw),
            thread_id: Some(original_thread_id.to_string()),
        };

        let sent: MessageStub = self.post_json(creds, &url, &body).await?;

        Ok(SentMessage {
            provider_msg_id: sent.id,
            provider_thread_id: sent.thread_id,
        })
    }

    async fn list_unread_to(
        &self,
        creds: &OauthTokens,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailError> {
        let query = format!("is:unread in:inbox after:{}", since.timestamp());
        self.fetch_summaries(creds, query).await
    }

    async fn mark_read(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
    ) -> Result<(), MailError> {
        self.modify_labels(creds, provider_msg_id, &[], &["UNREAD"])
            .await
    }

    async fn mark_important(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
    ) -> Result<(), MailError> {
        self.modify_labels(creds, provider_msg_id, &["STARRED"], &[])
            .await
    }

    async fn list_spam_from(
        &self,
        creds: &OauthTokens,
        sender_addresses: &[String],
    ) -> Result<Vec<InboundMessage>, MailError> {
        if sender_addresses.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!("in:spam from:({})", sender_addresses.join(" OR "));
        self.fetch_summaries(creds, query).await
    }

    async fn unspam(&self, creds: &OauthTokens, provider_msg_id: &str) -> Result<(), MailError> {
        self.modify_labels(creds, provider_msg_id, &["INBOX"], &["SPAM"])
            .await
    }

    async fn refresh(&self, creds: &OauthTokens) -> Result<OauthTokens, MailError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("refresh_token", creds.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MailError::Transient(format!("HTTP transport: {}", e)))?;

        if !status.is_success() {
            // The token endpoint reports a dead refresh token as 400
            // invalid_grant; anything else follows the usual taxonomy.
            if body.contains("invalid_grant") {
                return Err(MailError::PermanentAuth(body));
            }
            return Err(Self::classify_status(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| MailError::PermanentOther(format!("Malformed token response: {}", e)))?;

        Ok(OauthTokens {
            access_token: token.access_token,
            refresh_token: creds.refresh_token.clone(),
            expires_at: Some(Utc::now() + ChronoDuration::seconds(token.expires_in)),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            scopes: token
                .scope
                .map(|s| s.split(' ').map(str::to_string).collect())
                .unwrap_or_else(|| creds.scopes.clone()),
        })
    }
}

#[derive(Debug, Serialize)]
struct SendRequest {
    raw: String,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    messages: Option<Vec<MessageStub>>,
}

#[derive(Debug, Deserialize)]
struct MessageDetail {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default)]
    payload: MessagePayload,
}

impl MessageDetail {
    fn header(&self, name: &str) -> Option<String> {
        self.payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<MessageHeader>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct ModifyRequest {
    #[serde(rename = "addLabelIds")]
    add_label_ids: Vec<String>,
    #[serde(rename = "removeLabelIds")]
    remove_label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rfc822_headers() {
        let raw = build_rfc822(
            "a@example.com",
            "b@example.com",
            "Hello",
            "<p>Hi</p>",
            None,
        );
        assert!(raw.starts_with("From: a@example.com\r\n"));
        assert!(raw.contains("Subject: Hello\r\n"));
        assert!(raw.contains("Content-Type: text/html"));
        assert!(raw.ends_with("<p>Hi</p>"));
        assert!(!raw.contains("In-Reply-To"));
    }

    #[test]
    fn test_build_rfc822_reply_threading() {
        let raw = build_rfc822("a@x.com", "b@x.com", "Re: Hello", "<p>ok</p>", Some("m-123"));
        assert!(raw.contains("In-Reply-To: m-123\r\n"));
        assert!(raw.contains("References: m-123\r\n"));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            GmailClient::classify_status(StatusCode::UNAUTHORIZED, ""),
            MailError::PermanentAuth(_)
        ));
        assert!(matches!(
            GmailClient::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            MailError::Transient(_)
        ));
        assert!(matches!(
            GmailClient::classify_status(StatusCode::BAD_GATEWAY, ""),
            MailError::Transient(_)
        ));
        assert!(matches!(
            GmailClient::classify_status(StatusCode::BAD_REQUEST, ""),
            MailError::PermanentOther(_)
        ));
    }
}
