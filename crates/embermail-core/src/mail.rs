//! Mail provider interface
//!
//! The engine never talks to a provider directly; it goes through the
//! [`MailClient`] trait, which any provider adapter implements. Adapters
//! must surface the three-way error taxonomy so the dispatcher can decide
//! between retrying next tick and pausing the mailbox.

pub mod gmail;

pub use gmail::GmailClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use embermail_common::types::{OauthTokens, Provider};
use embermail_common::{Error, Result};
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Mail client error taxonomy
#[derive(Debug, ThisError)]
pub enum MailError {
    /// Network trouble, 5xx, throttling: retry on a later tick
    #[error("Transient mail failure: {0}")]
    Transient(String),

    /// The credential bundle can no longer be refreshed
    #[error("Authorization permanently invalid: {0}")]
    PermanentAuth(String),

    /// A failure that retrying will not fix
    #[error("Permanent mail failure: {0}")]
    PermanentOther(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, MailError::PermanentAuth(_))
    }
}

/// Provider identifiers of a sent message
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub provider_msg_id: String,
    pub provider_thread_id: String,
}

/// Summary of an inbound or spam-foldered message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub provider_msg_id: String,
    pub provider_thread_id: String,
    pub from: String,
    pub subject: String,
}

/// Operations a provider adapter must support
#[async_trait]
pub trait MailClient: Send + Sync {
    /// Send a new message; returns provider identifiers
    async fn send(
        &self,
        creds: &OauthTokens,
        from: &str,
        to: &str,
        subject: &str,
        html: &str,
    ) -> std::result::Result<SentMessage, MailError>;

    /// Send a threaded reply to an earlier message
    async fn send_reply(
        &self,
        creds: &OauthTokens,
        from: &str,
        to: &str,
        original_thread_id: &str,
        original_msg_id: &str,
        subject: &str,
        html: &str,
    ) -> std::result::Result<SentMessage, MailError>;

    /// Unread inbox messages received since the given instant
    async fn list_unread_to(
        &self,
        creds: &OauthTokens,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<InboundMessage>, MailError>;

    /// Mark a message read
    async fn mark_read(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
    ) -> std::result::Result<(), MailError>;

    /// Star / mark a message important
    async fn mark_important(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
    ) -> std::result::Result<(), MailError>;

    /// Spam-foldered messages from any of the given sender addresses
    async fn list_spam_from(
        &self,
        creds: &OauthTokens,
        sender_addresses: &[String],
    ) -> std::result::Result<Vec<InboundMessage>, MailError>;

    /// Remove the spam label and restore a message to the inbox
    async fn unspam(
        &self,
        creds: &OauthTokens,
        provider_msg_id: &str,
    ) -> std::result::Result<(), MailError>;

    /// Exchange the refresh token for a new bundle. The engine persists
    /// the result.
    async fn refresh(
        &self,
        creds: &OauthTokens,
    ) -> std::result::Result<OauthTokens, MailError>;
}

/// Adapter lookup by provider
#[derive(Clone)]
pub struct MailClientRegistry {
    gmail: Arc<dyn MailClient>,
}

impl MailClientRegistry {
    pub fn new(gmail: Arc<dyn MailClient>) -> Self {
        Self { gmail }
    }

    /// Resolve the adapter for a provider. `Provider::Other` has no
    /// adapter; the caller pauses the mailbox.
    pub fn for_provider(&self, provider: Provider) -> Result<Arc<dyn MailClient>> {
        match provider {
            Provider::Gmail => Ok(Arc::clone(&self.gmail)),
            Provider::Other => Err(Error::UnknownProvider(provider.to_string())),
        }
    }
}

/// Extract the bare address from a `Display Name <addr@host>` header value
pub fn bare_address(header: &str) -> String {
    match (header.rfind('<'), header.rfind('>')) {
        (Some(open), Some(close)) if open < close => header[open + 1..close].trim().to_string(),
        _ => header.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_address() {
        assert_eq!(bare_address("Jo Doe <jo@example.com>"), "jo@example.com");
        assert_eq!(bare_address("jo@example.com"), "jo@example.com");
        assert_eq!(bare_address(" <jo@example.com> "), "jo@example.com");
        assert_eq!(bare_address("broken <jo@example.com"), "broken <jo@example.com");
    }

    #[test]
    fn test_error_classes() {
        assert!(MailError::Transient("x".into()).is_transient());
        assert!(!MailError::Transient("x".into()).is_auth());
        assert!(MailError::PermanentAuth("x".into()).is_auth());
        assert!(!MailError::PermanentOther("x".into()).is_transient());
    }
}
