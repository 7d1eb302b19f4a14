//! Common types for Embermail

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for mailboxes
pub type MailboxId = i64;

/// Unique identifier for plan entries
pub type PlanEntryId = i64;

/// Unique identifier for messages
pub type MessageId = i64;

/// Unique identifier for spam events
pub type SpamEventId = i64;

/// Mail provider backing a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Other,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Gmail => write!(f, "gmail"),
            Provider::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "other" => Ok(Provider::Other),
            other => Err(crate::Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Role a mailbox plays in the warmup process
///
/// Senders are the accounts being warmed; recipients only receive and
/// engage with warmup mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxRole {
    Sender,
    Recipient,
}

impl std::fmt::Display for MailboxRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxRole::Sender => write!(f, "sender"),
            MailboxRole::Recipient => write!(f, "recipient"),
        }
    }
}

impl std::str::FromStr for MailboxRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(MailboxRole::Sender),
            "recipient" => Ok(MailboxRole::Recipient),
            other => Err(crate::Error::Validation(format!(
                "Invalid mailbox role: {}",
                other
            ))),
        }
    }
}

/// Time-of-day activity band a planned send belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Peak,
    Normal,
    Low,
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Peak => write!(f, "peak"),
            Band::Normal => write!(f, "normal"),
            Band::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Band {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peak" => Ok(Band::Peak),
            "normal" => Ok(Band::Normal),
            "low" => Ok(Band::Low),
            other => Err(crate::Error::Validation(format!("Invalid band: {}", other))),
        }
    }
}

/// Lifecycle of a plan entry
///
/// Transitions are one-way: `Pending` -> one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanStatus::Pending)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Sent => write!(f, "sent"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlanStatus::Pending),
            "sent" => Ok(PlanStatus::Sent),
            "failed" => Ok(PlanStatus::Failed),
            "skipped" => Ok(PlanStatus::Skipped),
            other => Err(crate::Error::Validation(format!(
                "Invalid plan status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a spam event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamStatus {
    Detected,
    Recovered,
    Failed,
}

impl std::fmt::Display for SpamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpamStatus::Detected => write!(f, "detected"),
            SpamStatus::Recovered => write!(f, "recovered"),
            SpamStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SpamStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(SpamStatus::Detected),
            "recovered" => Ok(SpamStatus::Recovered),
            "failed" => Ok(SpamStatus::Failed),
            other => Err(crate::Error::Validation(format!(
                "Invalid spam status: {}",
                other
            ))),
        }
    }
}

/// OAuth credential bundle for a mailbox
///
/// The engine treats this as an opaque record: it is parsed at the
/// persistence edge, handed to the mail client, and written back whole
/// when the client refreshes it. Never logged.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OauthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OauthTokens {
    /// Parse a credential bundle from its stored JSON form
    pub fn from_value(value: &serde_json::Value) -> crate::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| crate::Error::Validation(format!("Invalid credential bundle: {}", e)))
    }

    /// Serialize the bundle for storage
    pub fn to_value(&self) -> crate::Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| crate::Error::Internal(format!("Credential serialization: {}", e)))
    }

    /// Whether the access token is expired (with a 60 second skew allowance)
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + Duration::seconds(60) >= expiry,
            None => false,
        }
    }
}

// Credentials must never leak into logs.
impl std::fmt::Debug for OauthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OauthTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip() {
        assert_eq!(Provider::Gmail.to_string(), "gmail");
        assert_eq!("gmail".parse::<Provider>().unwrap(), Provider::Gmail);
        assert!("hotmail".parse::<Provider>().is_err());
    }

    #[test]
    fn test_plan_status_terminal() {
        assert!(!PlanStatus::Pending.is_terminal());
        assert!(PlanStatus::Sent.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_oauth_tokens_round_trip() {
        let tokens = OauthTokens {
            access_token: "ya29.test".to_string(),
            refresh_token: "1//refresh".to_string(),
            expires_at: Some(Utc::now()),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["https://mail.google.com/".to_string()],
        };

        let value = tokens.to_value().unwrap();
        let parsed = OauthTokens::from_value(&value).unwrap();
        assert_eq!(parsed, tokens);
    }

    #[test]
    fn test_oauth_tokens_expiry() {
        let now = Utc::now();
        let fresh = OauthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Some(now + Duration::hours(1)),
            client_id: "c".into(),
            client_secret: "s".into(),
            scopes: vec![],
        };
        assert!(!fresh.is_expired(now));

        let stale = OauthTokens {
            expires_at: Some(now + Duration::seconds(30)),
            ..fresh.clone()
        };
        // Inside the skew allowance counts as expired.
        assert!(stale.is_expired(now));

        let unknown = OauthTokens {
            expires_at: None,
            ..fresh
        };
        assert!(!unknown.is_expired(now));
    }

    #[test]
    fn test_oauth_tokens_debug_redacts_secrets() {
        let tokens = OauthTokens {
            access_token: "super-secret-access".into(),
            refresh_token: "super-secret-refresh".into(),
            expires_at: None,
            client_id: "id".into(),
            client_secret: "super-secret-client".into(),
            scopes: vec![],
        };
        let rendered = format!("{:?}", tokens);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
