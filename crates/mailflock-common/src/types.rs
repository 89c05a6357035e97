//! Common types for Mailflock

use serde::{Deserialize, Serialize};

/// Identifier of the owning account. Every stored entity is scoped by it.
pub type UserId = i64;

/// Unique identifier for subscribers
pub type SubscriberId = i64;

/// Unique identifier for segments
pub type SegmentId = i64;

/// Unique identifier for campaigns
pub type CampaignId = i64;

/// Unique identifier for campaign event rows (opens, clicks, ...)
pub type EventId = i64;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string.
    ///
    /// Accepts exactly one `@`, a non-empty local part, and a domain with at
    /// least one inner dot. Whitespace anywhere is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        if s.chars().any(char::is_whitespace) {
            return None;
        }
        let (local, domain) = s.split_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return None;
        }
        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::invalid_field("email", "Invalid email address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
        assert!(EmailAddress::parse("user@localhost").is_none());
        assert!(EmailAddress::parse("us er@example.com").is_none());
        assert!(EmailAddress::parse("a@b@example.com").is_none());
    }

    #[test]
    fn test_email_address_from_str_error() {
        let err = "nope".parse::<EmailAddress>().unwrap_err();
        assert!(matches!(err, crate::Error::ValidationFailed(_)));
    }
}
