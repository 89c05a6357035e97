//! Unsubscribe tokens
//!
//! A token is the hex HMAC-SHA256 of the subscriber's decimal id under a
//! server secret. Nothing is stored: verification regenerates the signature
//! and compares it in constant time, so a link keeps working for as long as
//! the secret is unchanged.

use hmac::{Hmac, Mac};
use mailflock_common::config::UnsubscribeConfig;
use mailflock_common::types::{SubscriberId, UserId};
use mailflock_common::{Error, Result};
use mailflock_storage::{Subscriber, SubscriberRepository};
use sha2::Sha256;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Signs and checks unsubscribe tokens, and builds unsubscribe links
#[derive(Clone)]
pub struct UnsubscribeSigner {
    secret: String,
    app_url: String,
}

impl UnsubscribeSigner {
    pub fn new(config: &UnsubscribeConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            app_url: config.app_url.trim_end_matches('/').to_string(),
        }
    }

    fn mac(&self, subscriber_id: SubscriberId) -> Result<HmacSha256> {
        if subscriber_id == 0 {
            return Err(Error::InvalidState(
                "Unable to sign unsubscribe token: subscriber id is unset".to_string(),
            ));
        }
        if self.secret.is_empty() {
            return Err(Error::InvalidState(
                "Unable to sign unsubscribe token: secret is empty".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid HMAC key: {}", e)))?;
        mac.update(subscriber_id.to_string().as_bytes());
        Ok(mac)
    }

    /// Deterministic token for a subscriber id
    pub fn token(&self, subscriber_id: SubscriberId) -> Result<String> {
        Ok(hex::encode(self.mac(subscriber_id)?.finalize().into_bytes()))
    }

    /// Check a caller supplied token. Malformed tokens are simply not valid.
    pub fn verify(&self, subscriber_id: SubscriberId, token: &str) -> Result<bool> {
        let mac = self.mac(subscriber_id)?;
        match hex::decode(token) {
            Ok(signature) => Ok(mac.verify_slice(&signature).is_ok()),
            Err(_) => Ok(false),
        }
    }

    /// `{app_url}/unsubscribe.html?email=..&t=..&uuid=..`
    pub fn unsubscribe_url(&self, subscriber: &Subscriber, user_uuid: &str) -> Result<String> {
        let token = self.token(subscriber.id)?;
        let query = serde_urlencoded::to_string(vec![
            ("email", subscriber.email.as_str()),
            ("t", token.as_str()),
            ("uuid", user_uuid),
        ])
        .map_err(|e| Error::Internal(format!("Failed to encode unsubscribe link: {}", e)))?;

        Ok(format!("{}/unsubscribe.html?{}", self.app_url, query))
    }
}

/// Deactivate the subscriber behind a verified link.
///
/// Repeating the call with a valid token succeeds and leaves the subscriber
/// inactive. An unknown email and a bad token both fail the same way.
/// Returns whether this call is the one that deactivated the subscriber.
pub async fn unsubscribe(
    subscribers: &dyn SubscriberRepository,
    signer: &UnsubscribeSigner,
    user_id: UserId,
    email: &str,
    token: &str,
) -> Result<bool> {
    let rejected = || Error::invalid_field("t", "The unsubscribe link is invalid.");

    let subscriber = subscribers
        .get_by_email(user_id, email)
        .await?
        .ok_or_else(rejected)?;

    if !signer.verify(subscriber.id, token)? {
        debug!(user_id, subscriber_id = subscriber.id, "Unsubscribe token mismatch");
        return Err(rejected());
    }

    let changed = subscribers.deactivate(user_id, subscriber.id).await?;
    if changed {
        info!(user_id, subscriber_id = subscriber.id, "Subscriber unsubscribed");
    } else {
        debug!(user_id, subscriber_id = subscriber.id, "Subscriber already inactive");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflock_storage::{CreateSubscriber, MemoryStore};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn signer(secret: &str) -> UnsubscribeSigner {
        UnsubscribeSigner::new(&UnsubscribeConfig {
            secret: secret.to_string(),
            app_url: "https://app.example.com/".to_string(),
        })
    }

    #[test]
    fn test_token_is_deterministic() {
        let a = signer("s3cret");
        assert_eq!(a.token(42).unwrap(), a.token(42).unwrap());
        assert_eq!(a.token(42).unwrap().len(), 64);
        assert_ne!(a.token(42).unwrap(), a.token(43).unwrap());
        assert_ne!(a.token(42).unwrap(), signer("other").token(42).unwrap());
    }

    #[test]
    fn test_token_requires_id_and_secret() {
        assert!(matches!(signer("s3cret").token(0), Err(Error::InvalidState(_))));
        assert!(matches!(signer("").token(42), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_verify() {
        let s = signer("s3cret");
        let token = s.token(42).unwrap();
        assert!(s.verify(42, &token).unwrap());
        assert!(!s.verify(43, &token).unwrap());
        assert!(!s.verify(42, "not-hex").unwrap());
        assert!(!s.verify(42, &token[..10]).unwrap());
    }

    async fn john(store: &MemoryStore, email: &str) -> Subscriber {
        store
            .create(CreateSubscriber {
                user_id: 7,
                name: "John".to_string(),
                email: email.to_string(),
                metadata: BTreeMap::new(),
                segment_ids: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unsubscribe_url() {
        let store = MemoryStore::new();
        let s = signer("s3cret");
        let subscriber = john(&store, "john+news@example.com").await;

        let url = s.unsubscribe_url(&subscriber, "u-1").unwrap();
        assert_eq!(
            url,
            format!(
                "https://app.example.com/unsubscribe.html?email=john%2Bnews%40example.com&t={}&uuid=u-1",
                s.token(subscriber.id).unwrap()
            )
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let store = MemoryStore::new();
        let s = signer("s3cret");
        let sub = john(&store, "john@example.com").await;
        let token = s.token(sub.id).unwrap();

        assert!(unsubscribe(&store, &s, 7, "john@example.com", &token).await.unwrap());
        assert!(!unsubscribe(&store, &s, 7, "john@example.com", &token).await.unwrap());

        let sub = store.get(7, sub.id).await.unwrap().unwrap();
        assert!(!sub.active);

        assert!(matches!(
            unsubscribe(&store, &s, 7, "john@example.com", "deadbeef").await,
            Err(Error::ValidationFailed(_))
        ));
        assert!(matches!(
            unsubscribe(&store, &s, 8, "john@example.com", &token).await,
            Err(Error::ValidationFailed(_))
        ));
    }
}
