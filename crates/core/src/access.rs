//! Stream-scoped access tokens.
//!
//! Tokens are HS256 JWTs whose subject is the stream key and whose `sid`
//! claim names the stream instance they were issued for. Verification is
//! stateless (signature, expiry and subject). The fan-out checks the instance
//! when the token is used, so a token outlives neither its stream nor a
//! recreation of the same key.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{Result, StreamError},
    registry::StreamRegistry,
};

/// Minimum signing secret length, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Longest token lifetime honoured.
const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 3600;

/// Token verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("token is scoped to another stream")]
    WrongStream,

    #[error("token belongs to a previous stream with this key")]
    StaleToken,

    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    InvalidSecret,
}

/// JWT claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Stream key
    pub sub: String,
    /// Stream instance
    pub sid: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiration (Unix seconds)
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

/// A token and the URLs to subscribe with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub key: String,
    pub token: String,
    pub sse_url: Url,
    pub ws_url: Url,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies access tokens.
pub struct AccessIssuer {
    registry: Arc<StreamRegistry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    header: Header,
    validation: Validation,
    public_url: Url,
    token_ttl: TimeDelta,
}

impl AccessIssuer {
    pub fn new(
        registry: Arc<StreamRegistry>,
        secret: &str,
        public_url: Url,
        token_ttl: Duration,
    ) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::InvalidSecret.into());
        }
        if !matches!(public_url.scheme(), "http" | "https") || public_url.cannot_be_a_base() {
            return Err(StreamError::Validation(format!(
                "public url must be an http(s) base url: {public_url}"
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            registry,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            header: Header::new(Algorithm::HS256),
            validation,
            public_url,
            token_ttl: TimeDelta::seconds(token_ttl.as_secs().min(MAX_TOKEN_TTL_SECS) as i64),
        })
    }

    /// Issue a grant for an active stream.
    pub async fn issue(&self, key: &str) -> Result<AccessGrant> {
        let instance = self.registry.active_instance(key).await?;
        let grant = self.mint(key, instance)?;
        info!(key = %key, expires_at = %grant.expires_at, "Issued access token");
        Ok(grant)
    }

    /// Build a grant for a known stream instance without checking the
    /// registry.
    pub fn mint(&self, key: &str, instance: Uuid) -> Result<AccessGrant> {
        let now = Utc::now();
        let expires_at = now + self.token_ttl;
        let claims = AccessClaims {
            sub: key.to_string(),
            sid: instance.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&self.header, &claims, &self.encoding_key)
            .map_err(|e| StreamError::Internal(format!("failed to sign token: {e}")))?;

        Ok(AccessGrant {
            key: key.to_string(),
            token,
            sse_url: self.subscription_url(key, "sse", false)?,
            ws_url: self.subscription_url(key, "ws", true)?,
            expires_at,
        })
    }

    /// Check the token's signature, expiry and scope.
    pub fn verify(&self, token: &str, key: &str) -> Result<AccessClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken,
            },
        )?;

        if data.claims.sub != key {
            debug!(key = %key, scope = %data.claims.sub, "Token presented for another stream");
            return Err(AuthError::WrongStream);
        }
        Ok(data.claims)
    }

    fn subscription_url(&self, key: &str, transport: &str, socket: bool) -> Result<Url> {
        let invalid = || StreamError::Validation(format!("cannot build url from {}", self.public_url));

        let mut url = self.public_url.clone();
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(["api", "client", transport]);
        url.query_pairs_mut().clear().append_pair("key", key);
        url.set_fragment(None);

        if socket {
            let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
            url.set_scheme(scheme).map_err(|_| invalid())?;
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::MemoryBackend,
        config::ServiceConfig,
        pool::{ConnectionPool, PoolConfig},
    };

    const SECRET: &str = "access-test-secret-0123456789";

    fn issuer(public_url: &str) -> AccessIssuer {
        let config = ServiceConfig::new(SECRET, public_url.parse().unwrap());
        let pool = ConnectionPool::new(Arc::new(MemoryBackend::new()), PoolConfig::default());
        let registry = Arc::new(StreamRegistry::new(Arc::new(pool), &config));
        AccessIssuer::new(
            registry,
            SECRET,
            config.public_url.clone(),
            Duration::from_secs(600),
        )
        .unwrap()
    }

    #[test]
    fn test_mint_and_verify() {
        let issuer = issuer("http://localhost:4437");
        let grant = issuer.mint("orders", Uuid::nil()).unwrap();

        let claims = issuer.verify(&grant.token, "orders").unwrap();
        assert_eq!(claims.sub, "orders");
        assert_eq!(claims.sid, Uuid::nil().to_string());
        assert_eq!(claims.exp - claims.iat, 600);
        assert!(Uuid::parse_str(&claims.jti).is_ok());
    }

    #[test]
    fn test_verify_failures() {
        let issuer = issuer("http://localhost:4437");
        let grant = issuer.mint("a", Uuid::nil()).unwrap();

        assert_eq!(issuer.verify(&grant.token, "b"), Err(AuthError::WrongStream));
        assert_eq!(issuer.verify("", "a"), Err(AuthError::MissingToken));
        assert_eq!(issuer.verify("not.a.jwt", "a"), Err(AuthError::InvalidToken));

        let mut tampered = grant.token.clone();
        tampered.push('x');
        assert_eq!(issuer.verify(&tampered, "a"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_expired_token() {
        let issuer = issuer("http://localhost:4437");
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: "a".to_string(),
            sid: Uuid::nil().to_string(),
            iat: now - 120,
            exp: now - 60,
            jti: "old".to_string(),
        };
        let token = encode(&issuer.header, &claims, &issuer.encoding_key).unwrap();

        assert_eq!(issuer.verify(&token, "a"), Err(AuthError::ExpiredToken));
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let issuer = issuer("http://localhost:4437");
        let other = AccessIssuer::new(
            Arc::clone(&issuer.registry),
            "a-completely-different-secret",
            issuer.public_url.clone(),
            Duration::from_secs(600),
        )
        .unwrap();

        let grant = other.mint("a", Uuid::nil()).unwrap();
        assert_eq!(issuer.verify(&grant.token, "a"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_subscription_urls() {
        let issuer = issuer("https://streams.example.com/tide/");
        let grant = issuer.mint("orders/eu 1", Uuid::nil()).unwrap();

        assert_eq!(
            grant.sse_url.as_str(),
            "https://streams.example.com/tide/api/client/sse?key=orders%2Feu+1"
        );
        assert_eq!(
            grant.ws_url.as_str(),
            "wss://streams.example.com/tide/api/client/ws?key=orders%2Feu+1"
        );

        let plain = self::issuer("http://localhost:4437").mint("s", Uuid::nil()).unwrap();
        assert_eq!(
            plain.ws_url.as_str(),
            "ws://localhost:4437/api/client/ws?key=s"
        );
    }

    #[test]
    fn test_short_secret_rejected() {
        let issuer = issuer("http://localhost:4437");
        let result = AccessIssuer::new(
            Arc::clone(&issuer.registry),
            "short",
            issuer.public_url.clone(),
            Duration::from_secs(600),
        );
        assert!(matches!(
            result,
            Err(StreamError::Unauthorized(AuthError::InvalidSecret))
        ));
    }

    #[tokio::test]
    async fn test_issue_requires_active_stream() {
        let issuer = issuer("http://localhost:4437");
        assert!(matches!(
            issuer.issue("s").await,
            Err(StreamError::NotFound(_))
        ));

        let info = issuer.registry.create("s", None).await.unwrap();
        let grant = issuer.issue("s").await.unwrap();
        let claims = issuer.verify(&grant.token, "s").unwrap();
        assert_eq!(claims.sid, info.instance.to_string());

        issuer.registry.end("s", false).await.unwrap();
        assert!(matches!(
            issuer.issue("s").await,
            Err(StreamError::StreamClosed { .. })
        ));
    }
}
