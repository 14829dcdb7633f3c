//! Bearer token (JWT, HS256) issue and verification.
//!
//! Tokens are minted by the identity collaborator with a secret shared by every
//! gateway and service. The user id is read from the `user_id` claim, falling
//! back to the standard `sub` claim.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_config::AuthConfig;
use parley_events::UserId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token does not identify a user")]
    MissingSubject,

    #[error("token creation failed: {0}")]
    TokenCreationFailed(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    pub fn subject(&self) -> AuthResult<UserId> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|id| !id.is_empty())
            .map(UserId::from)
            .ok_or(AuthError::MissingSubject)
    }
}

/// JWT token manager
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: Option<String>,
    audience: Option<String>,
    token_duration: Duration,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            issuer: None,
            audience: None,
            token_duration: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut manager = Self::new(&config.jwt_secret)
            .with_duration(Duration::from_secs(config.token_ttl_seconds));
        manager.issuer = config.issuer.clone();
        manager.audience = config.audience.clone();
        manager
    }

    /// Set custom token duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.token_duration = duration;
        self
    }

    pub fn issue(&self, user_id: &UserId) -> AuthResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::TokenCreationFailed("system time error".to_string()))?;
        self.issue_at(user_id, now.as_secs(), (now + self.token_duration).as_secs())
    }

    fn issue_at(&self, user_id: &UserId, iat: u64, exp: u64) -> AuthResult<String> {
        let claims = Claims {
            sub: Some(user_id.to_string()),
            user_id: None,
            exp,
            iat,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Some(uuid::Uuid::new_v4().to_string()),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|error| AuthError::TokenCreationFailed(error.to_string()))
    }

    /// Check signature and expiry, then extract the user id.
    pub fn verify(&self, token: &str) -> AuthResult<UserId> {
        self.validate_token(token)?.subject()
    }

    pub fn validate_token(&self, token: &str) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // A configured `iss`/`aud` is only checked when present unless it is also required.
        let mut required = vec!["exp"];
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
            required.push("iss");
        }
        match &self.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                required.push("aud");
            }
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&required);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|error| match error.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(error.to_string()),
            })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// ```
/// use parley_auth::bearer_token;
///
/// assert_eq!(bearer_token(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
/// assert!(bearer_token(None).is_err());
/// assert!(bearer_token(Some("Basic dXNlcg==")).is_err());
/// ```
pub fn bearer_token(header: Option<&str>) -> AuthResult<&str> {
    let value = header.ok_or(AuthError::MissingCredential)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::MalformedHeader)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("test_secret_key_that_is_long_enough_for_hs256")
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn issued_token_verifies_to_the_same_user() {
        let manager = manager();
        let token = manager.issue(&UserId::from("alice")).unwrap();

        assert_eq!(manager.verify(&token).unwrap(), UserId::from("alice"));
    }

    #[test]
    fn token_signed_with_another_secret_is_rejected() {
        let token = JwtManager::new("other-secret").issue(&UserId::from("alice")).unwrap();
        assert!(matches!(manager().verify(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let manager = manager();
        let token = manager
            .issue_at(&UserId::from("alice"), now() - 7_200, now() - 3_600)
            .unwrap();

        assert!(matches!(manager.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(manager().verify("invalid.jwt.token").is_err());
    }

    #[test]
    fn user_id_claim_takes_precedence_over_subject() {
        let manager = manager();
        let claims = Claims {
            sub: Some("account-7".into()),
            user_id: Some("user-7".into()),
            exp: now() + 600,
            iat: now(),
            iss: None,
            aud: None,
            jti: None,
        };
        let token = encode(&Header::default(), &claims, &manager.encoding_key).unwrap();

        assert_eq!(manager.verify(&token).unwrap(), UserId::from("user-7"));
    }

    #[test]
    fn token_without_any_subject_is_rejected() {
        let manager = manager();
        let claims = Claims {
            sub: None,
            user_id: None,
            exp: now() + 600,
            iat: now(),
            iss: None,
            aud: None,
            jti: None,
        };
        let token = encode(&Header::default(), &claims, &manager.encoding_key).unwrap();

        assert!(matches!(manager.verify(&token), Err(AuthError::MissingSubject)));
    }

    #[test]
    fn configured_audience_is_enforced() {
        let config = AuthConfig {
            audience: Some("parley".into()),
            ..AuthConfig::default()
        };
        let strict = JwtManager::from_config(&config);
        let loose = JwtManager::new(&config.jwt_secret);

        let token = loose.issue(&UserId::from("alice")).unwrap();
        assert!(strict.verify(&token).is_err());

        let token = strict.issue(&UserId::from("alice")).unwrap();
        assert_eq!(strict.verify(&token).unwrap(), UserId::from("alice"));
    }

    #[test]
    fn configured_issuer_is_enforced() {
        let config = AuthConfig {
            issuer: Some("parley-identity".into()),
            ..AuthConfig::default()
        };
        let strict = JwtManager::from_config(&config);
        let other = JwtManager::from_config(&AuthConfig {
            issuer: Some("someone-else".into()),
            ..config.clone()
        });

        let token = other.issue(&UserId::from("alice")).unwrap();
        assert!(matches!(strict.verify(&token), Err(AuthError::InvalidToken(_))));

        let token = strict.issue(&UserId::from("alice")).unwrap();
        assert_eq!(strict.verify(&token).unwrap(), UserId::from("alice"));
    }

    #[test]
    fn token_lacking_a_configured_issuer_or_audience_is_rejected() {
        let config = AuthConfig {
            issuer: Some("parley-identity".into()),
            audience: Some("parley".into()),
            ..AuthConfig::default()
        };
        let strict = JwtManager::from_config(&config);
        let claims = |iss: Option<&str>, aud: Option<&str>| Claims {
            sub: Some("alice".into()),
            user_id: None,
            exp: now() + 600,
            iat: now(),
            iss: iss.map(String::from),
            aud: aud.map(String::from),
            jti: None,
        };

        for (iss, aud) in [
            (None, Some("parley")),
            (Some("parley-identity"), None),
            (None, None),
        ] {
            let token =
                encode(&Header::default(), &claims(iss, aud), &strict.encoding_key).unwrap();
            assert!(
                matches!(strict.verify(&token), Err(AuthError::InvalidToken(_))),
                "iss={iss:?} aud={aud:?} accepted"
            );
        }

        let token = encode(
            &Header::default(),
            &claims(Some("parley-identity"), Some("parley")),
            &strict.encoding_key,
        )
        .unwrap();
        assert_eq!(strict.verify(&token).unwrap(), UserId::from("alice"));
    }

    #[test]
    fn bearer_token_requires_the_bearer_scheme() {
        assert_eq!(bearer_token(Some("Bearer tok")).unwrap(), "tok");
        assert!(matches!(bearer_token(Some("tok")), Err(AuthError::MalformedHeader)));
        assert!(matches!(bearer_token(Some("Bearer   ")), Err(AuthError::MissingCredential)));
    }
}
