use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_db::Database;
use murmur_db::models::RotateOutcome;

use crate::error::TokenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
}

/// Issues, verifies and rotates session tokens.
///
/// Access tokens are stateless. Every refresh token has a record in the
/// store keyed by its `jti`, and each record can be rotated exactly once.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    db: Arc<Database>,
}

impl TokenService {
    pub fn new(
        secret: &str,
        issuer: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
        db: Arc<Database>,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            access_ttl,
            refresh_ttl,
            db,
        }
    }

    pub fn issue_access_token(&self, subject: Uuid) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject,
            token_type: TokenType::Access,
            jti: None,
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            iss: None,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Returns the token and its `jti`. The backing record is written first.
    pub fn issue_refresh_token(&self, subject: Uuid) -> Result<(String, String), TokenError> {
        let jti = Uuid::new_v4().to_string();
        let issued = Utc::now();
        let expires = issued + self.refresh_ttl;

        self.db
            .insert_refresh_token(&jti, subject, expires)
            .map_err(TokenError::Store)?;

        let token = self.encode_refresh(subject, &jti, issued, expires)?;
        Ok((token, jti))
    }

    pub fn issue_pair(&self, subject: Uuid) -> Result<TokenPair, TokenError> {
        let (refresh_token, _) = self.issue_refresh_token(subject)?;
        Ok(TokenPair {
            user_id: subject,
            access_token: self.issue_access_token(subject)?,
            refresh_token,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<Uuid, TokenError> {
        let claims = self.decode(token, TokenType::Access)?;
        Ok(claims.sub)
    }

    /// Signature, expiry, type and issuer. Does not consult the store.
    pub fn verify_refresh(&self, token: &str) -> Result<(Uuid, String), TokenError> {
        let claims = self.decode(token, TokenType::Refresh)?;
        let jti = claims.jti.ok_or(TokenError::InvalidToken)?;
        Ok((claims.sub, jti))
    }

    /// Exchanges a refresh token for a new pair.
    ///
    /// Presenting a token whose record was already rotated (or revoked)
    /// revokes every refresh record the owner holds and fails with
    /// `ReuseDetected`. Concurrent rotations of one token resolve the same
    /// way for every caller but the first.
    pub fn rotate_refresh_token(&self, token: &str) -> Result<TokenPair, TokenError> {
        let (subject, jti) = self.verify_refresh(token)?;

        let successor = Uuid::new_v4().to_string();
        let issued = Utc::now();
        let expires = issued + self.refresh_ttl;

        let outcome = self
            .db
            .rotate_refresh_token(&jti, &successor, expires)
            .map_err(TokenError::Store)?;

        match outcome {
            RotateOutcome::Rotated { user_id } => {
                if user_id != subject {
                    warn!("Refresh record {} belongs to {}, token names {}", jti, user_id, subject);
                }
                debug!("Rotated refresh token for {}", user_id);
                Ok(TokenPair {
                    user_id,
                    access_token: self.issue_access_token(user_id)?,
                    refresh_token: self.encode_refresh(user_id, &successor, issued, expires)?,
                })
            }
            RotateOutcome::Unknown => Err(TokenError::UnknownToken),
            RotateOutcome::Reused { user_id } => {
                warn!("Refresh token reuse for user {}; all sessions revoked", user_id);
                Err(TokenError::ReuseDetected)
            }
        }
    }

    /// Revokes every refresh record of `subject`.
    pub fn revoke(&self, subject: Uuid) -> Result<usize, TokenError> {
        self.db.revoke_refresh_tokens(subject).map_err(TokenError::Store)
    }

    fn encode_refresh(
        &self,
        subject: Uuid,
        jti: &str,
        issued: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            sub: subject,
            token_type: TokenType::Refresh,
            jti: Some(jti.to_string()),
            iat: issued.timestamp(),
            exp: expires.timestamp(),
            iss: Some(self.issuer.clone()),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    fn decode(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match expected {
            TokenType::Access => validation.set_required_spec_claims(&["exp", "sub"]),
            TokenType::Refresh => {
                validation.set_required_spec_claims(&["exp", "sub", "iss"]);
                validation.set_issuer(&[self.issuer.as_str()]);
            }
        }

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::ExpiredToken,
            _ => TokenError::InvalidToken,
        })?;

        if data.claims.token_type != expected {
            return Err(TokenError::InvalidToken);
        }
        Ok(data.claims)
    }
}
