// Tenant Identity: verifies bearer tokens and yields (userId, orgId, role).
// Shared by the Producer's HTTP extractor and the Realtime Hub's
// WebSocket auth-frame handshake — both call `JwtVerifier::verify`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Duration as ChronoDuration;
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    MissingToken,

    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("token lifetime exceeds the configured maximum")]
    LifetimeExceeded,
}

pub type Result<T> = std::result::Result<T, AuthError>;

impl From<AuthError> for crucible_common::CoreError {
    fn from(err: AuthError) -> Self {
        crucible_common::CoreError::Auth(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// The JWT payload from §6: `{userId, organizationId, role, iat, exp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub organization_id: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies bearer tokens against a fixed issuer/audience/signing key and
/// a maximum token lifetime, independent of the `exp` claim itself.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    max_ttl: ChronoDuration,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str, max_ttl: ChronoDuration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            max_ttl,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data: TokenData<Claims> =
            jsonwebtoken::decode(token, &self.decoding_key, &self.validation)
                .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let lifetime = data.claims.exp - data.claims.iat;
        if lifetime > self.max_ttl.num_seconds() {
            return Err(AuthError::LifetimeExceeded);
        }

        Ok(data.claims)
    }
}

/// axum extractor pulling a verified [`Claims`] out of the `Authorization:
/// Bearer` header. Handlers depend on this rather than re-parsing tokens.
pub struct AuthenticatedUser(pub Claims);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    JwtVerifier: axum::extract::FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let verifier = JwtVerifier::from_ref(state);
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MissingToken)?;
        let claims = verifier.verify(token)?;
        Ok(AuthenticatedUser(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes()))
            .unwrap()
    }

    fn base_claims(iat: i64, exp: i64) -> Claims {
        Claims {
            user_id: "user-1".to_string(),
            organization_id: "org-a".to_string(),
            role: "member".to_string(),
            iat,
            exp,
        }
    }

    #[test]
    fn accepts_a_well_formed_token() {
        let verifier = JwtVerifier::new(
            "test-secret",
            "crucible",
            "crucible-dashboard",
            ChronoDuration::hours(24),
        );
        let now = chrono::Utc::now().timestamp();
        let mut claims = base_claims(now, now + 3600);
        claims.exp = now + 3600;
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &TestClaims { iss: "crucible", aud: "crucible-dashboard", claims: claims.clone() },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.organization_id, "org-a");
    }

    #[test]
    fn rejects_a_token_signed_with_the_wrong_secret() {
        let verifier = JwtVerifier::new(
            "test-secret",
            "crucible",
            "crucible-dashboard",
            ChronoDuration::hours(24),
        );
        let now = chrono::Utc::now().timestamp();
        let claims = base_claims(now, now + 3600);
        let token = sign(&claims, "wrong-secret");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_a_token_whose_lifetime_exceeds_the_max_ttl() {
        let verifier = JwtVerifier::new(
            "test-secret",
            "crucible",
            "crucible-dashboard",
            ChronoDuration::hours(24),
        );
        let now = chrono::Utc::now().timestamp();
        let mut claims = base_claims(now, now + ChronoDuration::hours(48).num_seconds());
        claims.exp = now + ChronoDuration::hours(48).num_seconds();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &TestClaims { iss: "crucible", aud: "crucible-dashboard", claims },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::LifetimeExceeded)
        ));
    }

    /// jsonwebtoken validates `iss`/`aud` as top-level claims, so tests
    /// sign a wrapper struct that flattens `Claims` alongside them.
    #[derive(Serialize)]
    struct TestClaims<'a> {
        iss: &'a str,
        aud: &'a str,
        #[serde(flatten)]
        claims: Claims,
    }
}
