// Bearer-token verification. Token issuance is external; this layer only
// verifies HS256-signed tokens and hands handlers an explicit caller
// identity, so no code path reads ambient auth state.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Claims carried by the auth provider's tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: u64,
}

/// Verified identity of the caller, injected into request extensions by
/// the auth middleware and passed explicitly into every mutating service
/// call.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub uid: String,
    pub email: String,
}

#[derive(Clone)]
pub struct AuthVerifier {
    decoding_key: DecodingKey,
}

impl AuthVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify_token(&self, token: &str) -> AppResult<CallerIdentity> {
        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

        Ok(CallerIdentity {
            uid: token_data.claims.sub,
            email: token_data.claims.email,
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    let auth_header = headers
        .get("authorization")
        .ok_or_else(|| AppError::Unauthorized("Authorization header required".to_string()))?;
    let auth_str = auth_header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid authorization header".to_string()))?;
    auth_str
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization format".to_string()))
}

/// Middleware for protected routes: verifies the bearer token and injects
/// the CallerIdentity into request extensions for handlers.
pub async fn auth_middleware(
    State(verifier): State<AuthVerifier>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;
    let identity = verifier.verify_token(token)?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn sign(secret: &str, sub: &str, email: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: sub.to_string(),
            email: email.to_string(),
            exp: now + 3600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_round_trip() {
        let verifier = AuthVerifier::new("s3cret");
        let token = sign("s3cret", "u1", "u1@example.com");

        let identity = verifier.verify_token(&token).unwrap();
        assert_eq!(identity.uid, "u1");
        assert_eq!(identity.email, "u1@example.com");
    }

    #[test]
    fn test_reject_wrong_secret() {
        let verifier = AuthVerifier::new("s3cret");
        let token = sign("other", "u1", "u1@example.com");
        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc");

        let mut bad = HeaderMap::new();
        bad.insert("authorization", "Basic abc".parse().unwrap());
        assert!(bearer_token(&bad).is_err());
        assert!(bearer_token(&HeaderMap::new()).is_err());
    }
}
