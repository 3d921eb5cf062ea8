use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::{
    Filter, Rejection,
    filters::header::headers_cloned,
    http::header::{self, HeaderMap},
};

use crate::error::Error;

pub const TOKEN_ISSUER: &str = "tubely-access";

/// Struct encoded in the JWT that contains its expiry and subject user.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: usize,
    exp: usize,
    sub: String,
}

/// Warp filter for requests that require an authenticated caller, extracting the caller's user ID
/// from the bearer token.
pub fn with_user_id() -> impl Filter<Extract = (Uuid,), Error = Rejection> + Clone {
    headers_cloned().and_then(require_user_id_from_auth_header)
}

async fn require_user_id_from_auth_header(header_map: HeaderMap) -> Result<Uuid, Rejection> {
    let jwt_token = get_bearer_token(&header_map)?;
    validate_jwt(jwt_token, &crate::JWT_SECRET).map_err(warp::reject::custom)
}

fn get_bearer_token(header_map: &HeaderMap) -> Result<&str, Error> {
    const JWT_BEARER_PREFIX: &str = "Bearer ";
    let auth_header = match header_map.get(header::AUTHORIZATION) {
        Some(h) => std::str::from_utf8(h.as_bytes()).map_err(|_| Error::UtfEncodingError)?,
        None => return Err(Error::MissingAuthHeaderError),
    };

    match auth_header.strip_prefix(JWT_BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(Error::InvalidAuthHeaderError),
    }
}

/// Validates the signature, expiry and issuer of the token and returns the user ID in its subject.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Uuid, Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);

    // fails if expired
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| Error::InvalidJwtError)?;

    Uuid::parse_str(&token_data.claims.sub).map_err(|_| Error::InvalidJwtError)
}

#[cfg(test)]
pub fn issue_test_token(user_id: Uuid, secret: &str, expires_in: chrono::Duration) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let now = chrono::Utc::now();
    let claims = Claims {
        iss: String::from(TOKEN_ISSUER),
        iat: now.timestamp() as usize,
        exp: (now + expires_in).timestamp() as usize,
        sub: user_id.to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to encode test token")
}
