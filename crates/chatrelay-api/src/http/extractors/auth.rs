//! API key authentication extractor.
//!
//! Extracts and verifies API keys from:
//! - `Authorization: Bearer <key>` header
//! - `X-API-Key: <key>` header
//! - `api_key=<key>` query parameter (WebSocket clients cannot set headers)
//!
//! Keys are resolved to the user id they were issued for.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::error::AppError;
use crate::state::AppState;

/// The user a request acts as. Extracting this validates the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let api_key = extract_api_key(parts)?;

        match state.api_keys.verify(&api_key).await? {
            Some(user_id) => Ok(AuthUser { user_id }),
            None => Err(AppError::Unauthorized(
                "Invalid API key. Provide a valid key via 'Authorization: Bearer <key>' or 'X-API-Key: <key>' header.".to_string(),
            )),
        }
    }
}

/// Extract the API key from request headers or the query string.
fn extract_api_key(parts: &Parts) -> Result<String, AppError> {
    if let Some(auth) = parts.headers.get("authorization") {
        let auth_str = auth.to_str().map_err(|_| {
            AppError::Unauthorized("Invalid Authorization header encoding".to_string())
        })?;
        if let Some(key) = auth_str.strip_prefix("Bearer ") {
            return Ok(key.trim().to_string());
        }
    }

    if let Some(key) = parts.headers.get("x-api-key") {
        let key_str = key.to_str().map_err(|_| {
            AppError::Unauthorized("Invalid X-API-Key header encoding".to_string())
        })?;
        return Ok(key_str.trim().to_string());
    }

    let from_query = parts
        .uri
        .query()
        .and_then(|query| query.split('&').find_map(|pair| pair.strip_prefix("api_key=")))
        .filter(|key| !key.is_empty());
    if let Some(key) = from_query {
        return Ok(key.to_string());
    }

    Err(AppError::Unauthorized(
        "Missing API key. Provide via 'Authorization: Bearer <key>' or 'X-API-Key: <key>' header.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_header() {
        let p = parts(Request::builder().header("Authorization", "Bearer crly_abc "));
        assert_eq!(extract_api_key(&p).unwrap(), "crly_abc");
    }

    #[test]
    fn test_x_api_key_header() {
        let p = parts(Request::builder().header("X-API-Key", "crly_def"));
        assert_eq!(extract_api_key(&p).unwrap(), "crly_def");
    }

    #[test]
    fn test_query_parameter() {
        let p = parts(Request::builder().uri("/api/v1/ws/sessions/x?foo=1&api_key=crly_ghi"));
        assert_eq!(extract_api_key(&p).unwrap(), "crly_ghi");
    }

    #[test]
    fn test_missing_key_is_unauthorized() {
        let p = parts(Request::builder().uri("/api/v1/sessions?api_key="));
        assert!(matches!(extract_api_key(&p), Err(AppError::Unauthorized(_))));
    }
}
