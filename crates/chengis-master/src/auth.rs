//! Shared-secret auth for master↔agent calls.

use axum::http::HeaderMap;

use crate::error::{ApiError, ApiResult};
use chengis_engine::client::AUTH_HEADER;

/// Validate the shared-secret header. With no token configured, agent
/// endpoints are open (development mode).
pub fn require_agent_token(headers: &HeaderMap, expected: Option<&str>) -> ApiResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == expected {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn open_when_no_token_configured() {
        assert!(require_agent_token(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        assert!(require_agent_token(&HeaderMap::new(), Some("s3cret")).is_err());
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_static("wrong"));
        assert!(require_agent_token(&headers, Some("s3cret")).is_err());
    }

    #[test]
    fn accepts_matching_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_static("s3cret"));
        assert!(require_agent_token(&headers, Some("s3cret")).is_ok());
    }
}
