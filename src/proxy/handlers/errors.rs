use crate::error::ProxyError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub fn invalid_request_response(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "message": message.into(),
            }
        })),
    )
        .into_response()
}

pub fn error_response(error: &ProxyError) -> Response {
    (
        error.status(),
        Json(json!({
            "type": "error",
            "error": {
                "type": error.error_type(),
                "message": error.to_string(),
                "code": error.code(),
            }
        })),
    )
        .into_response()
}

pub fn retry_exhausted_response(attempts: usize, last_error: &ProxyError) -> Response {
    (
        last_error.status(),
        Json(json!({
            "type": "error",
            "error": {
                "type": last_error.error_type(),
                "message": format!(
                    "All {} attempts failed. Last error: {}",
                    attempts, last_error
                ),
                "code": last_error.code(),
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_accounts_surfaces_as_503() {
        let response = error_response(&ProxyError::NoAccountsAvailable("empty fleet".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_surfaces_as_400() {
        let response = error_response(&ProxyError::Validation("bad".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn all_proxies_unavailable_surfaces_as_503() {
        let response = error_response(&ProxyError::AllProxiesUnavailable);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
