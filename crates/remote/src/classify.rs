//! Failure classification for remote HTTP responses
//!
//! Distinguishes "log in again" from "try again later" from "the service is
//! down for maintenance". Maintenance is reported by status 503 or by a known
//! phrase in any 5xx body; the owning process turns it into its own
//! termination reason.

use crate::{ErrorClassification, RemoteError};

/// Body fragments marking an OAuth "bad request / invalid token" answer.
///
/// The token endpoint answers a revoked refresh token with 400, not 401, so
/// the body is the only way to tell it from a malformed request.
const INVALID_TOKEN_PATTERNS: &[&str] = &["invalid_grant", "invalid_token", "unauthorized_client"];

/// Body fragments the remote service uses while under maintenance.
const MAINTENANCE_PATTERNS: &[&str] = &[
    "maintenance",
    "temporarily unavailable",
    "service unavailable",
];

/// Longest body excerpt carried in an error message.
const BODY_EXCERPT_LEN: usize = 256;

fn contains_any(body: &str, patterns: &[&str]) -> bool {
    let lower = body.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify a non-success response by HTTP status and body.
///
/// 400 with an OAuth token error and 401/403 are Authentication; 503 and
/// maintenance bodies are Unavailable; 408/429/5xx are Transient; other 4xx
/// are Permanent.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        400 if contains_any(body, INVALID_TOKEN_PATTERNS) => ErrorClassification::Authentication,
        401 | 403 => ErrorClassification::Authentication,
        503 => ErrorClassification::Unavailable,
        500..=599 if contains_any(body, MAINTENANCE_PATTERNS) => ErrorClassification::Unavailable,
        408 | 429 | 500..=599 => ErrorClassification::Transient,
        400..=499 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}

/// Classify a transport-level failure (no response was received).
///
/// Timeouts and connection failures are Transient; a response that could
/// not be decoded is Permanent (retrying returns the same bytes).
pub fn classify_transport(err: &reqwest::Error) -> ErrorClassification {
    if err.is_decode() || err.is_builder() {
        ErrorClassification::Permanent
    } else {
        ErrorClassification::Transient
    }
}

/// Turn a non-success response into a classified `RemoteError`.
///
/// `context` names the operation for the error message (e.g. "token refresh").
pub async fn error_for_response(context: &str, response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    let classification = classify_status(status.as_u16(), &body);
    let excerpt: String = body.chars().take(BODY_EXCERPT_LEN).collect();
    tracing::debug!(context, status = status.as_u16(), %classification, "remote call rejected");
    RemoteError::new(
        classification,
        format!("{context} returned {status}: {excerpt}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_with_invalid_grant_is_authentication() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid refresh token"}"#;
        assert_eq!(
            classify_status(400, body),
            ErrorClassification::Authentication
        );
    }

    #[test]
    fn bad_request_with_invalid_token_is_authentication() {
        let body = r#"{"error":"INVALID_TOKEN"}"#;
        assert_eq!(
            classify_status(400, body),
            ErrorClassification::Authentication
        );
    }

    #[test]
    fn plain_bad_request_is_permanent() {
        let body = r#"{"error":"invalid_request","error_description":"missing field"}"#;
        assert_eq!(classify_status(400, body), ErrorClassification::Permanent);
    }

    #[test]
    fn unauthorized_and_forbidden_are_authentication() {
        assert_eq!(
            classify_status(401, "unauthorized"),
            ErrorClassification::Authentication
        );
        assert_eq!(
            classify_status(403, "forbidden"),
            ErrorClassification::Authentication
        );
    }

    #[test]
    fn service_unavailable_is_unavailable() {
        assert_eq!(classify_status(503, ""), ErrorClassification::Unavailable);
    }

    #[test]
    fn maintenance_body_on_5xx_is_unavailable() {
        let body = r#"{"error":"Scheduled MAINTENANCE in progress"}"#;
        assert_eq!(classify_status(500, body), ErrorClassification::Unavailable);
        assert_eq!(classify_status(502, body), ErrorClassification::Unavailable);
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 504] {
            assert_eq!(
                classify_status(status, "internal error"),
                ErrorClassification::Transient,
                "status {status}"
            );
        }
    }

    #[test]
    fn timeout_and_rate_limit_are_transient() {
        assert_eq!(classify_status(408, ""), ErrorClassification::Transient);
        assert_eq!(classify_status(429, ""), ErrorClassification::Transient);
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert_eq!(classify_status(404, "not found"), ErrorClassification::Permanent);
        assert_eq!(classify_status(422, ""), ErrorClassification::Permanent);
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        assert_eq!(classify_transport(&err), ErrorClassification::Transient);
    }
}
