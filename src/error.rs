use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;

/// Type alias for Result with NylasError
pub type Result<T> = std::result::Result<T, NylasError>;

/// Error types for delta sync, webhook and tunnel operations
#[derive(Error, Debug)]
pub enum NylasError {
    /// The API returned an error we have no better classification for
    #[error("Nylas API error: {0}")]
    ApiError(String),

    /// Inbound webhook signature did not verify
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Caller supplied mutually exclusive or malformed arguments
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The server response violated the expected contract
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A single delta frame could not be parsed
    #[error("Malformed delta record: {0}")]
    MalformedRecord(String),

    /// A delta batch or notification body could not be parsed
    #[error("Malformed delta envelope: {0}")]
    MalformedEnvelope(String),

    /// Access token rejected (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Relay websocket failure
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl NylasError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NylasError::RateLimitExceeded { .. }
                | NylasError::ServerError { .. }
                | NylasError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Classify a non-success HTTP response.
    ///
    /// `body` is the raw response text; when it carries the API's
    /// `{"message": ..., "type": ...}` error shape the message is surfaced.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let status_code = status.as_u16();
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        let message = format!("HTTP {}: {}", status_code, detail);

        match status_code {
            429 => NylasError::RateLimitExceeded {
                retry_after: parse_retry_after_header(headers),
            },
            400 => NylasError::BadRequest(message),
            401 => NylasError::Unauthorized(message),
            403 => NylasError::Forbidden(message),
            404 => NylasError::NotFound(message),
            500..=599 => NylasError::ServerError {
                status: status_code,
                message,
            },
            _ => NylasError::ApiError(message),
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
fn parse_retry_after_header(headers: &HeaderMap) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|date| date.duration_since(std::time::SystemTime::now()).ok())
        .map(|d| d.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<reqwest::Error> for NylasError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return NylasError::from_response(status, &HeaderMap::new(), "");
        }
        if error.is_timeout() {
            return NylasError::NetworkError(format!("Request timed out: {}", error));
        }
        if error.is_connect() || error.is_request() || error.is_body() {
            return NylasError::NetworkError(format!("Connection error: {}", error));
        }
        if error.is_decode() {
            return NylasError::ProtocolError(format!("Undecodable response: {}", error));
        }
        NylasError::ApiError(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NylasError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        NylasError::TunnelError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_transient_errors() {
        let rate_limit = NylasError::RateLimitExceeded { retry_after: 5 };
        assert!(rate_limit.is_transient());
        assert!(!rate_limit.is_permanent());

        let server_error = NylasError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());

        let network_error = NylasError::NetworkError("Connection timeout".to_string());
        assert!(network_error.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NylasError::BadRequest("Invalid cursor".to_string()).is_permanent());
        assert!(NylasError::ProtocolError("missing cursor".to_string()).is_permanent());
        assert!(NylasError::AuthError("bad signature".to_string()).is_permanent());
        assert!(NylasError::ValidationError("both filters".to_string()).is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = NylasError::RateLimitExceeded { retry_after: 10 };
        let display = format!("{}", error);
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let auth_error = NylasError::AuthError("Signature verification failed!".to_string());
        assert!(auth_error.to_string().contains("Authentication failed"));
    }

    #[test]
    fn test_from_response_status_mapping() {
        let empty = HeaderMap::new();
        assert!(matches!(
            NylasError::from_response(StatusCode::BAD_REQUEST, &empty, ""),
            NylasError::BadRequest(_)
        ));
        assert!(matches!(
            NylasError::from_response(StatusCode::UNAUTHORIZED, &empty, ""),
            NylasError::Unauthorized(_)
        ));
        assert!(matches!(
            NylasError::from_response(StatusCode::NOT_FOUND, &empty, ""),
            NylasError::NotFound(_)
        ));
        assert!(matches!(
            NylasError::from_response(StatusCode::BAD_GATEWAY, &empty, ""),
            NylasError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            NylasError::from_response(StatusCode::IM_A_TEAPOT, &empty, ""),
            NylasError::ApiError(_)
        ));
    }

    #[test]
    fn test_from_response_uses_api_message() {
        let body = r#"{"message": "Invalid cursor", "type": "invalid_request_error"}"#;
        let error = NylasError::from_response(StatusCode::BAD_REQUEST, &HeaderMap::new(), body);
        assert_eq!(error.to_string(), "Bad request: HTTP 400: Invalid cursor");
    }

    #[test]
    fn test_parse_retry_after_header_integer() {
        assert_eq!(parse_retry_after_header(&headers_with_retry_after("120")), 120);
    }

    #[test]
    fn test_parse_retry_after_header_missing() {
        assert_eq!(parse_retry_after_header(&HeaderMap::new()), 5);
    }

    #[test]
    fn test_parse_retry_after_header_invalid() {
        assert_eq!(parse_retry_after_header(&headers_with_retry_after("invalid")), 5);
    }

    #[test]
    fn test_parse_retry_after_header_http_date() {
        let future_time = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let headers = headers_with_retry_after(&httpdate::fmt_http_date(future_time));

        let retry_after = parse_retry_after_header(&headers);
        assert!(
            (58..=61).contains(&retry_after),
            "Expected ~60, got {}",
            retry_after
        );
    }

    #[test]
    fn test_parse_retry_after_header_past_http_date() {
        let past_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let headers = headers_with_retry_after(&httpdate::fmt_http_date(past_time));
        assert_eq!(parse_retry_after_header(&headers), 5);
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let error = NylasError::from_response(
            StatusCode::TOO_MANY_REQUESTS,
            &headers_with_retry_after("30"),
            "",
        );
        assert!(matches!(error, NylasError::RateLimitExceeded { retry_after: 30 }));
    }
}
