use thiserror::Error;

/// Failures surfaced by the backend client.
///
/// Callers that need to tell a duplicate apart from a real failure match on
/// [`ApiError::Conflict`]; everything else is logged and retried by the queue.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decoding(String),

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("authentication unavailable: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }

    /// HTTP status carried by the error, if the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status } | ApiError::Server { status, .. } => Some(*status),
            ApiError::Conflict(_) => Some(409),
            ApiError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the resource is already gone on the backend.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decoding(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decoding(err.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Maps a non-success response to the taxonomy.
///
/// Bodies may be `{"error": "..."}` or RFC 9457 problem+json (`detail`, then
/// `title`). A 409, or a structured message mentioning a duplicate or unique
/// violation, is a conflict.
pub fn classify_error_response(status: u16, body: &str) -> ApiError {
    let message = structured_message(body);

    if status == 409 {
        return ApiError::Conflict(message.unwrap_or_else(|| "already exists".to_string()));
    }

    match message {
        Some(message) => {
            let lowered = message.to_lowercase();
            if lowered.contains("duplicate") || lowered.contains("unique") {
                ApiError::Conflict(message)
            } else {
                ApiError::Server { status, message }
            }
        }
        None => ApiError::HttpStatus { status },
    }
}

fn structured_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error", "detail", "title", "message"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| v.as_str().map(str::to_string))
        .filter(|m| !m.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_is_server_error() {
        let err = classify_error_response(400, r#"{"error": "name is required"}"#);
        match err {
            ApiError::Server { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "name is required");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_problem_json_prefers_detail() {
        let body = r#"{"type":"about:blank","title":"Bad Request","status":400,"detail":"timestamp is invalid"}"#;
        match classify_error_response(400, body) {
            ApiError::Server { message, .. } => assert_eq!(message, "timestamp is invalid"),
            other => panic!("unexpected {:?}", other),
        }

        let title_only = r#"{"title":"Forbidden","status":403}"#;
        match classify_error_response(403, title_only) {
            ApiError::Server { message, .. } => assert_eq!(message, "Forbidden"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_messages_are_conflicts() {
        assert!(classify_error_response(409, "").is_conflict());
        assert!(classify_error_response(
            500,
            r#"{"error":"duplicate key value violates unique constraint"}"#
        )
        .is_conflict());
        assert!(classify_error_response(422, r#"{"detail":"Unique violation on name"}"#)
            .is_conflict());
    }

    #[test]
    fn test_unstructured_body_keeps_status() {
        let err = classify_error_response(502, "<html>Bad Gateway</html>");
        assert!(matches!(err, ApiError::HttpStatus { status: 502 }));
        assert!(classify_error_response(404, "").is_not_found());
    }
}
