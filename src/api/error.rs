use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("endpoint not found: {0}")]
    NotFound(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Response bodies longer than this are cut before they reach a log line
const BODY_SNIPPET_LEN: usize = 500;

impl ApiError {
    fn snippet(body: &str) -> String {
        if body.len() <= BODY_SNIPPET_LEN {
            body.to_string()
        } else {
            format!("{}... ({} bytes)", &body[..BODY_SNIPPET_LEN], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let snippet = Self::snippet(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(snippet),
            404 => ApiError::NotFound(snippet),
            500..=599 => ApiError::ServerError(snippet),
            _ => ApiError::InvalidResponse(format!("status {status}: {snippet}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_variants() {
        let err = ApiError::from_status(reqwest::StatusCode::NOT_FOUND, "no such endpoint");
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = ApiError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, ApiError::ServerError(_)));
    }

    #[test]
    fn long_bodies_are_cut() {
        let body = "x".repeat(2000);
        let err = ApiError::from_status(reqwest::StatusCode::BAD_GATEWAY, &body);
        let message = err.to_string();
        assert!(message.len() < 600);
    }
}
