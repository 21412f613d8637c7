//! Errors surfaced to the chat user.

use std::time::Duration;

use axum::http::StatusCode;

/// Why a turn produced no answer. History is never modified on any of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("language model request failed: {0}")]
    Llm(String),

    #[error("turn timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("tool loop stopped after {0} iterations without a final answer")]
    MaxIterations(usize),

    #[error("another turn is still running in this session")]
    SessionBusy,
}

impl TurnError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyMessage => StatusCode::BAD_REQUEST,
            Self::SessionBusy => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Llm(_) | Self::MaxIterations(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable code for API clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::Llm(_) => "LLM_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::MaxIterations(_) => "MAX_ITERATIONS",
            Self::SessionBusy => "SESSION_BUSY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TurnError::EmptyMessage.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(TurnError::SessionBusy.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            TurnError::Timeout(Duration::from_secs(3)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TurnError::Llm("HTTP 500".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(TurnError::MaxIterations(10).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            TurnError::Timeout(Duration::from_secs(180)).to_string(),
            "turn timed out after 180s"
        );
        assert!(TurnError::Llm("quota".into()).to_string().contains("quota"));
    }
}
