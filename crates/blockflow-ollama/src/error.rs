//! Error types for blockflow-ollama.

use reqwest::StatusCode;
use thiserror::Error;

/// Error type for the blockflow-ollama library.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Ollama answered with a non-success status.
    #[error("Ollama API error ({status}): {message}")]
    Api { status: StatusCode, message: String },

    /// The response body did not have the expected shape.
    #[error("Unexpected response: {0}")]
    Decode(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an API error from a status and body.
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }
}

/// Result type alias for blockflow-ollama operations.
pub type Result<T> = std::result::Result<T, Error>;

fn kind_for_status(status: StatusCode) -> blockflow_core::ErrorKind {
    use blockflow_core::ErrorKind;

    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Authentication,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        s if s.is_server_error() => ErrorKind::ServiceUnavailable,
        s if s.is_client_error() => ErrorKind::InvalidInput,
        _ => ErrorKind::ExternalError,
    }
}

impl From<Error> for blockflow_core::Error {
    fn from(err: Error) -> Self {
        use blockflow_core::ErrorKind;

        let kind = match &err {
            Error::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Error::Http(e) if e.is_connect() || e.is_request() => ErrorKind::NetworkError,
            Error::Http(e) if e.is_decode() => ErrorKind::Serialization,
            Error::Http(e) => match e.status() {
                Some(status) => kind_for_status(status),
                None => ErrorKind::NetworkError,
            },
            Error::Api { status, .. } => kind_for_status(*status),
            Error::Decode(_) => ErrorKind::ExternalError,
            Error::Config(_) => ErrorKind::Configuration,
        };

        let message = err.to_string();
        blockflow_core::Error::new(kind)
            .with_message(message)
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use blockflow_core::ErrorKind;

    use super::*;

    fn core_kind(err: Error) -> ErrorKind {
        blockflow_core::Error::from(err).kind()
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        let err: blockflow_core::Error =
            Error::api_error(StatusCode::TOO_MANY_REQUESTS, "slow down").into();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.is_retryable());

        let err: blockflow_core::Error =
            Error::api_error(StatusCode::BAD_GATEWAY, "upstream").into();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(err.is_retryable());

        assert_eq!(
            core_kind(Error::api_error(StatusCode::GATEWAY_TIMEOUT, "")),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn client_errors_are_permanent() {
        let err: blockflow_core::Error =
            Error::api_error(StatusCode::NOT_FOUND, "model 'x' not found").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());

        assert_eq!(
            core_kind(Error::api_error(StatusCode::BAD_REQUEST, "bad")),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            core_kind(Error::Decode("missing field".into())),
            ErrorKind::ExternalError
        );
        assert_eq!(
            core_kind(Error::invalid_config("bad url")),
            ErrorKind::Configuration
        );
    }
}
