//! Error types for catalog providers

use bridge_traits::error::BridgeError;
use bridge_traits::source::FetchError;
use std::time::Duration;
use thiserror::Error;

/// Catalog provider errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Remote answered with a status that is not retried
    #[error("Catalog API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// Remote reported 404 for the requested resource
    #[error("Resource not found: {url}")]
    NotFound { url: String },

    /// Remote throttled us and retries ran out
    #[error("Rate limited by catalog")]
    RateLimited { retry_after: Option<Duration> },

    /// Response body could not be understood
    #[error("Failed to parse catalog response: {0}")]
    ParseError(String),

    /// Transport failure after all retries
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid provider configuration (bad URL template, bad rule)
    #[error("Invalid catalog configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

impl From<CatalogError> for FetchError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::NotFound { url } => FetchError::NotFound(url),
            CatalogError::RateLimited { retry_after } => FetchError::RateLimited { retry_after },
            CatalogError::ParseError(msg) => FetchError::ParseFailure(msg),
            CatalogError::NetworkError(msg) => FetchError::Network(msg),
            CatalogError::ApiError {
                status_code,
                message,
            } if (500..600).contains(&status_code) => {
                FetchError::Network(format!("server error {}: {}", status_code, message))
            }
            CatalogError::ApiError {
                status_code,
                message,
            } => FetchError::Unknown(format!("status {}: {}", status_code, message)),
            CatalogError::InvalidConfig(msg) => FetchError::Unknown(msg),
            CatalogError::BridgeError(err) if err.is_transport() => {
                FetchError::Network(err.to_string())
            }
            CatalogError::BridgeError(err) => FetchError::Unknown(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::source::FetchErrorKind;

    #[test]
    fn test_status_errors_map_to_fetch_kinds() {
        let not_found: FetchError = CatalogError::NotFound {
            url: "https://example.org/book/1".to_string(),
        }
        .into();
        assert_eq!(not_found.kind(), FetchErrorKind::NotFound);

        let throttled: FetchError = CatalogError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        }
        .into();
        assert_eq!(
            throttled,
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );

        let server: FetchError = CatalogError::ApiError {
            status_code: 503,
            message: "unavailable".to_string(),
        }
        .into();
        assert_eq!(server.kind(), FetchErrorKind::Network);

        let client: FetchError = CatalogError::ApiError {
            status_code: 403,
            message: "forbidden".to_string(),
        }
        .into();
        assert_eq!(client.kind(), FetchErrorKind::Unknown);
    }

    #[test]
    fn test_transport_bridge_errors_are_network() {
        let timeout: FetchError =
            CatalogError::from(BridgeError::Timeout(Duration::from_secs(30))).into();
        assert_eq!(timeout.kind(), FetchErrorKind::Network);

        let other: FetchError =
            CatalogError::from(BridgeError::OperationFailed("boom".to_string())).into();
        assert_eq!(other.kind(), FetchErrorKind::Unknown);
    }

    #[test]
    fn test_parse_error_is_parse_failure() {
        let err: FetchError = CatalogError::ParseError("bad json".to_string()).into();
        assert_eq!(err.kind(), FetchErrorKind::ParseFailure);
    }
}
