//! # Core Configuration Module
//!
//! Builder-based configuration for the sync core.
//!
//! ## Overview
//!
//! `CoreConfig` holds the injected bridges and the tunables for refresh cycles
//! and content downloads. Validation is fail-fast: `build()` refuses
//! configurations that would only break later at runtime.
//!
//! ## Dependencies
//!
//! - `HttpClient` - required by the bundled source adapters
//!   (desktop default: `bridge_desktop::ReqwestHttpClient` with `desktop-shims`)
//! - `Clock` - optional, defaults to the system clock
//! - `LoggerSink` - optional, forwards logs to the host
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, DownloadSettings};
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/library.db")
//!     .downloads(DownloadSettings {
//!         max_workers: 4,
//!         ..Default::default()
//!     })
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, LoggerSink, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::events::DEFAULT_EVENT_BUFFER_SIZE;

/// Refresh cycle tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Time budget for one adapter call; exceeding it is a network failure
    pub adapter_timeout: Duration,
    /// Cancel and restart an in-flight cycle on a new trigger instead of
    /// returning the existing handle
    pub force_refresh_by_default: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(30),
            force_refresh_by_default: false,
        }
    }
}

/// Download scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    /// Concurrent download workers
    pub max_workers: usize,
    /// Failed attempts after which a job is terminally failed
    pub retry_cap: u32,
    /// Re-enqueue failed jobs automatically until the cap is reached
    pub auto_retry: bool,
    /// Base delay for automatic re-enqueue backoff
    pub retry_base_delay: Duration,
    /// Time budget for one content fetch
    pub fetch_timeout: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            retry_cap: 3,
            auto_retry: true,
            retry_base_delay: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// Core configuration. Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// HTTP transport handed to the bundled source adapters
    pub http_client: Arc<dyn HttpClient>,

    /// Time source for every persisted timestamp
    pub clock: Arc<dyn Clock>,

    /// Optional host log sink
    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    /// Event bus capacity
    pub event_buffer_size: usize,

    pub sync: SyncSettings,

    pub downloads: DownloadSettings,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("http_client", &"HttpClient { ... }")
            .field("clock", &"Clock { ... }")
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .field("sync", &self.sync)
            .field("downloads", &self.downloads)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.sync.adapter_timeout.is_zero() {
            return Err(Error::Config(
                "Adapter timeout must be greater than 0".to_string(),
            ));
        }

        if self.downloads.max_workers == 0 {
            return Err(Error::Config(
                "Download worker count must be at least 1".to_string(),
            ));
        }

        if self.downloads.max_workers > 32 {
            return Err(Error::Config(
                "Download worker count exceeds maximum of 32".to_string(),
            ));
        }

        if self.downloads.retry_cap == 0 {
            return Err(Error::Config(
                "Download retry cap must be at least 1".to_string(),
            ));
        }

        if self.downloads.fetch_timeout.is_zero() {
            return Err(Error::Config(
                "Download fetch timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::try_new()
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                  Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient. \
                  Other hosts: inject a platform-native adapter with .http_client()."
            .to_string(),
    })
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    event_buffer_size: Option<usize>,
    sync: Option<SyncSettings>,
    downloads: Option<DownloadSettings>,
}

impl CoreConfigBuilder {
    /// Sets the database file path (required).
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn sync(mut self, settings: SyncSettings) -> Self {
        self.sync = Some(settings);
        self
    }

    /// Shortcut for the most commonly tuned sync setting.
    pub fn adapter_timeout(mut self, timeout: Duration) -> Self {
        let mut settings = self.sync.take().unwrap_or_default();
        settings.adapter_timeout = timeout;
        self.sync = Some(settings);
        self
    }

    pub fn downloads(mut self, settings: DownloadSettings) -> Self {
        self.downloads = Some(settings);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - `Error::Config` when the database path is missing or a tunable is out of range
    /// - `Error::CapabilityMissing` when no `HttpClient` is available
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let config = CoreConfig {
            database_path,
            http_client,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            sync: self.sync.unwrap_or_default(),
            downloads: self.downloads.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{HttpRequest, HttpResponse};

    struct NullHttpClient;

    #[async_trait]
    impl HttpClient for NullHttpClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(bridge_traits::BridgeError::NotAvailable("offline".to_string()))
        }
    }

    fn builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .database_path("/tmp/library.db")
            .http_client(Arc::new(NullHttpClient))
    }

    #[test]
    fn test_builder_applies_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/library.db"));
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.downloads.retry_cap, 3);
        assert!(config.logger_sink.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let result = CoreConfig::builder()
            .http_client(Arc::new(NullHttpClient))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_adapter_timeout_shortcut() {
        let config = builder()
            .adapter_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.sync.adapter_timeout, Duration::from_secs(5));
        assert!(!config.sync.force_refresh_by_default);
    }

    #[test]
    fn test_rejects_zero_workers_and_zero_cap() {
        let zero_workers = builder()
            .downloads(DownloadSettings {
                max_workers: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(zero_workers, Err(Error::Config(_))));

        let zero_cap = builder()
            .downloads(DownloadSettings {
                retry_cap: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(zero_cap, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = builder().adapter_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_missing_http_client_is_capability_error() {
        let result = CoreConfig::builder().database_path("/tmp/x.db").build();
        assert!(matches!(result, Err(Error::CapabilityMissing { .. })));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_default_http_client() {
        let config = CoreConfig::builder()
            .database_path("/tmp/x.db")
            .build()
            .unwrap();
        assert!(format!("{:?}", config).contains("HttpClient"));
    }
}
