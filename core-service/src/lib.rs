//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host configuration into the sync core: it opens the
//! library database, builds the local store, the source registry, the sync
//! engine and the download scheduler, and exposes the user actions hosts call.
//! Desktop apps typically enable the `desktop-shims` feature, which provides a
//! `reqwest`-backed HTTP client when none is injected.

pub mod error;
mod service;

pub use error::{Result, ServiceError};
pub use service::CoreService;

pub use core_runtime::config::{CoreConfig, DownloadSettings, SyncSettings};
pub use core_runtime::logging::{init_logging, LoggingConfig};

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop::ReqwestHttpClient;

/// Convenience bootstrapper for desktop hosts.
///
/// ```ignore
/// use core_service::bootstrap_desktop;
///
/// let core = bootstrap_desktop("/path/to/library.db").await?;
/// let books = core.library_books().await?;
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(database_path: impl Into<std::path::PathBuf>) -> Result<CoreService> {
    let config = CoreConfig::builder().database_path(database_path).build()?;
    CoreService::bootstrap(config).await
}
