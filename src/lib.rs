//! Workspace entry crate.
//!
//! Host applications depend on `shelf-sync` and enable features instead of
//! wiring each workspace crate individually. With `desktop-shims` (the
//! default) the [`core_service`] façade is re-exported together with the
//! `reqwest`-backed HTTP client.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
