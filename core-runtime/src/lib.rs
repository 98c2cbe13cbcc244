//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the sync core:
//! - Logging and tracing bootstrap
//! - Configuration management
//! - Event bus system
//!
//! Every other `core-*` crate depends on this one for its event types and
//! settings; nothing here knows about books or storage.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
