//! # Catalog Providers
//!
//! Concrete source adapters for the sync core.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`JsonCatalogSource`]: metadata adapter over a JSON catalog API
//! - [`HtmlPageSource`]: HTTP-content adapter that fetches pages by URL template
//!   and delegates markup interpretation to a [`PageParser`]
//! - [`RulePageParser`]: a [`PageParser`] configured with one regular expression
//!   per field
//! - [`CatalogClient`]: shared `GET` plumbing with retry on 429/5xx and
//!   exponential backoff
//!
//! ## Error mapping
//!
//! | Remote outcome | `FetchError` |
//! |----------------|--------------|
//! | 404 | `NotFound` |
//! | 429 after the last retry | `RateLimited` (with `Retry-After`) |
//! | 5xx after the last retry, transport failure, timeout | `Network` |
//! | Undecodable body, missing content block, blank chapter | `ParseFailure` |
//! | Anything else | `Unknown` |

pub mod client;
pub mod error;
pub mod html;
pub mod json;
pub mod parser;
pub mod types;

pub use client::CatalogClient;
pub use error::{CatalogError, Result};
pub use html::{HtmlPageSource, HtmlSourceConfig, PageParser};
pub use json::{JsonCatalogConfig, JsonCatalogSource};
pub use parser::{PageRules, RulePageParser};
