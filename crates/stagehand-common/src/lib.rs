//! Stagehand Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every Stagehand workspace member:
//!
//! - **Logging**: subscriber setup driven by `LOG_*` environment variables
//! - **Checksums**: SHA-256 digests for staged objects
//! - **Errors**: the error type for the above
//!
//! # Example
//!
//! ```no_run
//! use stagehand_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
