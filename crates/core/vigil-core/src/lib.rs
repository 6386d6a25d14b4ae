//! # Vigil Core
//!
//! Shared foundation for the Vigil command verification crates.
//!
//! ## Features
//!
//! - **Error Handling**: the [`VigilError`] type and [`VigilResult`] alias every crate converts into
//! - **Configuration**: layered loading of defaults, TOML/JSON files and `VIGIL_` environment variables
//! - **Observability**: `tracing` subscriber initialisation driven by configuration
//!
//! ## Quick Start
//!
//! ```rust
//! use vigil_core::{VigilError, VigilResult};
//!
//! fn parse_window(ms: i64) -> VigilResult<u64> {
//!     u64::try_from(ms).map_err(|_| VigilError::invalid_input("window must not be negative"))
//! }
//!
//! assert!(parse_window(-1).is_err());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod observability;
pub mod traits;

pub use config::{ConfigFormat, ConfigLoader};
pub use error::{VigilError, VigilResult};
pub use observability::{init_test_tracing, init_tracing, LoggingConfig};
pub use traits::Validatable;

/// Version information for the Vigil Core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of the Vigil Core library
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "vigil-core");
    }

    #[test]
    fn test_error_result_types() {
        let success: VigilResult<i32> = Ok(42);
        assert_eq!(success.unwrap(), 42);

        let error: VigilResult<i32> = Err(VigilError::InvalidInput("test error".to_string()));
        assert!(error.is_err());
    }
}
