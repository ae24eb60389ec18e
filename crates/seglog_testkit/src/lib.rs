//! # seglog testkit
//!
//! Test utilities for seglog.
//!
//! This crate provides:
//! - Temp-directory fixtures and small appender configurations
//! - Property-based test generators using proptest
//! - Crash and corruption injection for segment files
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use seglog_testkit::prelude::*;
//!
//! init_tracing();
//! let dir = TestDir::new();
//! let mut log = open_string_log(dir.path(), small_config()).unwrap();
//! let address = log.append(&"hello".to_string()).unwrap();
//! assert_eq!(log.get(address).unwrap().as_deref(), Some("hello"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

static TRACING: Once = Once::new();

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // another harness may have installed a subscriber already
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
