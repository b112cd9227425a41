//! High-level application primitives.
//!
//! This crate provides the common pieces needed to bootstrap an application before it starts doing real work, such as
//! initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
