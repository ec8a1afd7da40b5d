//! Shared service plumbing
//!
//! - logging bootstrap with runtime level reload
//! - graceful shutdown signal handling
//! - configuration value fallback helpers

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use shutdown::shutdown_token;
