//! Basic library shared by the controller services
//!
//! Provides:
//! - logging bootstrap
//! - shutdown signal handling
//! - layered configuration loading
//! - hex helpers

pub mod config_loader;
pub mod hex;
pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
