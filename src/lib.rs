// ABOUTME: Operator-facing library for corral: logging bootstrap and the health/intake server.
// ABOUTME: Re-exports the host-side modules from corral-core for the binary and tests.

pub mod logging;
pub mod server;

pub use corral_core::config;
pub use corral_core::metrics;
pub use corral_core::paths;
pub use corral_core::session;
pub use corral_core::{Config, Dispatcher, SessionStore};
