// Cadence Core - Job engine domain, ports and application services
// NO infrastructure dependencies (hexagonal architecture)

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, EnqueueError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
