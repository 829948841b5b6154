//! Rotating client lifecycle manager library

// Public modules
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod rotation;

// Re-export commonly used types
pub use client::{CountableClient, Created, HttpTransport, OperationCounts, Transport};
pub use config::{RotationConfig, Settings};
pub use error::{RotationError, RotationResult};
pub use rotation::{CallOptions, ClientLease, RotationManager, RotationStats};
