//! Configuration management module
//!
//! Rotation policy for the manager, plus process settings loaded from
//! environment variables and .env files.

pub mod rotation;
pub mod settings;

pub use rotation::{
    RotationConfig, DEFAULT_CLEANUP_CLOSE_TIMEOUT, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_REQUEST_LIMIT, DEFAULT_TIME_LIMIT,
};
pub use settings::{LogFormat, Settings};
