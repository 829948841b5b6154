//! Rotation policy configuration
//!
//! Limits that decide when the active client is replaced, plus the cadence
//! of the background sweep that closes retired clients.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of requests a client may serve before it is rotated
pub const DEFAULT_REQUEST_LIMIT: u64 = 1000;

/// Default client lifetime (1 hour)
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(60 * 60);

/// Default period of the cleanup sweep (4 minutes)
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Default bound on a single close during a sweep (3 minutes 45 seconds)
pub const DEFAULT_CLEANUP_CLOSE_TIMEOUT: Duration = Duration::from_secs(3 * 60 + 45);

/// Configuration for client rotation behavior
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RotationConfig {
    /// Rotate once the client has seen more than this many requests
    pub request_limit: u64,
    /// Rotate once the client is older than this
    pub time_limit: Duration,
    /// Retire the active client when an operation fails
    pub invalidate_on_error: bool,
    /// Skip graceful shutdown when closing a client retired by an error
    pub force_close_on_error: bool,
    /// Period of the background cleanup sweep
    pub cleanup_interval: Duration,
    /// Upper bound on each close attempt made by the sweep
    pub cleanup_close_timeout: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            request_limit: DEFAULT_REQUEST_LIMIT,
            time_limit: DEFAULT_TIME_LIMIT,
            invalidate_on_error: false,
            force_close_on_error: false,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_close_timeout: DEFAULT_CLEANUP_CLOSE_TIMEOUT,
        }
    }
}

impl RotationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_limit(mut self, limit: u64) -> Self {
        self.request_limit = limit;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }

    pub fn with_force_close_on_error(mut self, force: bool) -> Self {
        self.force_close_on_error = force;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_cleanup_close_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_close_timeout = timeout;
        self
    }

    /// Overlay values from environment variables onto the defaults
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(limit) = env_parse::<u64>("ROTATION_REQUEST_LIMIT") {
            config.request_limit = limit;
        }
        if let Some(secs) = env_parse::<u64>("ROTATION_TIME_LIMIT_SECS") {
            config.time_limit = Duration::from_secs(secs);
        }
        if let Some(flag) = env_parse::<bool>("ROTATION_INVALIDATE_ON_ERROR") {
            config.invalidate_on_error = flag;
        }
        if let Some(flag) = env_parse::<bool>("ROTATION_FORCE_CLOSE_ON_ERROR") {
            config.force_close_on_error = flag;
        }
        if let Some(secs) = env_parse::<u64>("ROTATION_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("ROTATION_CLEANUP_CLOSE_TIMEOUT_SECS") {
            config.cleanup_close_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.request_limit == 0 {
            anyhow::bail!("Rotation request_limit must be > 0");
        }
        if self.time_limit.is_zero() {
            anyhow::bail!("Rotation time_limit must be > 0");
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!("Rotation cleanup_interval must be > 0");
        }
        // A hung close must not run into the next sweep
        if self.cleanup_close_timeout.is_zero()
            || self.cleanup_close_timeout >= self.cleanup_interval
        {
            anyhow::bail!(
                "Rotation cleanup_close_timeout ({:?}) must be > 0 and shorter than cleanup_interval ({:?})",
                self.cleanup_close_timeout,
                self.cleanup_interval
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse().ok())
}
