//! Client Rotation Module
//!
//! This module keeps a single stable handle over a client that is replaced
//! after serving too many requests, living too long, or failing.
//!
//! # Features
//! - Single-flight creation: concurrent callers share one new client
//! - Lazy expiry by request count or age, checked on acquisition
//! - Invalidation on operation errors, optionally with a forced close
//! - Background sweep that closes retired clients with a bounded timeout
//! - Graceful shutdown that drains every remaining client
//!
//! # Example
//! ```ignore
//! use client_rotator::{Created, HttpTransport, RotationConfig, RotationManager};
//!
//! let manager = RotationManager::new(
//!     || async { Ok::<_, anyhow::Error>(Created::plain(HttpTransport::with_defaults()?)) },
//!     RotationConfig::default().with_request_limit(500),
//! )?;
//!
//! let reply = manager
//!     .with_client(|client| async move { client.get("https://example.com").await })
//!     .await?;
//!
//! manager.close(false).await;
//! ```

mod instance;
mod manager;
mod sweeper;

pub use instance::{ClientLease, InstanceStats, ManagedInstance, RetireReason};
pub use manager::{CallOptions, ClientFactory, CloseFn, RotationManager, RotationStats};
pub use sweeper::SweepReport;
