//! Client Capability Module
//!
//! Everything the rotation manager needs from the clients it manages:
//! closing, operation counts, and the tagged result of creating one.
//!
//! # Example
//! ```ignore
//! use client_rotator::client::{Created, HttpTransport};
//!
//! // reqwest does not count its requests, so the manager counts for it
//! let created = Created::plain(HttpTransport::with_defaults()?);
//! ```

mod counting;
mod http;
mod transport;

pub use counting::{OperationCounter, OperationGuard};
pub use http::{HttpReply, HttpTransport, DEFAULT_HTTP_TIMEOUT};
pub use transport::{CountableClient, Created, OperationCounts, Transport};

pub(crate) use transport::CountSource;
