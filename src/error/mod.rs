//! Error types

mod types;

pub use types::{RotationError, RotationResult};
