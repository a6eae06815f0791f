//! Core types for the mm-wave transmission bench.
//!
//! - [`error`]: the shared [`DaqError`](error::DaqError) taxonomy
//! - [`serial`]: type-erased async transports and port helpers
//! - [`reply`]: normalization of instrument query replies

pub mod error;
pub mod reply;
pub mod serial;

pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
pub use reply::Reply;
