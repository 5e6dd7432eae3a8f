//! Error types for the filesystem core.
//!
//! Each layer defines its own error enum next to the code that raises it;
//! this module re-exports them in one place.

pub use crate::dir::DirectoryError;
pub use crate::stream::{BlockLocation, StreamError};
