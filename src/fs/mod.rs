//! Format-level pieces: parameters, the per-file stream opener, and the
//! lock-guarded file handle the host dispatcher works with.

pub mod file;
pub mod opener;

pub use file::File;
pub use opener::{StreamOpener, StreamParams, GCM_IV_SIZE};
