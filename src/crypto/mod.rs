//! Key material handling for the filesystem core.
//!
//! Session-key and padding derivation live with the stream opener in
//! [`crate::fs::opener`]; this module only owns the long-lived master
//! secrets and their access discipline.

pub mod keys;

pub use keys::MasterKeys;
