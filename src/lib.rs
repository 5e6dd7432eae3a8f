//! Core engine of a user-space encrypted filesystem.
//!
//! Two subsystems make up the crate: the authenticated random-access file
//! stream ([`stream::AesGcmCryptStream`] opened through [`fs::StreamOpener`])
//! and the on-disk B-tree directory ([`dir::BtreeDirectory`]). Everything
//! else — mounting, name translation, password derivation — lives in the
//! host around this crate.

pub mod crypto;
pub mod dir;
pub mod error;
pub mod fs;
pub mod stream;

pub use crypto::MasterKeys;
pub use dir::BtreeDirectory;
pub use fs::{File, StreamOpener, StreamParams};
pub use stream::{AesGcmCryptStream, ByteStream, MemoryStream};
