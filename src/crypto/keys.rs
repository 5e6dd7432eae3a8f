use std::fmt;

use rand::RngCore;
use secrecy::{ExposeSecret, Secret};

/// Master key material for a sealed filesystem.
///
/// Three independent 256-bit secrets: one for file content encryption, one
/// for deterministic per-file padding derivation, and one for filename
/// encryption (consumed by the name translation layer, not by this crate's
/// stream engine).
///
/// # Security
///
/// Each key is held in a [`Secret`], which prevents accidental logging and
/// zeroes the memory on drop. Access is only possible through the scoped
/// `with_*_key` callbacks, so raw key bytes never outlive the call that
/// needs them.
pub struct MasterKeys {
    content: Secret<[u8; 32]>,
    padding: Secret<[u8; 32]>,
    name: Secret<[u8; 32]>,
}

impl MasterKeys {
    /// Generate a fresh set of master keys from the OS RNG.
    pub fn random() -> Self {
        let mut content = [0u8; 32];
        let mut padding = [0u8; 32];
        let mut name = [0u8; 32];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut content);
        rng.fill_bytes(&mut padding);
        rng.fill_bytes(&mut name);
        Self::from_bytes(content, padding, name)
    }

    /// Wrap externally provisioned key material.
    ///
    /// This is the seam for the host's key-provisioning layer (password KDF,
    /// key files): it hands raw bytes in and they are wrapped immediately.
    /// The caller should zeroize its own copies after this returns.
    pub fn from_bytes(content: [u8; 32], padding: [u8; 32], name: [u8; 32]) -> Self {
        MasterKeys {
            content: Secret::new(content),
            padding: Secret::new(padding),
            name: Secret::new(name),
        }
    }

    /// Execute a function with access to the content master key.
    pub fn with_content_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.content.expose_secret())
    }

    /// Execute a function with access to the padding master key.
    pub fn with_padding_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.padding.expose_secret())
    }

    /// Execute a function with access to the name master key.
    pub fn with_name_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.name.expose_secret())
    }
}

impl fmt::Debug for MasterKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeys")
            .field("content", &"[REDACTED]")
            .field("padding", &"[REDACTED]")
            .field("name", &"[REDACTED]")
            .finish()
    }
}
