//! Byte streams and the layers stacked on top of them.
//!
//! The bottom of the stack is [`ByteStream`]: untyped random-access bytes
//! over a single backing object. [`AesGcmCryptStream`] layers authenticated
//! encryption on any byte stream and exposes the same interface in plaintext
//! offsets; [`BlockPagedStream`] partitions any byte stream into fixed-size
//! pages for the directory engine.

use std::fmt;
use std::io;
use std::sync::{Arc, RwLock};

use thiserror::Error;

pub mod aead;
#[cfg(unix)]
pub mod file;
pub mod paged;

pub use aead::{AesGcmCryptStream, ParamCalculator};
#[cfg(unix)]
pub use file::FileStream;
pub use paged::BlockPagedStream;

/// Where in an encrypted stream an integrity failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    /// The per-file header slot.
    Header,
    /// A content block, by logical block index.
    Block(u64),
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockLocation::Header => write!(f, "header"),
            BlockLocation::Block(index) => write!(f, "block {index}"),
        }
    }
}

/// Errors raised by byte streams and the encrypted stream layered on them.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Authentication tag mismatch or an on-disk layout that cannot have
    /// been produced by this format.
    ///
    /// **[INTEGRITY VIOLATION]** The affected region has been tampered with,
    /// truncated, or written with a different key.
    #[error("integrity failure at {location}: {reason}")]
    Integrity {
        location: BlockLocation,
        reason: &'static str,
    },

    /// Offset or size arithmetic left the representable range.
    #[error("offset arithmetic out of range: {reason}")]
    OutOfRange { reason: &'static str },

    /// A stream was configured with parameters the format does not support.
    #[error("invalid stream parameters: {reason}")]
    InvalidParams { reason: String },

    /// Error propagated verbatim from the backing stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub(crate) fn tag_mismatch(location: BlockLocation) -> Self {
        StreamError::Integrity {
            location,
            reason: "authentication tag mismatch - possible tampering or wrong key",
        }
    }
}

/// Random-access byte stream over a single backing object.
///
/// This is the collaborator interface the encrypted layers are written
/// against. Offsets are absolute; reads past the end are truncated rather
/// than failing; writes past the end zero-fill the gap.
///
/// Locking is advisory and stream-scoped: implementations that map to a
/// shared resource (a file) take a whole-object lock, others default to a
/// no-op.
pub trait ByteStream {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is less than requested only at end of stream.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError>;

    /// Write all of `buf` at `offset`, extending the stream if needed.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<(), StreamError>;

    /// Set the stream length, zero-filling on growth.
    fn resize(&mut self, len: u64) -> Result<(), StreamError>;

    /// Current length in bytes.
    fn size(&self) -> Result<u64, StreamError>;

    /// Push buffered writes down to the backing object.
    fn flush(&mut self) -> Result<(), StreamError>;

    /// Durably persist the stream.
    fn fsync(&mut self) -> Result<(), StreamError> {
        self.flush()
    }

    /// Acquire the stream-scoped advisory lock.
    fn lock(&mut self, _exclusive: bool) -> Result<(), StreamError> {
        Ok(())
    }

    /// Release the stream-scoped advisory lock.
    fn unlock(&mut self) {}

    /// Whether unwritten regions are cheap (backed by filesystem holes).
    fn is_sparse(&self) -> bool {
        false
    }
}

/// In-memory byte stream backed by a shared growable buffer.
///
/// `Clone` shares the underlying buffer, which lets a test or a host reopen
/// the "same" stream, or inspect the raw bytes a layered stream produced.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the raw backing bytes. Test-facing escape hatch.
    pub fn with_raw<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<u8>) -> R,
    {
        let mut guard = self.buf.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

fn to_usize(v: u64, what: &'static str) -> Result<usize, StreamError> {
    usize::try_from(v).map_err(|_| StreamError::OutOfRange { reason: what })
}

impl ByteStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let data = self.buf.read().unwrap_or_else(|e| e.into_inner());
        let offset = to_usize(offset, "read offset")?;
        if offset >= data.len() || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<(), StreamError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut data = self.buf.write().unwrap_or_else(|e| e.into_inner());
        let offset = to_usize(offset, "write offset")?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(StreamError::OutOfRange {
                reason: "write end overflows",
            })?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&mut self, len: u64) -> Result<(), StreamError> {
        let len = to_usize(len, "resize length")?;
        let mut data = self.buf.write().unwrap_or_else(|e| e.into_inner());
        data.resize(len, 0);
        Ok(())
    }

    fn size(&self) -> Result<u64, StreamError> {
        let data = self.buf.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.len() as u64)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
}
