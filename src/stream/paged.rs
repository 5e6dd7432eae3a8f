//! Fixed-size page view over a byte stream.

use super::{ByteStream, StreamError};

/// Partitions a byte stream into pages of `page_size` bytes, addressed by
/// page number.
///
/// Reading a page that does not exist (fully or partially beyond the end)
/// yields zeros for the missing range; writing past the end extends the
/// stream. Page 0 starts at offset 0, so any header the caller wants lives
/// in an ordinary page.
#[derive(Debug)]
pub struct BlockPagedStream<S> {
    base: S,
    page_size: usize,
}

impl<S: ByteStream> BlockPagedStream<S> {
    pub fn new(base: S, page_size: usize) -> Self {
        debug_assert!(page_size > 0);
        BlockPagedStream { base, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages currently backed by the stream.
    pub fn page_count(&self) -> Result<u32, StreamError> {
        let pages = self.base.size()? / self.page_size as u64;
        u32::try_from(pages).map_err(|_| StreamError::OutOfRange {
            reason: "page count exceeds u32",
        })
    }

    fn page_offset(&self, page: u32) -> u64 {
        page as u64 * self.page_size as u64
    }

    /// Read one page into `buf` (which must be `page_size` long),
    /// zero-filling whatever the stream does not cover.
    pub fn read_page(&mut self, page: u32, buf: &mut [u8]) -> Result<(), StreamError> {
        debug_assert_eq!(buf.len(), self.page_size);
        let n = self.base.read(buf, self.page_offset(page))?;
        buf[n..].fill(0);
        Ok(())
    }

    /// Write one full page.
    pub fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), StreamError> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.base.write(buf, self.page_offset(page))
    }

    /// Resize the stream to exactly `pages` pages.
    pub fn set_page_count(&mut self, pages: u32) -> Result<(), StreamError> {
        self.base.resize(self.page_offset(pages))
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.base.flush()
    }

    pub fn fsync(&mut self) -> Result<(), StreamError> {
        self.base.fsync()
    }

    pub fn get_ref(&self) -> &S {
        &self.base
    }

    pub fn into_inner(self) -> S {
        self.base
    }
}
