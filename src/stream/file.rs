//! File-backed byte stream with advisory whole-file locking.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::warn;

use super::{ByteStream, StreamError};

/// Byte stream over an OS file.
///
/// Reads and writes use positioned I/O so no seek state is shared between
/// operations. `lock`/`unlock` map to `flock(2)` and are advisory: they
/// coordinate cooperating processes, nothing more.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    locked: bool,
}

impl FileStream {
    /// Open an existing file for read/write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileStream {
            file,
            locked: false,
        })
    }

    /// Create a file (or truncate an existing one) for read/write access.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileStream {
            file,
            locked: false,
        })
    }

    fn flock(&self, operation: libc::c_int) -> Result<(), StreamError> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl ByteStream for FileStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<(), StreamError> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn resize(&mut self, len: u64) -> Result<(), StreamError> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn size(&self) -> Result<u64, StreamError> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn fsync(&mut self) -> Result<(), StreamError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> Result<(), StreamError> {
        let op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        self.flock(op)?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) {
        if self.locked {
            if let Err(err) = self.flock(libc::LOCK_UN) {
                warn!(error = %err, "failed to release file lock");
            }
            self.locked = false;
        }
    }

    fn is_sparse(&self) -> bool {
        true
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioned_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let mut s = FileStream::create(&path).unwrap();
        s.write(b"hello world", 5).unwrap();
        assert_eq!(s.size().unwrap(), 16);

        let mut buf = [0u8; 11];
        assert_eq!(s.read(&mut buf, 5).unwrap(), 11);
        assert_eq!(&buf, b"hello world");

        let mut head = [0xffu8; 5];
        s.read(&mut head, 0).unwrap();
        assert_eq!(&head, &[0u8; 5]);
    }

    #[test]
    fn resize_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        {
            let mut s = FileStream::create(&path).unwrap();
            s.write(b"abcdef", 0).unwrap();
            s.resize(3).unwrap();
        }
        let s = FileStream::open(&path).unwrap();
        assert_eq!(s.size().unwrap(), 3);
    }

    #[test]
    fn lock_unlock_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let mut s = FileStream::create(&path).unwrap();
        s.lock(true).unwrap();
        s.unlock();
        s.lock(false).unwrap();
    }
}
