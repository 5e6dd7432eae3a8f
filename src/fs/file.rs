//! Lock-guarded file handle over an encrypted stream.

use std::sync::{Mutex, MutexGuard};

use crate::stream::aead::AesGcmCryptStream;
use crate::stream::{ByteStream, StreamError};

/// An open file: an encrypted stream behind a per-file exclusive lock.
///
/// Every operation takes the lock for the duration of the call, making the
/// crypt stream and its backing stream a single unit as far as concurrent
/// host threads are concerned. A poisoned lock is recovered rather than
/// propagated: a panic mid-operation leaves the on-disk state well-defined
/// (block writes are single slot-sized writes), so continuing is safe.
pub struct File<S> {
    stream: Mutex<AesGcmCryptStream<S>>,
}

impl<S: ByteStream> File<S> {
    pub fn new(stream: AesGcmCryptStream<S>) -> Self {
        File {
            stream: Mutex::new(stream),
        }
    }

    fn guard(&self) -> MutexGuard<'_, AesGcmCryptStream<S>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        self.guard().read(buf, offset)
    }

    pub fn write(&self, buf: &[u8], offset: u64) -> Result<(), StreamError> {
        self.guard().write(buf, offset)
    }

    pub fn resize(&self, len: u64) -> Result<(), StreamError> {
        self.guard().resize(len)
    }

    pub fn size(&self) -> Result<u64, StreamError> {
        self.guard().size()
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.guard().flush()
    }

    pub fn fsync(&self) -> Result<(), StreamError> {
        self.guard().fsync()
    }

    pub fn is_sparse(&self) -> bool {
        self.guard().is_sparse()
    }

    /// Unwrap the crypt stream, e.g. to close the file.
    pub fn into_stream(self) -> AesGcmCryptStream<S> {
        self.stream.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKeys;
    use crate::fs::opener::{StreamOpener, StreamParams};
    use crate::stream::MemoryStream;
    use std::sync::Arc;
    use std::thread;

    fn open_file() -> File<MemoryStream> {
        let keys = MasterKeys::random();
        let opener = StreamOpener::new(&keys, StreamParams::default()).unwrap();
        File::new(opener.open(MemoryStream::new()).unwrap())
    }

    #[test]
    fn shared_handle_serializes_access() {
        let file = Arc::new(open_file());
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let file = Arc::clone(&file);
            handles.push(thread::spawn(move || {
                let chunk = [t; 128];
                file.write(&chunk, t as u64 * 128).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(file.size().unwrap(), 512);
        for t in 0..4u8 {
            let mut buf = [0u8; 128];
            assert_eq!(file.read(&mut buf, t as u64 * 128).unwrap(), 128);
            assert!(buf.iter().all(|&b| b == t));
        }
    }
}
