//! Authenticated random-access encryption over a byte stream.
//!
//! Every logical block of `block_size` plaintext bytes occupies one on-disk
//! slot of `iv_size + block_size + 16` bytes: a fresh random IV, the
//! ciphertext (same length as the plaintext) and the GCM tag. A slot whose
//! IV is all zeros is a hole and reads back as zeros without touching the
//! cipher. The slots are preceded by a fixed header slot carrying the
//! 16-byte random file ID, and optionally by a deterministic amount of
//! padding derived from that ID.

use std::fmt;

use aead::Payload;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Key, Nonce,
};
use rand::RngCore;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use super::{BlockLocation, ByteStream, StreamError};

/// Length of the random per-file ID stored in the header.
pub const ID_SIZE: usize = 16;
/// Length of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;
/// Nonce length the compiled cipher accepts.
pub const GCM_NONCE_SIZE: usize = 12;

/// Derives the per-file parameters that depend on the file ID.
///
/// Implemented by the stream opener, which owns the master keys. The seam
/// keeps the stream itself free of any key material other than the session
/// key it is handed.
pub trait ParamCalculator {
    /// Derive the 16-byte session key for a file ID.
    fn compute_session_key(&self, id: &[u8; ID_SIZE]) -> Zeroizing<[u8; 16]>;

    /// Derive the padding length (in bytes) for a file ID.
    fn compute_padding(&self, id: &[u8; ID_SIZE]) -> u32;
}

/// Random-access AES-128-GCM stream over any [`ByteStream`].
///
/// All offsets and lengths on this type are plaintext-logical; the physical
/// layout is derived. A single writer at a time is assumed: the host wraps
/// the stream in its per-file exclusive lock.
pub struct AesGcmCryptStream<S> {
    base: S,
    cipher: Aes128Gcm,
    id: [u8; ID_SIZE],
    block_size: u64,
    iv_size: u64,
    padding: u64,
    read_advisory: bool,
}

fn fill_random_iv(iv: &mut [u8]) {
    let mut rng = rand::rng();
    loop {
        rng.fill_bytes(iv);
        // All-zero is reserved as the hole marker.
        if iv.iter().any(|&b| b != 0) {
            return;
        }
    }
}

fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

fn to_usize(v: u64, what: &'static str) -> Result<usize, StreamError> {
    usize::try_from(v).map_err(|_| StreamError::OutOfRange { reason: what })
}

impl<S: ByteStream> AesGcmCryptStream<S> {
    /// Open (or initialize) an encrypted stream over `base`.
    ///
    /// Acquires the stream's exclusive lock for the duration of the header
    /// read or fabrication and releases it on every exit path. An empty
    /// backing stream, or one whose header IV is all zeros, receives a
    /// freshly fabricated header; anything else is tag-verified before any
    /// data can be read.
    #[instrument(level = "debug", skip(base, calc))]
    pub fn open(
        mut base: S,
        calc: &dyn ParamCalculator,
        block_size: u32,
        iv_size: u32,
        skip_verification: bool,
    ) -> Result<Self, StreamError> {
        if block_size == 0 {
            return Err(StreamError::InvalidParams {
                reason: "block size must be positive".to_owned(),
            });
        }
        if iv_size as usize != GCM_NONCE_SIZE {
            return Err(StreamError::InvalidParams {
                reason: format!("iv size {iv_size} does not match the {GCM_NONCE_SIZE}-byte GCM nonce"),
            });
        }
        base.lock(true)?;
        let init = Self::init_header(&mut base, calc, iv_size as u64, skip_verification);
        base.unlock();
        let (cipher, id, padding, read_advisory) = init?;
        Ok(AesGcmCryptStream {
            base,
            cipher,
            id,
            block_size: block_size as u64,
            iv_size: iv_size as u64,
            padding: padding as u64,
            read_advisory,
        })
    }

    fn init_header(
        base: &mut S,
        calc: &dyn ParamCalculator,
        iv_size: u64,
        skip_verification: bool,
    ) -> Result<(Aes128Gcm, [u8; ID_SIZE], u32, bool), StreamError> {
        let header_len = to_usize(iv_size, "iv size")? + ID_SIZE + TAG_SIZE;
        let phys = base.size()?;

        if phys == 0 {
            return Self::fabricate_header(base, calc, iv_size).map(|(c, id, pad)| (c, id, pad, false));
        }

        let mut header = vec![0u8; header_len];
        let n = base.read(&mut header, 0)?;
        if n < header_len {
            return Err(StreamError::Integrity {
                location: BlockLocation::Header,
                reason: "truncated header",
            });
        }

        let iv_len = header_len - ID_SIZE - TAG_SIZE;
        let (iv, rest) = header.split_at(iv_len);
        let (id_bytes, tag) = rest.split_at(ID_SIZE);

        if is_all_zero(iv) {
            // Left behind by an external truncate-and-recreate; treat as
            // uninitialised and fabricate in place.
            debug!("header IV is all zeros, fabricating a fresh header");
            return Self::fabricate_header(base, calc, iv_size).map(|(c, id, pad)| (c, id, pad, false));
        }

        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(id_bytes);
        let key = calc.compute_session_key(&id);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_ref()));

        let verified = cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: tag, aad: &id })
            .is_ok();
        let mut read_advisory = false;
        if !verified {
            if !skip_verification {
                warn!("header verification failed");
                return Err(StreamError::tag_mismatch(BlockLocation::Header));
            }
            warn!("header verification failed, continuing read-advisory");
            read_advisory = true;
        }

        let padding = calc.compute_padding(&id);
        trace!(padding, "opened existing encrypted stream");
        Ok((cipher, id, padding, read_advisory))
    }

    fn fabricate_header(
        base: &mut S,
        calc: &dyn ParamCalculator,
        iv_size: u64,
    ) -> Result<(Aes128Gcm, [u8; ID_SIZE], u32), StreamError> {
        let iv_len = to_usize(iv_size, "iv size")?;
        let mut id = [0u8; ID_SIZE];
        rand::rng().fill_bytes(&mut id);

        let key = calc.compute_session_key(&id);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_ref()));

        let mut header = vec![0u8; iv_len];
        fill_random_iv(&mut header);
        let tag = cipher
            .encrypt(
                Nonce::from_slice(&header[..iv_len]),
                Payload { msg: &[], aad: &id },
            )
            .map_err(|_| StreamError::OutOfRange {
                reason: "header encryption failed",
            })?;
        header.extend_from_slice(&id);
        header.extend_from_slice(&tag);
        base.write(&header, 0)?;

        let padding = calc.compute_padding(&id);
        if padding > 0 {
            let mut pad = vec![0u8; padding as usize];
            rand::rng().fill_bytes(&mut pad);
            base.write(&pad, header.len() as u64)?;
        }
        debug!(padding, "fabricated fresh stream header");
        Ok((cipher, id, padding))
    }

    /// The file's random 16-byte ID.
    pub fn file_id(&self) -> &[u8; ID_SIZE] {
        &self.id
    }

    /// Plaintext bytes per block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Padding bytes between the header and block 0.
    pub fn padding_len(&self) -> u64 {
        self.padding
    }

    /// Whether the header failed verification and was accepted anyway.
    pub fn is_read_advisory(&self) -> bool {
        self.read_advisory
    }

    /// Unwrap the backing stream.
    pub fn into_inner(self) -> S {
        self.base
    }

    fn header_len(&self) -> u64 {
        self.iv_size + (ID_SIZE + TAG_SIZE) as u64
    }

    fn data_start(&self) -> u64 {
        self.header_len() + self.padding
    }

    fn slot_size(&self) -> u64 {
        self.iv_size + self.block_size + TAG_SIZE as u64
    }

    fn slot_offset(&self, block: u64) -> Result<u64, StreamError> {
        block
            .checked_mul(self.slot_size())
            .and_then(|v| v.checked_add(self.data_start()))
            .ok_or(StreamError::OutOfRange {
                reason: "block offset overflows",
            })
    }

    fn aad(&self, block: u64) -> [u8; 8 + ID_SIZE] {
        let mut aad = [0u8; 8 + ID_SIZE];
        aad[..8].copy_from_slice(&block.to_le_bytes());
        aad[8..].copy_from_slice(&self.id);
        aad
    }

    /// Plaintext length of `block` under logical size `logical`.
    fn block_len(&self, block: u64, logical: u64) -> u64 {
        let start = block * self.block_size;
        if start >= logical {
            0
        } else {
            self.block_size.min(logical - start)
        }
    }

    /// Physical stream length that encodes logical size `logical`.
    fn physical_for(&self, logical: u64) -> Result<u64, StreamError> {
        let full = logical / self.block_size;
        let rem = logical % self.block_size;
        let mut phys = full
            .checked_mul(self.slot_size())
            .and_then(|v| v.checked_add(self.data_start()))
            .ok_or(StreamError::OutOfRange {
                reason: "logical size overflows physical layout",
            })?;
        if rem > 0 {
            phys += self.iv_size + rem + TAG_SIZE as u64;
        }
        Ok(phys)
    }

    fn is_hole(&mut self, block: u64) -> Result<bool, StreamError> {
        let off = self.slot_offset(block)?;
        let mut iv = vec![0u8; to_usize(self.iv_size, "iv size")?];
        let n = self.base.read(&mut iv, off)?;
        if n < iv.len() {
            return Err(StreamError::Integrity {
                location: BlockLocation::Block(block),
                reason: "truncated block slot",
            });
        }
        Ok(is_all_zero(&iv))
    }

    /// Read and decrypt `block`, whose plaintext length is `len`.
    fn read_block(&mut self, block: u64, len: u64) -> Result<Zeroizing<Vec<u8>>, StreamError> {
        let len = to_usize(len, "block length")?;
        let iv_len = to_usize(self.iv_size, "iv size")?;
        let off = self.slot_offset(block)?;

        let mut slot = vec![0u8; iv_len + len + TAG_SIZE];
        let n = self.base.read(&mut slot, off)?;
        if n < slot.len() {
            return Err(StreamError::Integrity {
                location: BlockLocation::Block(block),
                reason: "truncated block slot",
            });
        }

        let (iv, body) = slot.split_at(iv_len);
        if is_all_zero(iv) {
            return Ok(Zeroizing::new(vec![0u8; len]));
        }

        let aad = self.aad(block);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: body, aad: &aad })
            .map_err(|_| StreamError::tag_mismatch(BlockLocation::Block(block)))?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt and store `block` with a fresh IV.
    fn write_block(&mut self, block: u64, plaintext: &[u8]) -> Result<(), StreamError> {
        debug_assert!(plaintext.len() as u64 <= self.block_size);
        let iv_len = to_usize(self.iv_size, "iv size")?;
        let off = self.slot_offset(block)?;

        let mut slot = vec![0u8; iv_len];
        fill_random_iv(&mut slot);
        let aad = self.aad(block);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&slot[..iv_len]),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| StreamError::OutOfRange {
                reason: "block too large for AES-GCM",
            })?;
        slot.extend_from_slice(&ciphertext);
        self.base.write(&slot, off)
    }

    /// Grow the logical size from `from` to `to` without writing user data.
    ///
    /// A stored partial tail block is re-encrypted zero-padded to its new
    /// length; holes stay holes because the physical extension is zeros.
    fn extend_logical(&mut self, from: u64, to: u64) -> Result<(), StreamError> {
        debug_assert!(from < to);
        let tail_len = from % self.block_size;
        if tail_len > 0 {
            let block = from / self.block_size;
            let target = self.block_size.min(to - block * self.block_size);
            if target > tail_len && !self.is_hole(block)? {
                let mut plaintext = self.read_block(block, tail_len)?;
                plaintext.resize(to_usize(target, "block length")?, 0);
                self.write_block(block, &plaintext)?;
            }
        }
        let new_phys = self.physical_for(to)?;
        if new_phys > self.base.size()? {
            self.base.resize(new_phys)?;
        }
        Ok(())
    }
}

impl<S> fmt::Debug for AesGcmCryptStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCryptStream")
            .field("id", &hex::encode(self.id))
            .field("block_size", &self.block_size)
            .field("padding", &self.padding)
            .field("read_advisory", &self.read_advisory)
            .finish_non_exhaustive()
    }
}

impl<S: ByteStream> ByteStream for AesGcmCryptStream<S> {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let logical = self.size()?;
        if offset >= logical || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(logical - offset);
        let wanted = to_usize(wanted, "read length")?;

        let mut done = 0;
        while done < wanted {
            let pos = offset + done as u64;
            let block = pos / self.block_size;
            let in_block = to_usize(pos % self.block_size, "in-block offset")?;
            let block_len = self.block_len(block, logical);
            let plaintext = self.read_block(block, block_len)?;
            let take = (wanted - done).min(plaintext.len() - in_block);
            buf[done..done + take].copy_from_slice(&plaintext[in_block..in_block + take]);
            done += take;
        }
        Ok(wanted)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<(), StreamError> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(StreamError::OutOfRange {
                reason: "write end overflows",
            })?;
        let mut logical = self.size()?;
        if offset > logical {
            self.extend_logical(logical, offset)?;
            logical = offset;
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / self.block_size;
            let in_block = to_usize(pos % self.block_size, "in-block offset")?;
            let current_len = self.block_len(block, logical);
            let new_len = current_len.max(self.block_size.min(end - block * self.block_size));

            let mut plaintext = if current_len > 0 {
                self.read_block(block, current_len)?
            } else {
                Zeroizing::new(Vec::new())
            };
            plaintext.resize(to_usize(new_len, "block length")?, 0);

            let take = (buf.len() - done).min(plaintext.len() - in_block);
            plaintext[in_block..in_block + take].copy_from_slice(&buf[done..done + take]);
            self.write_block(block, &plaintext)?;

            done += take;
            logical = logical.max(block * self.block_size + new_len);
        }
        Ok(())
    }

    fn resize(&mut self, len: u64) -> Result<(), StreamError> {
        let logical = self.size()?;
        if len == logical {
            return Ok(());
        }
        if len > logical {
            trace!(from = logical, to = len, "growing stream with holes");
            return self.extend_logical(logical, len);
        }

        trace!(from = logical, to = len, "shrinking stream");
        let rem = len % self.block_size;
        if rem == 0 {
            return self.base.resize(self.physical_for(len)?);
        }
        let block = len / self.block_size;
        if !self.is_hole(block)? {
            let current_len = self.block_len(block, logical);
            let mut plaintext = self.read_block(block, current_len)?;
            plaintext.truncate(to_usize(rem, "block length")?);
            self.write_block(block, &plaintext)?;
        }
        self.base.resize(self.physical_for(len)?)
    }

    fn size(&self) -> Result<u64, StreamError> {
        let phys = self.base.size()?;
        let start = self.data_start();
        if phys <= start {
            return Ok(0);
        }
        let body = phys - start;
        let slot = self.slot_size();
        let full = body / slot;
        let rem = body % slot;
        if rem == 0 {
            Ok(full * self.block_size)
        } else if rem <= self.iv_size + TAG_SIZE as u64 {
            Err(StreamError::Integrity {
                location: BlockLocation::Block(full),
                reason: "impossible trailing slot length",
            })
        } else {
            Ok(full * self.block_size + rem - self.iv_size - TAG_SIZE as u64)
        }
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.base.flush()
    }

    fn fsync(&mut self) -> Result<(), StreamError> {
        self.base.fsync()
    }

    fn lock(&mut self, exclusive: bool) -> Result<(), StreamError> {
        self.base.lock(exclusive)
    }

    fn unlock(&mut self) {
        self.base.unlock();
    }

    fn is_sparse(&self) -> bool {
        self.base.is_sparse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    struct FixedCalc {
        padding: u32,
    }

    impl ParamCalculator for FixedCalc {
        fn compute_session_key(&self, id: &[u8; ID_SIZE]) -> Zeroizing<[u8; 16]> {
            // Derivation does not matter here, only determinism per id.
            let mut key = [0u8; 16];
            for (i, b) in id.iter().enumerate() {
                key[i] = b.wrapping_add(1);
            }
            Zeroizing::new(key)
        }

        fn compute_padding(&self, _id: &[u8; ID_SIZE]) -> u32 {
            self.padding
        }
    }

    fn open_fresh(padding: u32) -> AesGcmCryptStream<MemoryStream> {
        let calc = FixedCalc { padding };
        AesGcmCryptStream::open(MemoryStream::new(), &calc, 64, 12, false).unwrap()
    }

    #[test]
    fn empty_stream_has_zero_size() {
        let s = open_fresh(0);
        assert_eq!(s.size().unwrap(), 0);
    }

    #[test]
    fn write_then_read_single_block() {
        let mut s = open_fresh(0);
        s.write(b"hello", 0).unwrap();
        assert_eq!(s.size().unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn overwrite_within_block() {
        let mut s = open_fresh(0);
        s.write(b"aaaaaaaa", 0).unwrap();
        s.write(b"BB", 3).unwrap();
        let mut buf = [0u8; 8];
        s.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"aaaBBaaa");
    }

    #[test]
    fn sparse_write_reads_zeros_between() {
        let mut s = open_fresh(0);
        s.write(b"X", 200).unwrap();
        assert_eq!(s.size().unwrap(), 201);
        let mut buf = vec![0xffu8; 201];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 201);
        assert!(buf[..200].iter().all(|&b| b == 0));
        assert_eq!(buf[200], b'X');
    }

    #[test]
    fn extend_past_partial_tail_block() {
        let mut s = open_fresh(0);
        s.write(b"tail", 0).unwrap();
        // Crosses the stored partial block 0, which must re-encrypt padded.
        s.write(b"far", 130).unwrap();
        let mut buf = vec![0xffu8; 133];
        s.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..4], b"tail");
        assert!(buf[4..130].iter().all(|&b| b == 0));
        assert_eq!(&buf[130..], b"far");
    }

    #[test]
    fn shrink_into_block() {
        let mut s = open_fresh(0);
        s.write(&[7u8; 100], 0).unwrap();
        s.resize(70).unwrap();
        assert_eq!(s.size().unwrap(), 70);
        let mut buf = vec![0u8; 70];
        s.read(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        s.resize(0).unwrap();
        assert_eq!(s.size().unwrap(), 0);
    }

    #[test]
    fn reopen_preserves_content() {
        let calc = FixedCalc { padding: 0 };
        let backing = MemoryStream::new();
        {
            let mut s =
                AesGcmCryptStream::open(backing.clone(), &calc, 64, 12, false).unwrap();
            s.write(b"persist me", 3).unwrap();
        }
        let mut s = AesGcmCryptStream::open(backing, &calc, 64, 12, false).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(s.read(&mut buf, 3).unwrap(), 10);
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn padding_shifts_data_region() {
        let mut s = open_fresh(17);
        assert_eq!(s.padding_len(), 17);
        s.write(b"pad", 0).unwrap();
        let mut buf = [0u8; 3];
        s.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"pad");
        // header (12+32) + padding (17) + slot (12+3+16)
        assert_eq!(s.into_inner().size().unwrap(), 44 + 17 + 31);
    }

    #[test]
    fn wrong_key_fails_header_check() {
        let calc = FixedCalc { padding: 0 };
        let backing = MemoryStream::new();
        {
            let mut s =
                AesGcmCryptStream::open(backing.clone(), &calc, 64, 12, false).unwrap();
            s.write(b"secret", 0).unwrap();
        }
        struct OtherCalc;
        impl ParamCalculator for OtherCalc {
            fn compute_session_key(&self, _id: &[u8; ID_SIZE]) -> Zeroizing<[u8; 16]> {
                Zeroizing::new([0xaa; 16])
            }
            fn compute_padding(&self, _id: &[u8; ID_SIZE]) -> u32 {
                0
            }
        }
        let err = AesGcmCryptStream::open(backing, &OtherCalc, 64, 12, false).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Integrity {
                location: BlockLocation::Header,
                ..
            }
        ));
    }
}
