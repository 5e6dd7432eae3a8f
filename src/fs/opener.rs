//! Per-file stream opening: key/parameter ownership and derivation.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypto::MasterKeys;
use crate::stream::aead::{AesGcmCryptStream, ParamCalculator, GCM_NONCE_SIZE, ID_SIZE};
use crate::stream::{ByteStream, StreamError};

/// The GCM nonce length this format is compiled for.
pub const GCM_IV_SIZE: u32 = GCM_NONCE_SIZE as u32;

/// Filesystem-wide stream parameters.
///
/// These are chosen at filesystem creation time, persisted by the host next
/// to the key material, and pinned for the life of the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    /// Plaintext bytes per encrypted block.
    pub block_size: u32,
    /// IV length per slot. Only [`GCM_IV_SIZE`] is accepted.
    pub iv_size: u32,
    /// Upper bound (inclusive) for the deterministic per-file padding.
    pub max_padding_size: u32,
    /// Accept files whose header fails verification (read-advisory mode).
    pub skip_verification: bool,
}

impl Default for StreamParams {
    fn default() -> Self {
        StreamParams {
            block_size: 4096,
            iv_size: GCM_IV_SIZE,
            max_padding_size: 0,
            skip_verification: false,
        }
    }
}

impl StreamParams {
    /// Parse parameters from the host's JSON parameter file.
    pub fn from_json(data: &str) -> Result<Self, StreamError> {
        serde_json::from_str(data).map_err(|e| StreamError::InvalidParams {
            reason: e.to_string(),
        })
    }

    /// Serialize parameters for the host's JSON parameter file.
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|e| StreamError::InvalidParams {
            reason: e.to_string(),
        })
    }
}

/// Owns the master keys and derives per-file session parameters.
///
/// A single opener serves every file of a mounted filesystem. The two ECB
/// cores are keyed once at construction; they are immutable afterwards and
/// shared freely across the host's worker threads.
#[derive(Debug)]
pub struct StreamOpener {
    content_ecb: Aes256,
    padding_ecb: Aes256,
    params: StreamParams,
}

impl StreamOpener {
    /// Build an opener from master keys and pinned parameters.
    pub fn new(keys: &MasterKeys, params: StreamParams) -> Result<Self, StreamError> {
        if params.iv_size != GCM_IV_SIZE {
            return Err(StreamError::InvalidParams {
                reason: format!(
                    "iv size {} not supported, this build uses {GCM_IV_SIZE}-byte GCM nonces",
                    params.iv_size
                ),
            });
        }
        if params.block_size == 0 {
            return Err(StreamError::InvalidParams {
                reason: "block size must be positive".to_owned(),
            });
        }
        let content_ecb =
            keys.with_content_key(|k| Aes256::new(GenericArray::from_slice(k)));
        let padding_ecb =
            keys.with_padding_key(|k| Aes256::new(GenericArray::from_slice(k)));
        Ok(StreamOpener {
            content_ecb,
            padding_ecb,
            params,
        })
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    /// Open (or initialize) the encrypted stream for one file.
    ///
    /// Takes the stream's exclusive lock for the duration of the header
    /// handshake; the caller is responsible for per-operation locking
    /// afterwards (see [`crate::fs::File`]).
    #[instrument(level = "debug", skip(self, base))]
    pub fn open<S: ByteStream>(&self, base: S) -> Result<AesGcmCryptStream<S>, StreamError> {
        AesGcmCryptStream::open(
            base,
            self,
            self.params.block_size,
            self.params.iv_size,
            self.params.skip_verification,
        )
    }
}

impl ParamCalculator for StreamOpener {
    fn compute_session_key(&self, id: &[u8; ID_SIZE]) -> Zeroizing<[u8; 16]> {
        let mut block = Block::clone_from_slice(id);
        self.content_ecb.encrypt_block(&mut block);
        Zeroizing::new(block.into())
    }

    fn compute_padding(&self, id: &[u8; ID_SIZE]) -> u32 {
        if self.params.max_padding_size == 0 {
            return 0;
        }
        let mut block = Block::clone_from_slice(id);
        self.padding_ecb.encrypt_block(&mut block);
        let bytes: [u8; 16] = block.into();
        let value = u128::from_le_bytes(bytes);
        (value % (self.params.max_padding_size as u128 + 1)) as u32
    }
}
