//! Frame obfuscation under the session's cipher suite
//!
//! Every frame travels as a self-delimited record:
//!
//! ```text
//! plain:  | iv (12B, random) | header (16B) | payload            |
//! AEAD:   | nonce (12B)      | header (16B) | ciphertext | tag (16B) |
//! ```
//!
//! The AEAD suites authenticate the header as associated data and encrypt
//! only the payload. Keys are taken directly from the 32-byte session key;
//! nonce uniqueness comes from the system CSPRNG.

use super::{generate_nonce, random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::mux::{Frame, MuxError, HEADER_LEN};
use bytes::Bytes;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::sync::Arc;

/// Record overhead of the plain suite (IV-equivalent prefix + header)
pub const RECORD_OVERHEAD_PLAIN: usize = NONCE_LEN + HEADER_LEN;

/// Record overhead of the AEAD suites (nonce + header + tag)
pub const RECORD_OVERHEAD_AEAD: usize = NONCE_LEN + HEADER_LEN + TAG_LEN;

/// Cipher suite selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionMethod {
    /// No confidentiality; the record keeps the prefix for framing symmetry
    Plain = 0x00,
    /// AES-256-GCM with a random 12-byte nonce per record
    Aes256Gcm = 0x01,
    /// ChaCha20-Poly1305 with a random 12-byte nonce per record
    ChaCha20Poly1305 = 0x02,
}

impl EncryptionMethod {
    /// Parse a configuration name such as `"aes-256-gcm"`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "plain" => Some(EncryptionMethod::Plain),
            "aes-256-gcm" | "aes-gcm" => Some(EncryptionMethod::Aes256Gcm),
            "chacha20-poly1305" => Some(EncryptionMethod::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl TryFrom<u8> for EncryptionMethod {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EncryptionMethod::Plain),
            0x01 => Ok(EncryptionMethod::Aes256Gcm),
            0x02 => Ok(EncryptionMethod::ChaCha20Poly1305),
            _ => Err(CryptoError::UnknownMethod(value)),
        }
    }
}

/// Per-session frame codec turning frames into opaque records and back
///
/// Implementations hold only immutable key material and are safe to call
/// from any number of tasks concurrently.
pub trait Obfuscator: Send + Sync {
    /// Serialise `frame` as a self-delimited record into `dst`, returning
    /// the record length
    ///
    /// `dst` must hold at least `overhead()` plus the larger of the payload
    /// length and `payload_cap_hint`; the hint lets callers that reuse one
    /// buffer across writes validate its capacity up front.
    fn obfuscate(
        &self,
        frame: &Frame,
        dst: &mut [u8],
        payload_cap_hint: usize,
    ) -> Result<usize, MuxError>;

    /// Recover a frame from one obfuscated record
    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, MuxError>;

    /// Bytes the record adds on top of the frame payload
    fn overhead(&self) -> usize;
}

fn check_capacity(dst: &[u8], overhead: usize, frame: &Frame, hint: usize) -> Result<(), MuxError> {
    let needed = overhead + frame.payload.len().max(hint);
    if dst.len() < needed {
        return Err(CryptoError::BufferTooSmall {
            needed,
            available: dst.len(),
        }
        .into());
    }
    Ok(())
}

/// Writes the random prefix and the header (with randomised reserved bytes)
/// into `dst`, returning the prefix for use as an AEAD nonce
fn write_prefix_and_header(frame: &Frame, dst: &mut [u8]) -> [u8; NONCE_LEN] {
    let nonce = generate_nonce();
    dst[..NONCE_LEN].copy_from_slice(&nonce);
    frame.encode_header(&mut dst[NONCE_LEN..]);
    random_bytes(&mut dst[NONCE_LEN + 13..NONCE_LEN + HEADER_LEN]);
    nonce
}

/// The no-confidentiality suite
pub struct PlainObfuscator;

impl Obfuscator for PlainObfuscator {
    fn obfuscate(
        &self,
        frame: &Frame,
        dst: &mut [u8],
        payload_cap_hint: usize,
    ) -> Result<usize, MuxError> {
        check_capacity(dst, RECORD_OVERHEAD_PLAIN, frame, payload_cap_hint)?;
        write_prefix_and_header(frame, dst);
        let body = RECORD_OVERHEAD_PLAIN;
        dst[body..body + frame.payload.len()].copy_from_slice(&frame.payload);
        Ok(body + frame.payload.len())
    }

    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, MuxError> {
        if record.len() < RECORD_OVERHEAD_PLAIN {
            return Err(CryptoError::BadPayloadLength(record.len()).into());
        }
        let (stream_id, seq, closing) = Frame::decode_header(&record[NONCE_LEN..])?;
        Ok(Frame {
            stream_id,
            seq,
            closing,
            payload: Bytes::copy_from_slice(&record[RECORD_OVERHEAD_PLAIN..]),
        })
    }

    fn overhead(&self) -> usize {
        RECORD_OVERHEAD_PLAIN
    }
}

/// AEAD suite over a session key; AAD is the 16-byte frame header
struct AeadObfuscator {
    key: LessSafeKey,
}

impl Obfuscator for AeadObfuscator {
    fn obfuscate(
        &self,
        frame: &Frame,
        dst: &mut [u8],
        payload_cap_hint: usize,
    ) -> Result<usize, MuxError> {
        check_capacity(dst, RECORD_OVERHEAD_AEAD, frame, payload_cap_hint)?;
        let nonce = write_prefix_and_header(frame, dst);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&dst[NONCE_LEN..NONCE_LEN + HEADER_LEN]);

        let body = NONCE_LEN + HEADER_LEN;
        let payload_len = frame.payload.len();
        dst[body..body + payload_len].copy_from_slice(&frame.payload);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(header),
                &mut dst[body..body + payload_len],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        dst[body + payload_len..body + payload_len + TAG_LEN].copy_from_slice(tag.as_ref());

        Ok(RECORD_OVERHEAD_AEAD + payload_len)
    }

    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, MuxError> {
        if record.len() < RECORD_OVERHEAD_AEAD {
            return Err(CryptoError::BadPayloadLength(record.len()).into());
        }
        let (stream_id, seq, closing) = Frame::decode_header(&record[NONCE_LEN..])?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&record[..NONCE_LEN]);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&record[NONCE_LEN..NONCE_LEN + HEADER_LEN]);

        let mut body = record[NONCE_LEN + HEADER_LEN..].to_vec();
        let plaintext_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(header),
                &mut body,
            )
            .map_err(|_| CryptoError::DecryptionFailed)?
            .len();
        body.truncate(plaintext_len);

        Ok(Frame {
            stream_id,
            seq,
            closing,
            payload: Bytes::from(body),
        })
    }

    fn overhead(&self) -> usize {
        RECORD_OVERHEAD_AEAD
    }
}

/// Construct the obfuscator for a cipher suite and 32-byte session key
pub fn make_obfuscator(
    method: EncryptionMethod,
    session_key: [u8; KEY_LEN],
) -> Result<Arc<dyn Obfuscator>, CryptoError> {
    match method {
        EncryptionMethod::Plain => Ok(Arc::new(PlainObfuscator)),
        EncryptionMethod::Aes256Gcm => {
            let key = UnboundKey::new(&AES_256_GCM, &session_key)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(Arc::new(AeadObfuscator {
                key: LessSafeKey::new(key),
            }))
        }
        EncryptionMethod::ChaCha20Poly1305 => {
            let key = UnboundKey::new(&CHACHA20_POLY1305, &session_key)
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            Ok(Arc::new(AeadObfuscator {
                key: LessSafeKey::new(key),
            }))
        }
    }
}
