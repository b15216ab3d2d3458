//! Incremental authenticated stream with MESSAGE/FINAL chunk tags
//!
//! Sealed chunk format:
//! ```text
//! XChaCha20-Poly1305(stream_key, nonce_i, [1 byte: tag][N bytes: data]) → N + 17 bytes
//! stream_key = HKDF-SHA256(salt = header, ikm = session key, info = "hatsmith-secretstream-v2")
//! nonce_i    = header[0..16] || u64_le(i)
//! ```
//!
//! The counter binds every chunk to its position, so reordering, dropping or
//! duplicating chunks fails authentication. The tag byte is inside the AEAD,
//! so a truncation that strips the FINAL chunk is detectable by the reader.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::SessionKey;
use crate::{ABYTES, HEADER_SIZE, KEY_SIZE, NONCE_SIZE};

const STREAM_INFO: &[u8] = b"hatsmith-secretstream-v2";
const NONCE_PREFIX_SIZE: usize = 16;

/// Chunk tag carried inside each sealed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// More chunks follow
    Message = 0x00,
    /// Last chunk of the stream
    Final = 0x03,
}

impl Tag {
    pub fn from_last(last: bool) -> Self {
        if last {
            Tag::Final
        } else {
            Tag::Message
        }
    }

    pub fn is_final(self) -> bool {
        self == Tag::Final
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Tag::Message),
            0x03 => Some(Tag::Final),
            _ => None,
        }
    }
}

/// Public per-stream header, written once ahead of the first chunk.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamHeader([u8; HEADER_SIZE]);

impl StreamHeader {
    pub fn generate() -> Self {
        let mut bytes = [0u8; HEADER_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; HEADER_SIZE] = bytes.try_into().map_err(|_| CryptoError::BadHeader {
            expected: HEADER_SIZE,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for StreamHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamHeader({} bytes)", HEADER_SIZE)
    }
}

/// Cipher plus position shared by both stream directions.
struct StreamState {
    cipher: XChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u64,
    finished: bool,
}

impl StreamState {
    fn new(key: &SessionKey, header: &StreamHeader) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(header.as_bytes()), key.as_bytes());
        let mut stream_key = [0u8; KEY_SIZE];
        hkdf.expand(STREAM_INFO, &mut stream_key)
            .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
        let cipher = XChaCha20Poly1305::new((&stream_key).into());
        stream_key.zeroize();

        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        nonce_prefix.copy_from_slice(&header.as_bytes()[..NONCE_PREFIX_SIZE]);

        Ok(Self {
            cipher,
            nonce_prefix,
            counter: 0,
            finished: false,
        })
    }

    fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&self.counter.to_le_bytes());
        nonce
    }

    fn advance(&mut self, tag: Tag) -> Result<(), CryptoError> {
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::StreamFinished)?;
        if tag.is_final() {
            self.finished = true;
        }
        Ok(())
    }
}

/// Encrypting side of a secret stream.
pub struct PushStream {
    state: StreamState,
}

impl PushStream {
    /// Start a new stream under `key`, returning the header the reader needs.
    pub fn init(key: &SessionKey) -> Result<(Self, StreamHeader), CryptoError> {
        let header = StreamHeader::generate();
        let state = StreamState::new(key, &header)?;
        Ok((Self { state }, header))
    }

    /// Seal one chunk. Fails with `StreamFinished` once a FINAL chunk was pushed.
    pub fn push(&mut self, plaintext: &[u8], tag: Tag) -> Result<Vec<u8>, CryptoError> {
        if self.state.finished {
            return Err(CryptoError::StreamFinished);
        }

        let mut framed = Vec::with_capacity(1 + plaintext.len());
        framed.push(tag as u8);
        framed.extend_from_slice(plaintext);

        let nonce = self.state.nonce();
        let sealed = self
            .state
            .cipher
            .encrypt(XNonce::from_slice(&nonce), framed.as_slice())
            .map_err(|_| CryptoError::Encryption)?;
        framed.zeroize();

        self.state.advance(tag)?;
        Ok(sealed)
    }

    /// Chunks sealed so far.
    pub fn position(&self) -> u64 {
        self.state.counter
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }
}

/// Decrypting side of a secret stream.
pub struct PullStream {
    state: StreamState,
}

impl PullStream {
    /// Fails with `BadHeader` when `header` is not exactly `HEADER_SIZE` bytes.
    pub fn init(key: &SessionKey, header: &[u8]) -> Result<Self, CryptoError> {
        let header = StreamHeader::from_slice(header)?;
        let state = StreamState::new(key, &header)?;
        Ok(Self { state })
    }

    /// Open one chunk. Every failure to verify is reported as `AuthenticationFailed`.
    ///
    /// A failed pull does not advance the stream.
    pub fn pull(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, Tag), CryptoError> {
        if self.state.finished {
            return Err(CryptoError::StreamFinished);
        }
        if ciphertext.len() < ABYTES {
            return Err(CryptoError::AuthenticationFailed);
        }

        let nonce = self.state.nonce();
        let mut framed = self
            .state
            .cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let tag = match framed.first().copied().and_then(Tag::from_byte) {
            Some(tag) => tag,
            None => {
                framed.zeroize();
                return Err(CryptoError::AuthenticationFailed);
            }
        };
        let plaintext = framed[1..].to_vec();
        framed.zeroize();

        self.state.advance(tag)?;
        Ok((plaintext, tag))
    }

    pub fn position(&self) -> u64 {
        self.state.counter
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> SessionKey {
        SessionKey::from_bytes([b; KEY_SIZE])
    }

    #[test]
    fn test_push_pull_roundtrip() {
        let k = key(1);
        let (mut push, header) = PushStream::init(&k).unwrap();
        let c1 = push.push(b"ab", Tag::Message).unwrap();
        let c2 = push.push(b"cd", Tag::Final).unwrap();

        let mut pull = PullStream::init(&k, header.as_bytes()).unwrap();
        assert_eq!(pull.pull(&c1).unwrap(), (b"ab".to_vec(), Tag::Message));
        assert_eq!(pull.pull(&c2).unwrap(), (b"cd".to_vec(), Tag::Final));
        assert!(pull.is_finished());
    }

    #[test]
    fn test_chunk_overhead() {
        let (mut push, _) = PushStream::init(&key(1)).unwrap();
        let sealed = push.push(&[0u8; 100], Tag::Message).unwrap();
        assert_eq!(sealed.len(), 100 + ABYTES);
        let empty = push.push(b"", Tag::Final).unwrap();
        assert_eq!(empty.len(), ABYTES);
    }

    #[test]
    fn test_push_after_final_fails() {
        let (mut push, _) = PushStream::init(&key(1)).unwrap();
        push.push(b"x", Tag::Final).unwrap();
        assert!(matches!(
            push.push(b"y", Tag::Message),
            Err(CryptoError::StreamFinished)
        ));
    }

    #[test]
    fn test_pull_after_final_fails() {
        let k = key(1);
        let (mut push, header) = PushStream::init(&k).unwrap();
        let c = push.push(b"x", Tag::Final).unwrap();
        let mut pull = PullStream::init(&k, header.as_bytes()).unwrap();
        pull.pull(&c).unwrap();
        assert!(matches!(pull.pull(&c), Err(CryptoError::StreamFinished)));
    }

    #[test]
    fn test_bad_header_length() {
        let result = PullStream::init(&key(1), &[0u8; HEADER_SIZE - 1]);
        assert!(matches!(
            result,
            Err(CryptoError::BadHeader {
                expected: HEADER_SIZE,
                got: 23
            })
        ));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let (mut push, header) = PushStream::init(&key(1)).unwrap();
        let c = push.push(b"secret", Tag::Final).unwrap();
        let mut pull = PullStream::init(&key(2), header.as_bytes()).unwrap();
        assert!(matches!(pull.pull(&c), Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_reordered_chunks_fail() {
        let k = key(1);
        let (mut push, header) = PushStream::init(&k).unwrap();
        let _c1 = push.push(b"one", Tag::Message).unwrap();
        let c2 = push.push(b"two", Tag::Final).unwrap();
        let mut pull = PullStream::init(&k, header.as_bytes()).unwrap();
        assert!(matches!(pull.pull(&c2), Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_failed_pull_does_not_advance() {
        let k = key(1);
        let (mut push, header) = PushStream::init(&k).unwrap();
        let c1 = push.push(b"one", Tag::Message).unwrap();
        let mut pull = PullStream::init(&k, header.as_bytes()).unwrap();

        let mut bad = c1.clone();
        bad[0] ^= 1;
        assert!(pull.pull(&bad).is_err());
        assert_eq!(pull.position(), 0);
        assert_eq!(pull.pull(&c1).unwrap().0, b"one");
    }

    #[test]
    fn test_short_ciphertext_is_authentication_failure() {
        let mut pull = PullStream::init(&key(1), &[0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(
            pull.pull(&[0u8; ABYTES - 1]),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_headers_are_unique() {
        let (_, h1) = PushStream::init(&key(1)).unwrap();
        let (_, h2) = PushStream::init(&key(1)).unwrap();
        assert_ne!(h1, h2);
    }
}
