//! hatsmith-crypto: primitive provider and container codec for hatsmith
//!
//! Architecture: one authenticated secret stream per file
//!
//! ```text
//! password ──Argon2id(salt)──┐
//!                            ├─► SessionKey ──HKDF(header)──► stream key
//! X25519(priv, peer) ─HKDF───┘
//!
//! container: signature | salt? | header | chunk_0 .. chunk_n(FINAL)
//! chunk_i  = XChaCha20-Poly1305(stream key, nonce = header[..16] || u64_le(i), tag_byte || data)
//! ```

pub mod container;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod passwords;
pub mod provider;
pub mod secretstream;

pub use container::{ContainerError, ContainerHeader, ContainerKind, ContainerReader, ContainerWriter};
pub use error::CryptoError;
pub use kdf::{derive_session_key, generate_salt, KdfParams, SessionKey};
pub use keys::{compute_public_key, derive_shared_key, KeyError, KeyPair, Role};
pub use passwords::{generate_passphrase, generate_password};
pub use provider::Provider;
pub use secretstream::{PullStream, PushStream, StreamHeader, Tag};

/// Size of a session key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the public password salt stored in symmetric containers
pub const SALT_SIZE: usize = 16;

/// Size of the secret stream header
pub const HEADER_SIZE: usize = 24;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Per-chunk ciphertext overhead: encrypted tag byte + Poly1305 tag
pub const ABYTES: usize = 1 + TAG_SIZE;
