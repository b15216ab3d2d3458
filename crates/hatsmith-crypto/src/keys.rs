//! X25519 key pairs and validated key exchange
//!
//! Keys travel as URL-safe base64 without padding. Before a shared key is
//! derived the pair is validated in a fixed order, each step failing fast:
//!
//! 1. all-zero private or public key → `WeakKey`
//! 2. private == public (same key pasted twice) → `WrongKeyPair`
//! 3. supplied public key is the private key's own public key → `WrongKeyPair`
//! 4. wrong lengths → `WrongPrivateKey` / `WrongPublicKey`

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::kdf::SessionKey;
use crate::KEY_SIZE;

const KX_INFO: &[u8] = b"hatsmith-kx-v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("weak key: all-zero key or low-order shared secret")]
    WeakKey,
    #[error("private and public key belong to the same key pair")]
    WrongKeyPair,
    #[error("private key has the wrong length")]
    WrongPrivateKey,
    #[error("public key has the wrong length")]
    WrongPublicKey,
    #[error("key is not valid base64")]
    InvalidKeyEncoding,
}

/// Which side of the exchange the local private key belongs to.
///
/// Both sides must feed the public keys into HKDF in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Recipient,
}

/// A freshly generated X25519 key pair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn private_key(&self) -> SecretString {
        let bytes = Zeroizing::new(self.secret.to_bytes());
        SecretString::from(URL_SAFE_NO_PAD.encode(bytes.as_slice()))
    }

    pub fn public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public_key())
            .finish()
    }
}

fn decode(key: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    URL_SAFE_NO_PAD
        .decode(key.trim().trim_end_matches('='))
        .map(Zeroizing::new)
        .map_err(|_| KeyError::InvalidKeyEncoding)
}

fn to_array(bytes: &[u8], err: KeyError) -> Result<[u8; KEY_SIZE], KeyError> {
    bytes.try_into().map_err(|_| err)
}

/// Derive the public key that belongs to a private key.
pub fn compute_public_key(private_key: &SecretString) -> Result<String, KeyError> {
    let raw = decode(private_key.expose_secret())?;
    let mut bytes = to_array(&raw, KeyError::WrongPrivateKey)?;
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    Ok(URL_SAFE_NO_PAD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Validate a (private, peer public) pair and derive the shared session key.
pub fn derive_shared_key(
    private_key: &SecretString,
    public_key: &str,
    role: Role,
) -> Result<SessionKey, KeyError> {
    let private_raw = decode(private_key.expose_secret())?;
    let public_raw = decode(public_key)?;

    if is_all_zero(&private_raw) || is_all_zero(&public_raw) {
        return Err(KeyError::WeakKey);
    }

    if private_key.expose_secret().trim() == public_key.trim() {
        return Err(KeyError::WrongKeyPair);
    }

    if private_raw.len() == KEY_SIZE {
        let mut bytes = to_array(&private_raw, KeyError::WrongPrivateKey)?;
        let own_public = PublicKey::from(&StaticSecret::from(bytes));
        bytes.zeroize();
        if bool::from(own_public.as_bytes().as_slice().ct_eq(public_raw.as_slice())) {
            return Err(KeyError::WrongKeyPair);
        }
    }

    let mut private_bytes = to_array(&private_raw, KeyError::WrongPrivateKey)?;
    let public_bytes = to_array(&public_raw, KeyError::WrongPublicKey)?;

    let secret = StaticSecret::from(private_bytes);
    private_bytes.zeroize();
    let own_public = PublicKey::from(&secret);
    let peer_public = PublicKey::from(public_bytes);

    let shared = secret.diffie_hellman(&peer_public);
    if !shared.was_contributory() {
        return Err(KeyError::WeakKey);
    }

    let mut binding = [0u8; 2 * KEY_SIZE];
    let (sender, recipient) = match role {
        Role::Sender => (own_public.as_bytes(), peer_public.as_bytes()),
        Role::Recipient => (peer_public.as_bytes(), own_public.as_bytes()),
    };
    binding[..KEY_SIZE].copy_from_slice(sender);
    binding[KEY_SIZE..].copy_from_slice(recipient);

    let hkdf = Hkdf::<Sha256>::new(Some(&binding), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    // 32 bytes is always a valid HKDF-SHA256 output length
    hkdf.expand(KX_INFO, &mut okm)
        .map_err(|_| KeyError::WeakKey)?;

    let key = SessionKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

fn is_all_zero(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bool::from(bytes.iter().fold(0u8, |acc, b| acc | b).ct_eq(&0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    #[test]
    fn test_exchange_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let enc = derive_shared_key(&alice.private_key(), &bob.public_key(), Role::Sender).unwrap();
        let dec =
            derive_shared_key(&bob.private_key(), &alice.public_key(), Role::Recipient).unwrap();
        assert_eq!(enc.as_bytes(), dec.as_bytes());
    }

    #[test]
    fn test_role_mismatch_disagrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let enc = derive_shared_key(&alice.private_key(), &bob.public_key(), Role::Sender).unwrap();
        let dec = derive_shared_key(&bob.private_key(), &alice.public_key(), Role::Sender).unwrap();
        assert_ne!(enc.as_bytes(), dec.as_bytes());
    }

    #[test]
    fn test_compute_public_key() {
        let pair = KeyPair::generate();
        assert_eq!(compute_public_key(&pair.private_key()).unwrap(), pair.public_key());
    }

    #[test]
    fn test_weak_zero_keys() {
        let pair = KeyPair::generate();
        let zero = b64(&[0u8; KEY_SIZE]);

        assert_eq!(
            derive_shared_key(&SecretString::from(zero.clone()), &pair.public_key(), Role::Sender)
                .unwrap_err(),
            KeyError::WeakKey
        );
        assert_eq!(
            derive_shared_key(&pair.private_key(), &zero, Role::Sender).unwrap_err(),
            KeyError::WeakKey
        );
    }

    #[test]
    fn test_same_key_twice() {
        let pair = KeyPair::generate();
        let public = pair.public_key();
        assert_eq!(
            derive_shared_key(&SecretString::from(public.clone()), &public, Role::Sender)
                .unwrap_err(),
            KeyError::WrongKeyPair
        );
    }

    #[test]
    fn test_own_public_key_rejected() {
        let pair = KeyPair::generate();
        assert_eq!(
            derive_shared_key(&pair.private_key(), &pair.public_key(), Role::Sender).unwrap_err(),
            KeyError::WrongKeyPair
        );
    }

    #[test]
    fn test_wrong_lengths() {
        let pair = KeyPair::generate();
        let short = b64(&[9u8; 16]);

        assert_eq!(
            derive_shared_key(&SecretString::from(short.clone()), &pair.public_key(), Role::Sender)
                .unwrap_err(),
            KeyError::WrongPrivateKey
        );
        assert_eq!(
            derive_shared_key(&pair.private_key(), &short, Role::Sender).unwrap_err(),
            KeyError::WrongPublicKey
        );
    }

    #[test]
    fn test_weak_check_precedes_length_check() {
        let pair = KeyPair::generate();
        let short_zero = b64(&[0u8; 5]);
        assert_eq!(
            derive_shared_key(&pair.private_key(), &short_zero, Role::Sender).unwrap_err(),
            KeyError::WeakKey
        );
    }

    #[test]
    fn test_invalid_encoding() {
        let pair = KeyPair::generate();
        assert_eq!(
            derive_shared_key(&pair.private_key(), "not base64!!", Role::Sender).unwrap_err(),
            KeyError::InvalidKeyEncoding
        );
    }

    #[test]
    fn test_low_order_point_is_weak() {
        let pair = KeyPair::generate();
        // u = 1 is a small-order point; the shared secret is all zeros
        let mut one = [0u8; KEY_SIZE];
        one[0] = 1;
        assert_eq!(
            derive_shared_key(&pair.private_key(), &b64(&one), Role::Sender).unwrap_err(),
            KeyError::WeakKey
        );
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate();
        let debug = format!("{pair:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(pair.private_key().expose_secret()));
    }
}
