//! Provider readiness
//!
//! A `Provider` starts not ready and flips to ready once a known-answer
//! self-test of the secret stream passes. Clones share the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::CryptoError;
use crate::kdf::SessionKey;
use crate::secretstream::{PullStream, PushStream, Tag};
use crate::KEY_SIZE;

#[derive(Debug, Clone, Default)]
pub struct Provider {
    ready: Arc<AtomicBool>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and initialize in one step.
    pub fn initialized() -> Result<Self, CryptoError> {
        let provider = Self::new();
        provider.initialize()?;
        Ok(provider)
    }

    /// Run the self-test and mark the provider ready. Idempotent.
    pub fn initialize(&self) -> Result<(), CryptoError> {
        if self.is_ready() {
            return Ok(());
        }
        self_test()?;
        self.ready.store(true, Ordering::Release);
        info!("crypto provider ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn ensure_ready(&self) -> Result<(), CryptoError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CryptoError::ProviderNotReady)
        }
    }
}

fn self_test() -> Result<(), CryptoError> {
    let key = SessionKey::from_bytes([0x5a; KEY_SIZE]);
    let (mut push, header) = PushStream::init(&key)?;
    let first = push.push(b"hatsmith", Tag::Message)?;
    let last = push.push(b"", Tag::Final)?;

    let mut pull = PullStream::init(&key, header.as_bytes())?;
    let (plain, tag) = pull.pull(&first)?;
    if plain != b"hatsmith" || tag != Tag::Message {
        return Err(CryptoError::SelfTest("round trip mismatch"));
    }

    let mut tampered = last.clone();
    tampered[0] ^= 0x01;
    if !matches!(pull.pull(&tampered), Err(CryptoError::AuthenticationFailed)) {
        return Err(CryptoError::SelfTest("tampered chunk accepted"));
    }

    let (_, tag) = pull.pull(&last)?;
    if !tag.is_final() {
        return Err(CryptoError::SelfTest("final tag lost"));
    }
    debug!("secret stream self-test passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_not_ready() {
        let p = Provider::new();
        assert!(!p.is_ready());
        assert!(matches!(p.ensure_ready(), Err(CryptoError::ProviderNotReady)));
    }

    #[test]
    fn test_initialize_shared_across_clones() {
        let p = Provider::new();
        let clone = p.clone();
        p.initialize().unwrap();
        assert!(clone.is_ready());
        clone.ensure_ready().unwrap();
        // second call is a no-op
        p.initialize().unwrap();
    }
}
