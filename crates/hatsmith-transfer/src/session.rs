//! Cipher session: one ordered run of sealed chunks under one key
//!
//! Enforces the header-once and final-once rules on top of the secret
//! stream, and gates every operation on provider readiness.

use hatsmith_crypto::{
    ContainerHeader, Provider, PullStream, PushStream, SessionKey, Tag, SALT_SIZE,
};

use crate::error::TransferError;

pub struct CipherSession {
    provider: Provider,
    key: Option<SessionKey>,
    salt: Option<[u8; SALT_SIZE]>,
    push: Option<PushStream>,
    pull: Option<PullStream>,
}

impl CipherSession {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            key: None,
            salt: None,
            push: None,
            pull: None,
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Install the key for this transfer. `salt` is set for password-derived keys.
    pub fn set_key(&mut self, key: SessionKey, salt: Option<[u8; SALT_SIZE]>) {
        self.push = None;
        self.pull = None;
        self.key = Some(key);
        self.salt = salt;
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_password_key(&self) -> bool {
        self.salt.is_some()
    }

    pub fn decrypt_started(&self) -> bool {
        self.pull.is_some()
    }

    /// Start encrypting, returning the container prefix to write before any chunk.
    pub fn begin_encrypt(&mut self) -> Result<ContainerHeader, TransferError> {
        self.provider.ensure_ready()?;
        let key = self.key.as_ref().ok_or(TransferError::NoKey)?;
        if self.push.is_some() {
            return Err(TransferError::Sequencing(
                "session header already emitted".into(),
            ));
        }

        let (stream, header) = PushStream::init(key)?;
        self.push = Some(stream);
        Ok(match self.salt {
            Some(salt) => ContainerHeader::Symmetric { salt, header },
            None => ContainerHeader::Asymmetric { header },
        })
    }

    pub fn push_chunk(&mut self, plaintext: &[u8], last: bool) -> Result<Vec<u8>, TransferError> {
        self.provider.ensure_ready()?;
        let stream = self
            .push
            .as_mut()
            .ok_or_else(|| TransferError::Sequencing("encryption has not begun".into()))?;
        Ok(stream.push(plaintext, Tag::from_last(last))?)
    }

    /// Fails with `BadHeader` when `header` is not a stream header.
    pub fn begin_decrypt(&mut self, header: &[u8]) -> Result<(), TransferError> {
        self.provider.ensure_ready()?;
        let key = self.key.as_ref().ok_or(TransferError::NoKey)?;
        self.pull = Some(PullStream::init(key, header)?);
        Ok(())
    }

    pub fn pull_chunk(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, Tag), TransferError> {
        self.provider.ensure_ready()?;
        let stream = self
            .pull
            .as_mut()
            .ok_or_else(|| TransferError::Sequencing("decryption has not begun".into()))?;
        Ok(stream.pull(ciphertext)?)
    }

    /// Pull the first chunk under a throwaway stream to check the key.
    pub fn trial_pull(
        &self,
        key: &SessionKey,
        header: &[u8],
        sample: &[u8],
    ) -> Result<(), TransferError> {
        self.provider.ensure_ready()?;
        let mut stream = PullStream::init(key, header)?;
        stream.pull(sample)?;
        Ok(())
    }

    /// Drop key and stream state. Idempotent.
    pub fn reset(&mut self) {
        self.key = None;
        self.salt = None;
        self.push = None;
        self.pull = None;
    }
}

impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession")
            .field("has_key", &self.key.is_some())
            .field("password_key", &self.salt.is_some())
            .field("encrypting", &self.push.is_some())
            .field("decrypting", &self.pull.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatsmith_crypto::{ContainerKind, HEADER_SIZE, KEY_SIZE};

    fn ready_session() -> CipherSession {
        CipherSession::new(Provider::initialized().unwrap())
    }

    #[test]
    fn test_not_ready_provider() {
        let mut s = CipherSession::new(Provider::new());
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), None);
        assert_eq!(s.begin_encrypt().unwrap_err(), TransferError::ProviderNotReady);
    }

    #[test]
    fn test_no_key() {
        let mut s = ready_session();
        assert_eq!(s.begin_encrypt().unwrap_err(), TransferError::NoKey);
        assert_eq!(
            s.begin_decrypt(&[0; HEADER_SIZE]).unwrap_err(),
            TransferError::NoKey
        );
    }

    #[test]
    fn test_header_once() {
        let mut s = ready_session();
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), Some([2; SALT_SIZE]));
        let header = s.begin_encrypt().unwrap();
        assert_eq!(header.kind(), ContainerKind::Symmetric);
        assert!(matches!(s.begin_encrypt(), Err(TransferError::Sequencing(_))));
    }

    #[test]
    fn test_push_before_begin() {
        let mut s = ready_session();
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), None);
        assert!(matches!(s.push_chunk(b"x", false), Err(TransferError::Sequencing(_))));
    }

    #[test]
    fn test_push_after_final_fails_fast() {
        let mut s = ready_session();
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), None);
        s.begin_encrypt().unwrap();
        s.push_chunk(b"x", true).unwrap();
        assert!(matches!(s.push_chunk(b"y", true), Err(TransferError::Sequencing(_))));
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let key = SessionKey::from_bytes([9; KEY_SIZE]);
        let mut enc = ready_session();
        enc.set_key(key.clone(), None);
        let header = enc.begin_encrypt().unwrap();
        let c1 = enc.push_chunk(b"abc", false).unwrap();
        let c2 = enc.push_chunk(b"def", true).unwrap();

        let mut dec = ready_session();
        dec.set_key(key, None);
        dec.begin_decrypt(header.stream_header().as_bytes()).unwrap();
        assert_eq!(dec.pull_chunk(&c1).unwrap(), (b"abc".to_vec(), Tag::Message));
        assert_eq!(dec.pull_chunk(&c2).unwrap(), (b"def".to_vec(), Tag::Final));
    }

    #[test]
    fn test_bad_header() {
        let mut s = ready_session();
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), None);
        assert!(matches!(s.begin_decrypt(&[0; 5]), Err(TransferError::BadHeader(_))));
    }

    #[test]
    fn test_trial_pull_wrong_key() {
        let mut enc = ready_session();
        enc.set_key(SessionKey::from_bytes([1; KEY_SIZE]), None);
        let header = enc.begin_encrypt().unwrap();
        let sample = enc.push_chunk(b"data", true).unwrap();

        let s = ready_session();
        let h = header.stream_header().as_bytes();
        s.trial_pull(&SessionKey::from_bytes([1; KEY_SIZE]), h, &sample)
            .unwrap();
        assert_eq!(
            s.trial_pull(&SessionKey::from_bytes([2; KEY_SIZE]), h, &sample)
                .unwrap_err(),
            TransferError::AuthenticationFailed
        );
    }

    #[test]
    fn test_reset_clears_key() {
        let mut s = ready_session();
        s.set_key(SessionKey::from_bytes([1; KEY_SIZE]), Some([0; SALT_SIZE]));
        s.reset();
        assert!(!s.has_key());
        assert!(!s.is_password_key());
        s.reset();
    }
}
