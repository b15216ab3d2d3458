use crate::keys::KeyError;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto provider is not ready")]
    ProviderNotReady,

    /// The only failure a decrypting caller ever sees for bad data or a wrong key.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("bad stream header: expected {expected} bytes, got {got}")]
    BadHeader { expected: usize, got: usize },

    #[error("secret stream already finished")]
    StreamFinished,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed")]
    Encryption,

    #[error("provider self-test failed: {0}")]
    SelfTest(&'static str),

    #[error(transparent)]
    Key(#[from] KeyError),
}
