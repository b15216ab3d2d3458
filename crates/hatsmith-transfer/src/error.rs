use hatsmith_crypto::{ContainerError, CryptoError, KeyError};

/// Typed failure reported back to whoever initiated a transfer step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("crypto provider is not ready")]
    ProviderNotReady,

    #[error("crypto provider still not ready after {attempts} attempts")]
    ProviderTimeout { attempts: u32 },

    #[error("no key has been derived for this transfer")]
    NoKey,

    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("authentication failed: wrong password/key or corrupted data")]
    AuthenticationFailed,

    #[error("protocol sequencing error: {0}")]
    Sequencing(String),

    #[error("unrecognized file format")]
    UnrecognizedFormat,

    #[error("file was encrypted with an older version; upgrade required")]
    LegacyFormat,

    #[error("encrypted file is truncated")]
    Truncated,

    #[error("data found after the final chunk")]
    TrailingData,

    #[error("key material does not match the file: {0}")]
    ModeMismatch(String),

    #[error("invalid key: {0}")]
    Key(KeyError),

    #[error("download cancelled by the consumer")]
    Cancelled,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("coordinator unavailable")]
    CoordinatorClosed,
}

impl TransferError {
    /// Worth retrying after a bounded wait; the job is untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::ProviderNotReady)
    }

    /// Failures that abort the job and send the coordinator back to idle
    /// instead of the errored state.
    pub fn returns_to_idle(&self) -> bool {
        matches!(
            self,
            TransferError::Sequencing(_) | TransferError::NoKey | TransferError::Cancelled
        )
    }
}

impl From<CryptoError> for TransferError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::ProviderNotReady => TransferError::ProviderNotReady,
            CryptoError::AuthenticationFailed => TransferError::AuthenticationFailed,
            CryptoError::BadHeader { .. } => TransferError::BadHeader(e.to_string()),
            CryptoError::StreamFinished => {
                TransferError::Sequencing("chunk after the final chunk".into())
            }
            CryptoError::Key(k) => TransferError::Key(k),
            other => TransferError::Crypto(other.to_string()),
        }
    }
}

impl From<ContainerError> for TransferError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::UnrecognizedFormat => TransferError::UnrecognizedFormat,
            ContainerError::LegacyFormat => TransferError::LegacyFormat,
            ContainerError::Truncated => TransferError::Truncated,
            ContainerError::TrailingData => TransferError::TrailingData,
            ContainerError::Crypto(c) => c.into(),
            ContainerError::Io(io) => TransferError::Io(io.to_string()),
        }
    }
}

impl From<KeyError> for TransferError {
    fn from(e: KeyError) -> Self {
        TransferError::Key(e)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}
