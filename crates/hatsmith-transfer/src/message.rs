//! Coordinator message protocol
//!
//! Every `ControlMessage` is answered by exactly one `Reply`. `DownloadStarted`
//! is the only reply that also arrives unprompted, when a consumer attaches to
//! the armed output stream.

use bytes::Bytes;
use secrecy::SecretString;

use crate::error::TransferError;

/// Whether a key-pair request only validates the pair or also installs the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairMode {
    Test,
    Derive,
}

/// One slice of input. `index` is zero-based and strictly sequential per job.
#[derive(Clone)]
pub struct ChunkMessage {
    pub index: u64,
    pub data: Bytes,
    pub last: bool,
}

impl std::fmt::Debug for ChunkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkMessage")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("last", &self.last)
            .finish()
    }
}

/// Inbound control message.
pub enum ControlMessage {
    PrepareFileNameEnc {
        file_name: String,
    },
    PrepareFileNameDec {
        file_name: String,
    },
    RequestEncryption {
        password: SecretString,
    },
    RequestEncKeyPair {
        private_key: SecretString,
        public_key: String,
        mode: KeyPairMode,
    },
    EncryptFirstChunk(ChunkMessage),
    EncryptRestOfChunks(ChunkMessage),
    AsymmetricEncryptFirstChunk(ChunkMessage),
    CheckFile {
        signature: Bytes,
        legacy: Bytes,
    },
    /// Trial pull of the first chunk without installing the key.
    RequestTestDecryption {
        password: SecretString,
        signature: Bytes,
        salt: Bytes,
        header: Bytes,
        sample: Bytes,
    },
    RequestDecryption {
        password: SecretString,
        signature: Bytes,
        salt: Bytes,
        header: Bytes,
    },
    RequestDecKeyPair {
        private_key: SecretString,
        public_key: String,
        header: Bytes,
        /// First sealed chunk, used for the trial pull. Empty skips the check.
        dec_file_buff: Bytes,
        mode: KeyPairMode,
    },
    DecryptFirstChunk(ChunkMessage),
    DecryptRestOfChunks(ChunkMessage),
    RequestDownloadReady,
    ResetSwState,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::PrepareFileNameEnc { .. } => "prepareFileNameEnc",
            ControlMessage::PrepareFileNameDec { .. } => "prepareFileNameDec",
            ControlMessage::RequestEncryption { .. } => "requestEncryption",
            ControlMessage::RequestEncKeyPair { .. } => "requestEncKeyPair",
            ControlMessage::EncryptFirstChunk(_) => "encryptFirstChunk",
            ControlMessage::EncryptRestOfChunks(_) => "encryptRestOfChunks",
            ControlMessage::AsymmetricEncryptFirstChunk(_) => "asymmetricEncryptFirstChunk",
            ControlMessage::CheckFile { .. } => "checkFile",
            ControlMessage::RequestTestDecryption { .. } => "requestTestDecryption",
            ControlMessage::RequestDecryption { .. } => "requestDecryption",
            ControlMessage::RequestDecKeyPair { .. } => "requestDecKeyPair",
            ControlMessage::DecryptFirstChunk(_) => "decryptFirstChunk",
            ControlMessage::DecryptRestOfChunks(_) => "decryptRestOfChunks",
            ControlMessage::RequestDownloadReady => "requestDownloadReady",
            ControlMessage::ResetSwState => "resetSWState",
        }
    }

    /// Messages belonging to the encrypt direction answer errors with
    /// `EncryptionError`, everything else with `DecryptionError`.
    pub fn is_encrypt_side(&self) -> bool {
        matches!(
            self,
            ControlMessage::PrepareFileNameEnc { .. }
                | ControlMessage::RequestEncryption { .. }
                | ControlMessage::RequestEncKeyPair { .. }
                | ControlMessage::EncryptFirstChunk(_)
                | ControlMessage::EncryptRestOfChunks(_)
                | ControlMessage::AsymmetricEncryptFirstChunk(_)
        )
    }
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::PrepareFileNameEnc { file_name }
            | ControlMessage::PrepareFileNameDec { file_name } => f
                .debug_struct(self.name())
                .field("file_name", file_name)
                .finish(),
            ControlMessage::EncryptFirstChunk(c)
            | ControlMessage::EncryptRestOfChunks(c)
            | ControlMessage::AsymmetricEncryptFirstChunk(c)
            | ControlMessage::DecryptFirstChunk(c)
            | ControlMessage::DecryptRestOfChunks(c) => {
                f.debug_tuple(self.name()).field(c).finish()
            }
            ControlMessage::RequestEncKeyPair { mode, .. }
            | ControlMessage::RequestDecKeyPair { mode, .. } => f
                .debug_struct(self.name())
                .field("mode", mode)
                .finish_non_exhaustive(),
            _ => f.write_str(self.name()),
        }
    }
}

/// Outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    FilePreparedEnc,
    FilePreparedDec,
    KeysGenerated,
    KeyPairReady,
    GoodKeyPair,
    WrongKeyPair,
    WrongPrivateKey,
    WrongPublicKey,
    WeakKey,
    /// A key could not be decoded at all.
    WrongKeyInput,
    ContinueEncryption,
    EncryptionFinished,
    ContinueDecryption,
    DecryptionFinished,
    DecKeysGenerated,
    ReadyToDecrypt,
    WrongPassword,
    WrongDecKeys,
    WeakDecKey,
    WrongDecKeyPair,
    WrongDecPrivateKey,
    WrongDecPublicKey,
    SecretKeyEncryption,
    PublicKeyEncryption,
    OldVersion,
    BadFile,
    EncryptionError { error: TransferError },
    DecryptionError { error: TransferError },
    DownloadStarted,
    DownloadReady,
    NotReady,
    DownloadCancelled,
    ResetDone,
}

impl Reply {
    /// The error carried by an error reply, if any.
    pub fn error(&self) -> Option<&TransferError> {
        match self {
            Reply::EncryptionError { error } | Reply::DecryptionError { error } => Some(error),
            _ => None,
        }
    }
}
