//! Transfer coordinator: single-owner state machine driving one job at a time
//!
//! ```text
//! Idle ──prepare──► AwaitingKey ──first chunk──► Streaming ──FINAL──► Draining ──► Closed
//!   ▲                                                                              │
//!   └──────────────── reset / sequencing error / cancellation ◄────────────────────┘
//! any state ──primitive failure──► Errored ──reset──► Idle
//! ```
//!
//! Messages are handled strictly one after another, so no two chunks of a
//! job are ever sealed concurrently.

use bytes::Bytes;
use hatsmith_core::config::HatsmithConfig;
use hatsmith_core::types::Direction;
use hatsmith_crypto::container::{self, ContainerKind};
use hatsmith_crypto::{
    derive_session_key, derive_shared_key, generate_salt, KdfParams, KeyError, Provider, Role,
    SessionKey, SALT_SIZE,
};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::message::{ChunkMessage, ControlMessage, KeyPairMode, Reply};
use crate::pipe::{DownloadHub, OutputStream};
use crate::session::CipherSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    AwaitingKey,
    Streaming,
    Draining,
    Closed,
    Errored,
}

/// Settings the coordinator and its hub need.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub kdf: KdfParams,
    pub pipe_capacity: usize,
    pub inbox_capacity: usize,
    pub default_file_name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&HatsmithConfig::default())
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &HatsmithConfig) -> Self {
        Self {
            kdf: KdfParams {
                mem_cost_kib: config.crypto.argon2_mem_cost_kib,
                time_cost: config.crypto.argon2_time_cost,
                parallelism: config.crypto.argon2_parallelism,
            },
            pipe_capacity: config.transfer.pipe_capacity,
            inbox_capacity: config.transfer.inbox_capacity,
            default_file_name: config.download.default_file_name.clone(),
        }
    }
}

pub struct TransferCoordinator {
    state: CoordinatorState,
    direction: Option<Direction>,
    file_name: Option<String>,
    session: CipherSession,
    hub: DownloadHub,
    output: Option<OutputStream>,
    kdf: KdfParams,
    next_index: u64,
}

impl TransferCoordinator {
    pub fn new(provider: Provider, hub: DownloadHub, kdf: KdfParams) -> Self {
        Self {
            state: CoordinatorState::Idle,
            direction: None,
            file_name: None,
            session: CipherSession::new(provider),
            hub,
            output: None,
            kdf,
            next_index: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn hub(&self) -> &DownloadHub {
        &self.hub
    }

    /// Handle one message and produce its reply.
    pub async fn handle(&mut self, msg: ControlMessage) -> Reply {
        let encrypt_side = msg.is_encrypt_side();
        let name = msg.name();
        debug!(message = ?msg, state = ?self.state, "control message");

        if self.state == CoordinatorState::Errored
            && !matches!(
                msg,
                ControlMessage::ResetSwState
                    | ControlMessage::CheckFile { .. }
                    | ControlMessage::RequestDownloadReady
            )
        {
            return error_reply(
                encrypt_side,
                TransferError::Sequencing(format!("{name} while errored; reset required")),
            );
        }

        let result = match msg {
            ControlMessage::PrepareFileNameEnc { file_name } => {
                Ok(self.prepare(Direction::Encrypt, file_name))
            }
            ControlMessage::PrepareFileNameDec { file_name } => {
                Ok(self.prepare(Direction::Decrypt, file_name))
            }
            ControlMessage::RequestEncryption { password } => {
                self.request_encryption(password).await
            }
            ControlMessage::RequestEncKeyPair {
                private_key,
                public_key,
                mode,
            } => self.request_enc_key_pair(&private_key, &public_key, mode),
            ControlMessage::EncryptFirstChunk(chunk) => self.encrypt_first(chunk, false).await,
            ControlMessage::AsymmetricEncryptFirstChunk(chunk) => {
                self.encrypt_first(chunk, true).await
            }
            ControlMessage::EncryptRestOfChunks(chunk) => self.encrypt_rest(chunk).await,
            ControlMessage::CheckFile { signature, legacy } => {
                Ok(check_file(&signature, &legacy))
            }
            ControlMessage::RequestTestDecryption {
                password,
                signature,
                salt,
                header,
                sample,
            } => {
                self.request_test_decryption(password, &signature, &salt, &header, &sample)
                    .await
            }
            ControlMessage::RequestDecryption {
                password,
                signature,
                salt,
                header,
            } => {
                self.request_decryption(password, &signature, &salt, &header)
                    .await
            }
            ControlMessage::RequestDecKeyPair {
                private_key,
                public_key,
                header,
                dec_file_buff,
                mode,
            } => self.request_dec_key_pair(&private_key, &public_key, &header, &dec_file_buff, mode),
            ControlMessage::DecryptFirstChunk(chunk) => self.decrypt_first(chunk).await,
            ControlMessage::DecryptRestOfChunks(chunk) => self.decrypt_rest(chunk).await,
            ControlMessage::RequestDownloadReady => Ok(self.download_ready()),
            ControlMessage::ResetSwState => {
                self.reset_job("reset requested");
                info!("coordinator reset");
                Ok(Reply::ResetDone)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(error) => self.fail(name, encrypt_side, error),
        }
    }

    /// Process messages until the inbox closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ControlMessage>,
        replies: mpsc::UnboundedSender<Reply>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            // a write can wait on a stalled consumer indefinitely
            let reply = tokio::select! {
                _ = cancel.cancelled() => None,
                reply = self.handle(msg) => Some(reply),
            };
            let Some(reply) = reply else {
                warn!(state = ?self.state, "shutdown while a message was in flight");
                break;
            };
            if replies.send(reply).is_err() {
                break;
            }
        }
        self.reset_job("coordinator shutting down");
        debug!("coordinator stopped");
    }

    fn fail(&mut self, name: &str, encrypt_side: bool, error: TransferError) -> Reply {
        if error.is_retryable() {
            debug!(message = name, %error, "retryable failure, state unchanged");
            return error_reply(encrypt_side, error);
        }

        let file = self.file_name.clone().unwrap_or_default();
        let reason = error.to_string();
        if let Some(output) = self.output.take() {
            output.abort(&reason);
        }
        self.session.reset();
        self.next_index = 0;

        if error == TransferError::Cancelled {
            self.state = CoordinatorState::Idle;
            info!(file = %file, "download cancelled by consumer");
            return Reply::DownloadCancelled;
        }

        self.state = if error.returns_to_idle() {
            CoordinatorState::Idle
        } else {
            CoordinatorState::Errored
        };
        warn!(file = %file, message = name, %error, state = ?self.state, "transfer failed");
        error_reply(encrypt_side, error)
    }

    /// Abort any live output and forget the job.
    fn reset_job(&mut self, reason: &str) {
        if let Some(output) = self.output.take() {
            output.abort(reason);
        }
        self.session.reset();
        self.direction = None;
        self.file_name = None;
        self.next_index = 0;
        self.state = CoordinatorState::Idle;
    }

    fn prepare(&mut self, direction: Direction, file_name: String) -> Reply {
        self.reset_job("superseded by a new job");
        self.output = Some(self.hub.arm(&file_name));
        info!(file = %file_name, %direction, "file prepared");
        self.direction = Some(direction);
        self.file_name = Some(file_name);
        self.state = CoordinatorState::AwaitingKey;
        match direction {
            Direction::Encrypt => Reply::FilePreparedEnc,
            Direction::Decrypt => Reply::FilePreparedDec,
        }
    }

    /// Ready once a consumer holds the current job's body.
    fn download_ready(&self) -> Reply {
        match &self.output {
            Some(output)
                if self.hub.is_attached(output.generation()) && !output.is_consumer_gone() =>
            {
                Reply::DownloadReady
            }
            _ => Reply::NotReady,
        }
    }

    /// Key material may change only before streaming starts.
    fn expect_key_phase(&self, direction: Direction) -> Result<(), TransferError> {
        match self.state {
            CoordinatorState::Idle | CoordinatorState::AwaitingKey | CoordinatorState::Closed => {}
            state => {
                return Err(TransferError::Sequencing(format!(
                    "key request while {state:?}"
                )))
            }
        }
        match self.direction {
            Some(d) if d != direction => Err(TransferError::Sequencing(format!(
                "{direction} key request during a {d} job"
            ))),
            _ => Ok(()),
        }
    }

    fn expect_chunk(
        &self,
        direction: Direction,
        state: CoordinatorState,
        index: u64,
    ) -> Result<(), TransferError> {
        if self.direction != Some(direction) {
            return Err(TransferError::Sequencing(format!("no {direction} job prepared")));
        }
        if self.state != state {
            return Err(TransferError::Sequencing(format!(
                "chunk {index} arrived while {:?}",
                self.state
            )));
        }
        if index != self.next_index {
            return Err(TransferError::Sequencing(format!(
                "chunk {index} arrived, expected chunk {}",
                self.next_index
            )));
        }
        Ok(())
    }

    async fn derive_password_key(
        &self,
        password: SecretString,
        salt: [u8; SALT_SIZE],
    ) -> Result<SessionKey, TransferError> {
        self.session.provider().ensure_ready()?;
        let params = self.kdf.clone();
        let key = tokio::task::spawn_blocking(move || derive_session_key(&password, &salt, &params))
            .await
            .map_err(|e| TransferError::Crypto(format!("key derivation task failed: {e}")))??;
        Ok(key)
    }

    async fn request_encryption(&mut self, password: SecretString) -> Result<Reply, TransferError> {
        self.expect_key_phase(Direction::Encrypt)?;
        let salt = generate_salt();
        let key = self.derive_password_key(password, salt).await?;
        self.session.set_key(key, Some(salt));
        debug!("password key derived");
        Ok(Reply::KeysGenerated)
    }

    fn request_enc_key_pair(
        &mut self,
        private_key: &SecretString,
        public_key: &str,
        mode: KeyPairMode,
    ) -> Result<Reply, TransferError> {
        self.expect_key_phase(Direction::Encrypt)?;
        self.session.provider().ensure_ready()?;
        let key = match derive_shared_key(private_key, public_key, Role::Sender) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "encryption key pair rejected");
                return Ok(enc_key_reply(e));
            }
        };
        Ok(match mode {
            KeyPairMode::Test => Reply::GoodKeyPair,
            KeyPairMode::Derive => {
                self.session.set_key(key, None);
                Reply::KeyPairReady
            }
        })
    }

    async fn encrypt_first(
        &mut self,
        chunk: ChunkMessage,
        asymmetric: bool,
    ) -> Result<Reply, TransferError> {
        self.expect_chunk(Direction::Encrypt, CoordinatorState::AwaitingKey, chunk.index)?;
        if !self.session.has_key() {
            return Err(TransferError::NoKey);
        }
        if asymmetric == self.session.is_password_key() {
            return Err(TransferError::Sequencing(
                "first chunk message does not match the key mode".into(),
            ));
        }

        let prefix = self.session.begin_encrypt()?;
        // prefix goes out before any ciphertext so an early reader sees a valid file start
        self.write(Bytes::from(prefix.encode())).await?;
        self.state = CoordinatorState::Streaming;
        info!(file = ?self.file_name, kind = %prefix.kind(), "encryption started");
        self.encrypt_chunk(chunk).await
    }

    async fn encrypt_rest(&mut self, chunk: ChunkMessage) -> Result<Reply, TransferError> {
        self.expect_chunk(Direction::Encrypt, CoordinatorState::Streaming, chunk.index)?;
        self.encrypt_chunk(chunk).await
    }

    async fn encrypt_chunk(&mut self, chunk: ChunkMessage) -> Result<Reply, TransferError> {
        let sealed = self.session.push_chunk(&chunk.data, chunk.last)?;
        self.write(Bytes::from(sealed)).await?;
        self.next_index += 1;
        if chunk.last {
            self.finish();
            Ok(Reply::EncryptionFinished)
        } else {
            Ok(Reply::ContinueEncryption)
        }
    }

    async fn request_test_decryption(
        &mut self,
        password: SecretString,
        signature: &[u8],
        salt: &[u8],
        header: &[u8],
        sample: &[u8],
    ) -> Result<Reply, TransferError> {
        self.expect_key_phase(Direction::Decrypt)?;
        let salt = expect_password_container(signature, salt)?;
        let key = self.derive_password_key(password, salt).await?;
        match self.session.trial_pull(&key, header, sample) {
            Ok(()) => Ok(Reply::ReadyToDecrypt),
            Err(TransferError::AuthenticationFailed) => Ok(Reply::WrongPassword),
            Err(e) => Err(e),
        }
    }

    async fn request_decryption(
        &mut self,
        password: SecretString,
        signature: &[u8],
        salt: &[u8],
        header: &[u8],
    ) -> Result<Reply, TransferError> {
        self.expect_key_phase(Direction::Decrypt)?;
        let salt = expect_password_container(signature, salt)?;
        let key = self.derive_password_key(password, salt).await?;
        self.session.set_key(key, Some(salt));
        self.session.begin_decrypt(header)?;
        debug!("password decryption key derived");
        Ok(Reply::DecKeysGenerated)
    }

    fn request_dec_key_pair(
        &mut self,
        private_key: &SecretString,
        public_key: &str,
        header: &[u8],
        sample: &[u8],
        mode: KeyPairMode,
    ) -> Result<Reply, TransferError> {
        self.expect_key_phase(Direction::Decrypt)?;
        self.session.provider().ensure_ready()?;
        let key = match derive_shared_key(private_key, public_key, Role::Recipient) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "decryption key pair rejected");
                return Ok(dec_key_reply(e));
            }
        };

        if !sample.is_empty() {
            match self.session.trial_pull(&key, header, sample) {
                Ok(()) => {}
                Err(TransferError::AuthenticationFailed) => return Ok(Reply::WrongDecKeys),
                Err(e) => return Err(e),
            }
        }

        Ok(match mode {
            KeyPairMode::Test => Reply::ReadyToDecrypt,
            KeyPairMode::Derive => {
                self.session.set_key(key, None);
                self.session.begin_decrypt(header)?;
                Reply::DecKeysGenerated
            }
        })
    }

    async fn decrypt_first(&mut self, chunk: ChunkMessage) -> Result<Reply, TransferError> {
        self.expect_chunk(Direction::Decrypt, CoordinatorState::AwaitingKey, chunk.index)?;
        if !self.session.decrypt_started() {
            return Err(TransferError::NoKey);
        }
        self.state = CoordinatorState::Streaming;
        info!(file = ?self.file_name, "decryption started");
        self.decrypt_chunk(chunk).await
    }

    async fn decrypt_rest(&mut self, chunk: ChunkMessage) -> Result<Reply, TransferError> {
        self.expect_chunk(Direction::Decrypt, CoordinatorState::Streaming, chunk.index)?;
        self.decrypt_chunk(chunk).await
    }

    async fn decrypt_chunk(&mut self, chunk: ChunkMessage) -> Result<Reply, TransferError> {
        let (plain, tag) = self.session.pull_chunk(&chunk.data)?;
        match (tag.is_final(), chunk.last) {
            (true, false) => return Err(TransferError::TrailingData),
            (false, true) => return Err(TransferError::Truncated),
            _ => {}
        }
        self.write(Bytes::from(plain)).await?;
        self.next_index += 1;
        if chunk.last {
            self.finish();
            Ok(Reply::DecryptionFinished)
        } else {
            Ok(Reply::ContinueDecryption)
        }
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), TransferError> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| TransferError::Sequencing("no output stream armed".into()))?;
        output.write(bytes).await
    }

    /// Final chunk written: close the output, then drop the session.
    fn finish(&mut self) {
        self.state = CoordinatorState::Draining;
        if let Some(output) = self.output.take() {
            info!(
                file = %output.file_name(),
                bytes = output.bytes_written(),
                chunks = self.next_index,
                "transfer finished"
            );
            output.close();
        }
        self.session.reset();
        self.state = CoordinatorState::Closed;
    }
}

fn error_reply(encrypt_side: bool, error: TransferError) -> Reply {
    if encrypt_side {
        Reply::EncryptionError { error }
    } else {
        Reply::DecryptionError { error }
    }
}

fn check_file(signature: &[u8], legacy: &[u8]) -> Reply {
    match container::detect(signature, legacy) {
        ContainerKind::Symmetric => Reply::SecretKeyEncryption,
        ContainerKind::Asymmetric => Reply::PublicKeyEncryption,
        ContainerKind::Legacy => Reply::OldVersion,
        ContainerKind::Unrecognized => Reply::BadFile,
    }
}

fn expect_password_container(signature: &[u8], salt: &[u8]) -> Result<[u8; SALT_SIZE], TransferError> {
    match container::detect(signature, signature) {
        ContainerKind::Symmetric => {}
        ContainerKind::Asymmetric => {
            return Err(TransferError::ModeMismatch(
                "file was encrypted for a key pair, not a password".into(),
            ))
        }
        ContainerKind::Legacy => return Err(TransferError::LegacyFormat),
        ContainerKind::Unrecognized => return Err(TransferError::UnrecognizedFormat),
    }
    salt.try_into().map_err(|_| {
        TransferError::BadHeader(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            salt.len()
        ))
    })
}

fn enc_key_reply(e: KeyError) -> Reply {
    match e {
        KeyError::WeakKey => Reply::WeakKey,
        KeyError::WrongKeyPair => Reply::WrongKeyPair,
        KeyError::WrongPrivateKey => Reply::WrongPrivateKey,
        KeyError::WrongPublicKey => Reply::WrongPublicKey,
        KeyError::InvalidKeyEncoding => Reply::WrongKeyInput,
    }
}

fn dec_key_reply(e: KeyError) -> Reply {
    match e {
        KeyError::WeakKey => Reply::WeakDecKey,
        KeyError::WrongKeyPair => Reply::WrongDecKeyPair,
        KeyError::WrongPrivateKey => Reply::WrongDecPrivateKey,
        KeyError::WrongPublicKey => Reply::WrongDecPublicKey,
        KeyError::InvalidKeyEncoding => Reply::WrongKeyInput,
    }
}

/// Client side of a running coordinator.
pub struct CoordinatorHandle {
    inbox: mpsc::Sender<ControlMessage>,
    replies: mpsc::UnboundedReceiver<Reply>,
    downloads_started: usize,
}

impl CoordinatorHandle {
    pub async fn send(&self, msg: ControlMessage) -> Result<(), TransferError> {
        self.inbox
            .send(msg)
            .await
            .map_err(|_| TransferError::CoordinatorClosed)
    }

    /// Send one message and wait for its reply. `DownloadStarted`
    /// notifications that arrive meanwhile are counted, not returned.
    pub async fn request(&mut self, msg: ControlMessage) -> Result<Reply, TransferError> {
        self.send(msg).await?;
        loop {
            match self.replies.recv().await {
                Some(Reply::DownloadStarted) => self.downloads_started += 1,
                Some(reply) => return Ok(reply),
                None => return Err(TransferError::CoordinatorClosed),
            }
        }
    }

    /// Wait for a consumer to attach to the armed download.
    pub async fn download_started(&mut self) -> Result<(), TransferError> {
        if self.downloads_started > 0 {
            self.downloads_started -= 1;
            return Ok(());
        }
        loop {
            match self.replies.recv().await {
                Some(Reply::DownloadStarted) => return Ok(()),
                Some(other) => warn!(reply = ?other, "unsolicited reply while waiting for download"),
                None => return Err(TransferError::CoordinatorClosed),
            }
        }
    }
}

/// Start a coordinator task. The returned hub is where consumers attach.
pub fn spawn_coordinator(
    config: &CoordinatorConfig,
    provider: Provider,
    cancel: CancellationToken,
) -> (CoordinatorHandle, DownloadHub, JoinHandle<()>) {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
    let hub = DownloadHub::new(
        config.pipe_capacity,
        config.default_file_name.clone(),
        Some(reply_tx.clone()),
    );
    let coordinator = TransferCoordinator::new(provider, hub.clone(), config.kdf.clone());
    let task = tokio::spawn(coordinator.run(inbox_rx, reply_tx, cancel));
    let handle = CoordinatorHandle {
        inbox: inbox_tx,
        replies: reply_rx,
        downloads_started: 0,
    };
    (handle, hub, task)
}
