//! Job queue: feeds files through one coordinator, strictly one at a time
//!
//! Per job:
//! 1. reset the coordinator and prepare the output name
//! 2. wait until a consumer has attached to the download
//! 3. derive the key (retrying while the provider is not ready)
//! 4. send chunk `i + 1` only after the reply to chunk `i`

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use hatsmith_core::types::{Direction, EncryptionMode, JobState};
use hatsmith_crypto::container::{
    self, ContainerKind, LEGACY_SIGNATURE_SIZE, SIGNATURE_SIZE, SYMMETRIC_DATA_OFFSET,
};
use hatsmith_crypto::{KeyError, ABYTES, HEADER_SIZE, SALT_SIZE};
use secrecy::SecretString;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::CoordinatorHandle;
use crate::error::TransferError;
use crate::message::{ChunkMessage, ControlMessage, KeyPairMode, Reply};
use crate::producer::{read_at, read_prefix, ChunkSource};

/// Progress callback type (bytes_done, bytes_total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Called with each job's report as soon as the job ends
pub type ReportFn = Box<dyn Fn(&JobReport) + Send + Sync>;

/// Secret used for one job.
#[derive(Clone)]
pub enum KeyMaterial {
    Password(SecretString),
    /// Own private key and the other party's public key.
    KeyPair {
        private_key: SecretString,
        public_key: String,
    },
}

impl KeyMaterial {
    pub fn mode(&self) -> EncryptionMode {
        match self {
            KeyMaterial::Password(_) => EncryptionMode::Symmetric,
            KeyMaterial::KeyPair { .. } => EncryptionMode::Asymmetric,
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Password(_) => f.write_str("Password([REDACTED])"),
            KeyMaterial::KeyPair { public_key, .. } => f
                .debug_struct("KeyPair")
                .field("private_key", &"[REDACTED]")
                .field("public_key", public_key)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: Uuid,
    pub source: PathBuf,
    pub output_name: String,
    pub direction: Direction,
    pub key: KeyMaterial,
}

impl TransferJob {
    pub fn new(source: impl Into<PathBuf>, direction: Direction, key: KeyMaterial) -> Self {
        let source = source.into();
        let output_name = output_name_for(&source, direction);
        Self {
            id: Uuid::new_v4(),
            source,
            output_name,
            direction,
            key,
        }
    }

    pub fn encrypt(source: impl Into<PathBuf>, key: KeyMaterial) -> Self {
        Self::new(source, Direction::Encrypt, key)
    }

    pub fn decrypt(source: impl Into<PathBuf>, key: KeyMaterial) -> Self {
        Self::new(source, Direction::Decrypt, key)
    }
}

/// `a.txt` → `a.txt.enc` when encrypting; `a.txt.enc` → `a.txt` (else `+ .dec`) when decrypting.
pub fn output_name_for(source: &Path, direction: Direction) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    match direction {
        Direction::Encrypt => format!("{name}.enc"),
        Direction::Decrypt => match name.strip_suffix(".enc") {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ => format!("{name}.dec"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Finished {
        bytes_in: u64,
        bytes_out: u64,
        chunks: u64,
    },
    Failed(TransferError),
    /// Not started because an earlier job failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: Uuid,
    pub source: PathBuf,
    pub output_name: String,
    pub direction: Direction,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn state(&self) -> JobState {
        match self.outcome {
            JobOutcome::Finished { .. } => JobState::Finished,
            JobOutcome::Failed(_) => JobState::Errored,
            JobOutcome::Skipped => JobState::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Plaintext bytes per chunk
    pub chunk_size: usize,
    pub provider_retry_attempts: u32,
    pub provider_retry_delay: Duration,
    /// Trial-decrypt the first chunk before streaming
    pub verify_before_decrypt: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&hatsmith_core::config::HatsmithConfig::default())
    }
}

impl QueueOptions {
    pub fn from_config(config: &hatsmith_core::config::HatsmithConfig) -> Self {
        Self {
            chunk_size: config.transfer.chunk_size,
            provider_retry_attempts: config.transfer.provider_retry_attempts,
            provider_retry_delay: Duration::from_millis(config.transfer.provider_retry_delay_ms),
            verify_before_decrypt: config.transfer.verify_before_decrypt,
        }
    }
}

pub struct JobQueue {
    handle: CoordinatorHandle,
    options: QueueOptions,
    progress: Option<ProgressFn>,
    on_report: Option<ReportFn>,
    jobs: Vec<TransferJob>,
}

impl JobQueue {
    pub fn new(handle: CoordinatorHandle, options: QueueOptions) -> Self {
        Self {
            handle,
            options,
            progress: None,
            on_report: None,
            jobs: Vec::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_reports(mut self, on_report: ReportFn) -> Self {
        self.on_report = Some(on_report);
        self
    }

    pub fn push(&mut self, job: TransferJob) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job in order. After the first failure the rest are skipped.
    pub async fn run(mut self) -> Vec<JobReport> {
        let jobs = std::mem::take(&mut self.jobs);
        let mut reports = Vec::with_capacity(jobs.len());
        let mut failed = false;

        for job in jobs {
            let outcome = if failed {
                JobOutcome::Skipped
            } else {
                info!(job_id = %job.id, file = %job.source.display(), direction = %job.direction, "job started");
                match self.run_job(&job).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        warn!(job_id = %job.id, file = %job.source.display(), %error, "job failed");
                        failed = true;
                        JobOutcome::Failed(error)
                    }
                }
            };
            let report = JobReport {
                id: job.id,
                source: job.source,
                output_name: job.output_name,
                direction: job.direction,
                outcome,
            };
            if let Some(on_report) = &self.on_report {
                on_report(&report);
            }
            reports.push(report);
        }
        reports
    }

    async fn run_job(&mut self, job: &TransferJob) -> Result<JobOutcome, TransferError> {
        expect(self.handle.request(ControlMessage::ResetSwState).await?, Reply::ResetDone)?;
        match job.direction {
            Direction::Encrypt => self.encrypt(job).await,
            Direction::Decrypt => self.decrypt(job).await,
        }
    }

    async fn encrypt(&mut self, job: &TransferJob) -> Result<JobOutcome, TransferError> {
        let mut source = ChunkSource::open(&job.source, 0, self.options.chunk_size).await?;
        let total = source.total();

        let reply = self
            .handle
            .request(ControlMessage::PrepareFileNameEnc {
                file_name: job.output_name.clone(),
            })
            .await?;
        expect(reply, Reply::FilePreparedEnc)?;
        self.handle.download_started().await?;
        debug!(job_id = %job.id, "download attached");

        let kind = match &job.key {
            KeyMaterial::Password(password) => {
                let reply = self
                    .request_with_retry(|| ControlMessage::RequestEncryption {
                        password: password.clone(),
                    })
                    .await?;
                expect(reply, Reply::KeysGenerated)?;
                ContainerKind::Symmetric
            }
            KeyMaterial::KeyPair {
                private_key,
                public_key,
            } => {
                let reply = self
                    .request_with_retry(|| ControlMessage::RequestEncKeyPair {
                        private_key: private_key.clone(),
                        public_key: public_key.clone(),
                        mode: KeyPairMode::Derive,
                    })
                    .await?;
                expect(reply, Reply::KeyPairReady)?;
                ContainerKind::Asymmetric
            }
        };

        let chunks = self
            .stream_chunks(&mut source, &job.output_name, |chunk, first| match (first, kind) {
                (true, ContainerKind::Asymmetric) => {
                    ControlMessage::AsymmetricEncryptFirstChunk(chunk)
                }
                (true, _) => ControlMessage::EncryptFirstChunk(chunk),
                (false, _) => ControlMessage::EncryptRestOfChunks(chunk),
            })
            .await?;

        let bytes_out =
            container::encrypted_len(kind, total, self.options.chunk_size).unwrap_or_default();
        info!(job_id = %job.id, bytes = total, chunks, "encryption finished");
        Ok(JobOutcome::Finished {
            bytes_in: total,
            bytes_out,
            chunks,
        })
    }

    async fn decrypt(&mut self, job: &TransferJob) -> Result<JobOutcome, TransferError> {
        let prefix = read_prefix(&job.source, SYMMETRIC_DATA_OFFSET).await?;
        let signature = prefix.slice(..prefix.len().min(SIGNATURE_SIZE));
        let legacy = prefix.slice(..prefix.len().min(LEGACY_SIGNATURE_SIZE));

        let kind = match self
            .handle
            .request(ControlMessage::CheckFile { signature, legacy })
            .await?
        {
            Reply::SecretKeyEncryption => ContainerKind::Symmetric,
            Reply::PublicKeyEncryption => ContainerKind::Asymmetric,
            Reply::OldVersion => return Err(TransferError::LegacyFormat),
            Reply::BadFile => return Err(TransferError::UnrecognizedFormat),
            other => return Err(unexpected(other)),
        };
        if !mode_matches(kind, &job.key) {
            return Err(TransferError::ModeMismatch(format!(
                "file is {kind}, key material is {}",
                job.key.mode()
            )));
        }

        let offset = kind.data_offset().unwrap_or(SYMMETRIC_DATA_OFFSET);
        if prefix.len() < offset {
            return Err(TransferError::Truncated);
        }
        let sealed_chunk = self.options.chunk_size + ABYTES;
        let mut source = ChunkSource::open(&job.source, offset as u64, sealed_chunk).await?;
        let total = source.total();
        if total < ABYTES as u64 {
            return Err(TransferError::Truncated);
        }
        let sample = if self.options.verify_before_decrypt {
            read_at(&job.source, offset as u64, sealed_chunk).await?
        } else {
            Bytes::new()
        };

        let reply = self
            .handle
            .request(ControlMessage::PrepareFileNameDec {
                file_name: job.output_name.clone(),
            })
            .await?;
        expect(reply, Reply::FilePreparedDec)?;
        self.handle.download_started().await?;

        match &job.key {
            KeyMaterial::Password(password) => {
                let signature = prefix.slice(..SIGNATURE_SIZE);
                let salt = prefix.slice(SIGNATURE_SIZE..SIGNATURE_SIZE + SALT_SIZE);
                let header = prefix.slice(SIGNATURE_SIZE + SALT_SIZE..offset);

                if self.options.verify_before_decrypt {
                    let reply = self
                        .request_with_retry(|| ControlMessage::RequestTestDecryption {
                            password: password.clone(),
                            signature: signature.clone(),
                            salt: salt.clone(),
                            header: header.clone(),
                            sample: sample.clone(),
                        })
                        .await?;
                    match reply {
                        Reply::ReadyToDecrypt => {}
                        Reply::WrongPassword => return Err(TransferError::AuthenticationFailed),
                        other => return Err(unexpected(other)),
                    }
                }

                let reply = self
                    .request_with_retry(|| ControlMessage::RequestDecryption {
                        password: password.clone(),
                        signature: signature.clone(),
                        salt: salt.clone(),
                        header: header.clone(),
                    })
                    .await?;
                expect(reply, Reply::DecKeysGenerated)?;
            }
            KeyMaterial::KeyPair {
                private_key,
                public_key,
            } => {
                let header = prefix.slice(SIGNATURE_SIZE..SIGNATURE_SIZE + HEADER_SIZE);
                let reply = self
                    .request_with_retry(|| ControlMessage::RequestDecKeyPair {
                        private_key: private_key.clone(),
                        public_key: public_key.clone(),
                        header: header.clone(),
                        dec_file_buff: sample.clone(),
                        mode: KeyPairMode::Derive,
                    })
                    .await?;
                match reply {
                    Reply::DecKeysGenerated => {}
                    Reply::WrongDecKeys => return Err(TransferError::AuthenticationFailed),
                    Reply::WeakDecKey => return Err(KeyError::WeakKey.into()),
                    Reply::WrongDecKeyPair => return Err(KeyError::WrongKeyPair.into()),
                    Reply::WrongDecPrivateKey => return Err(KeyError::WrongPrivateKey.into()),
                    Reply::WrongDecPublicKey => return Err(KeyError::WrongPublicKey.into()),
                    Reply::WrongKeyInput => return Err(KeyError::InvalidKeyEncoding.into()),
                    other => return Err(unexpected(other)),
                }
            }
        }

        let chunks = self
            .stream_chunks(&mut source, &job.output_name, |chunk, first| {
                if first {
                    ControlMessage::DecryptFirstChunk(chunk)
                } else {
                    ControlMessage::DecryptRestOfChunks(chunk)
                }
            })
            .await?;

        let bytes_out = total.saturating_sub(chunks * ABYTES as u64);
        info!(job_id = %job.id, bytes = bytes_out, chunks, "decryption finished");
        Ok(JobOutcome::Finished {
            bytes_in: total + offset as u64,
            bytes_out,
            chunks,
        })
    }

    /// Send every chunk, each only after the previous one was acknowledged.
    async fn stream_chunks<F>(
        &mut self,
        source: &mut ChunkSource<tokio::fs::File>,
        label: &str,
        wrap: F,
    ) -> Result<u64, TransferError>
    where
        F: Fn(ChunkMessage, bool) -> ControlMessage,
    {
        let total = source.total();
        let mut sent = 0u64;
        while let Some(chunk) = source.next_chunk().await? {
            let first = chunk.index == 0;
            let last = chunk.last;
            let reply = self.handle.request(wrap(chunk, first)).await?;
            sent += 1;

            if let Some(progress) = &self.progress {
                progress(source.offset(), total, label);
            }

            match reply {
                Reply::ContinueEncryption | Reply::ContinueDecryption if !last => {}
                Reply::EncryptionFinished | Reply::DecryptionFinished if last => return Ok(sent),
                other => return Err(unexpected(other)),
            }
        }
        Err(TransferError::Truncated)
    }

    /// Repeat a key request while the provider reports it is not ready.
    async fn request_with_retry<F>(&mut self, make: F) -> Result<Reply, TransferError>
    where
        F: Fn() -> ControlMessage,
    {
        let attempts = self.options.provider_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let reply = self.handle.request(make()).await?;
            match reply.error() {
                Some(TransferError::ProviderNotReady) => {
                    debug!(attempt, attempts, "crypto provider not ready, retrying");
                    tokio::time::sleep(self.options.provider_retry_delay).await;
                }
                _ => return Ok(reply),
            }
        }
        Err(TransferError::ProviderTimeout { attempts })
    }
}

fn mode_matches(kind: ContainerKind, key: &KeyMaterial) -> bool {
    matches!(
        (kind, key.mode()),
        (ContainerKind::Symmetric, EncryptionMode::Symmetric)
            | (ContainerKind::Asymmetric, EncryptionMode::Asymmetric)
    )
}

fn expect(reply: Reply, wanted: Reply) -> Result<(), TransferError> {
    if reply == wanted {
        Ok(())
    } else {
        Err(unexpected(reply))
    }
}

/// Turn an unexpected reply into the error it carries, or a sequencing error.
fn unexpected(reply: Reply) -> TransferError {
    match reply {
        Reply::EncryptionError { error } | Reply::DecryptionError { error } => error,
        Reply::DownloadCancelled => TransferError::Cancelled,
        Reply::WeakKey => KeyError::WeakKey.into(),
        Reply::WrongKeyPair => KeyError::WrongKeyPair.into(),
        Reply::WrongPrivateKey => KeyError::WrongPrivateKey.into(),
        Reply::WrongPublicKey => KeyError::WrongPublicKey.into(),
        Reply::WrongKeyInput => KeyError::InvalidKeyEncoding.into(),
        other => TransferError::Sequencing(format!("unexpected reply {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names() {
        assert_eq!(
            output_name_for(Path::new("/tmp/report.pdf"), Direction::Encrypt),
            "report.pdf.enc"
        );
        assert_eq!(
            output_name_for(Path::new("/tmp/report.pdf.enc"), Direction::Decrypt),
            "report.pdf"
        );
        assert_eq!(
            output_name_for(Path::new("blob.bin"), Direction::Decrypt),
            "blob.bin.dec"
        );
        assert_eq!(
            output_name_for(Path::new(".enc"), Direction::Decrypt),
            ".enc.dec"
        );
    }

    #[test]
    fn test_unexpected_reply_mapping() {
        assert_eq!(
            unexpected(Reply::DecryptionError {
                error: TransferError::AuthenticationFailed
            }),
            TransferError::AuthenticationFailed
        );
        assert_eq!(unexpected(Reply::DownloadCancelled), TransferError::Cancelled);
        assert_eq!(
            unexpected(Reply::WrongKeyInput),
            TransferError::Key(KeyError::InvalidKeyEncoding)
        );
        assert!(matches!(
            unexpected(Reply::ResetDone),
            TransferError::Sequencing(_)
        ));
    }

    #[test]
    fn test_mode_check() {
        let pw = KeyMaterial::Password(SecretString::from("x"));
        assert!(mode_matches(ContainerKind::Symmetric, &pw));
        assert!(!mode_matches(ContainerKind::Asymmetric, &pw));
    }

    #[test]
    fn test_key_material_debug_redacts() {
        let pw = KeyMaterial::Password(SecretString::from("super-secret-pw"));
        assert!(!format!("{pw:?}").contains("super-secret"));
    }

    #[test]
    fn test_report_state() {
        let report = JobReport {
            id: Uuid::new_v4(),
            source: "a".into(),
            output_name: "a.enc".into(),
            direction: Direction::Encrypt,
            outcome: JobOutcome::Skipped,
        };
        assert_eq!(report.state(), JobState::Queued);
    }
}
