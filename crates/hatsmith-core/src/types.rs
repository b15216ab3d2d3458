use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way a transfer job moves bytes through the cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// How the session key of a job is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Argon2id over (password, salt)
    Symmetric,
    /// X25519 shared secret between two key pairs
    Asymmetric,
}

/// Lifecycle of a transfer job as seen by the job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue
    Queued,
    /// Session key derived or exchanged
    KeyReady,
    /// Chunks are flowing through the coordinator
    Streaming,
    /// FINAL chunk written and output closed
    Finished,
    /// Aborted with an error
    Errored,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Errored)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encrypt => f.write_str("encrypt"),
            Direction::Decrypt => f.write_str("decrypt"),
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionMode::Symmetric => f.write_str("password"),
            EncryptionMode::Asymmetric => f.write_str("key-pair"),
        }
    }
}
