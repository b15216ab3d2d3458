//! hatsmith-transfer: the streaming pipeline
//!
//! ```text
//! JobQueue ──ChunkSource──► CoordinatorHandle ──► TransferCoordinator ──► CipherSession
//!                                                        │
//!                                                        ▼
//!                                   OutputStream ══ DownloadHub ══ DownloadBody ──► HTTP / file
//! ```

pub mod coordinator;
pub mod error;
pub mod message;
pub mod pipe;
pub mod producer;
pub mod queue;
pub mod session;
pub mod sink;

pub use coordinator::{
    spawn_coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState, TransferCoordinator,
};
pub use error::TransferError;
pub use message::{ChunkMessage, ControlMessage, KeyPairMode, Reply};
pub use pipe::{DownloadBody, DownloadHub, OutputStream};
pub use producer::ChunkSource;
pub use queue::{
    JobOutcome, JobQueue, JobReport, KeyMaterial, ProgressFn, QueueOptions, ReportFn,
    TransferJob,
};
pub use session::CipherSession;
