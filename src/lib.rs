pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod gateway;
pub mod ledger;
pub mod log_store;
pub mod output;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod store;
pub mod workspace;

pub use domain::{Compression, FileRef, LogCategory, StageId, StageKind};
pub use error::PipelineError;
pub use gateway::StorageGateway;
pub use ledger::{Outcome, RunLedger, RunRecord};
pub use log_store::{FsVersionedStore, LogRef, LogStore, MemoryVersionedStore, VersionedStore};
pub use pipeline::{FailurePolicy, Pipeline, PipelineReport};
pub use stage::{Services, Stage, StageBehavior, StageContext};
pub use stages::StageRegistry;
pub use store::{FsObjectStore, ObjectStore};
pub use workspace::{DirectorySet, LocalWorkspace};
