use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("stage {stage} could not be initialized: {message}")]
    StageInit { stage: String, message: String },

    #[error("transfer failed for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("stage {stage} failed: {message}")]
    StageLogic { stage: String, message: String },

    #[error("{operation} called on {kind} stage {stage}")]
    Misuse {
        stage: String,
        operation: &'static str,
        kind: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stage {stage} failed at {timestamp}{}: {source}", format_logs(.logs))]
    StageFailed {
        stage: String,
        timestamp: i64,
        logs: Vec<String>,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("missing pipeline file kira-pipeline.json in current directory")]
    MissingConfig,

    #[error("failed to read pipeline file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse pipeline file: {0}")]
    ConfigParse(String),

    #[error("invalid stage id: {0}")]
    InvalidStageId(String),

    #[error("invalid file reference: {0}")]
    InvalidFileRef(String),

    #[error("unknown stage type: {0}")]
    UnknownStageType(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Innermost error behind a `StageFailed` wrapper.
    pub fn cause(&self) -> &PipelineError {
        match self {
            PipelineError::StageFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self.cause(), PipelineError::Misuse { .. })
    }

    pub(crate) fn transfer(path: impl ToString, message: impl ToString) -> Self {
        PipelineError::Transfer {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn logic(stage: impl ToString, message: impl ToString) -> Self {
        PipelineError::StageLogic {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }
}

fn format_logs(logs: &[String]) -> String {
    if logs.is_empty() {
        String::new()
    } else {
        format!(" (logs: {})", logs.join(", "))
    }
}
