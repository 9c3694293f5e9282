use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{FileRef, StageId};
use crate::error::PipelineError;
use crate::log_store::{LogRef, VersionedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pipeline: String,
    pub stage: StageId,
    pub timestamp: i64,
    pub outcome: Outcome,
    pub processed: usize,
    pub outputs: Vec<FileRef>,
    pub logs: Vec<LogRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: String,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Run records kept in the versioned store under `<pipeline>.runs`, keyed by stage.
#[derive(Clone)]
pub struct RunLedger {
    backend: Arc<dyn VersionedStore>,
    namespace: String,
    max_versions: usize,
}

impl RunLedger {
    pub fn new(backend: Arc<dyn VersionedStore>, pipeline: &str, max_versions: usize) -> Self {
        Self {
            backend,
            namespace: format!("{pipeline}.runs"),
            max_versions,
        }
    }

    pub fn record(&self, record: &RunRecord) -> Result<(), PipelineError> {
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| PipelineError::Serialization(err.to_string()))?;
        let retained = self.backend.put(
            &self.namespace,
            &record.stage.to_string(),
            &content,
            record.timestamp,
            self.max_versions,
        )?;
        if !retained {
            warn!(
                stage = %record.stage,
                timestamp = record.timestamp,
                "run record older than every retained record was evicted"
            );
        }
        debug!(stage = %record.stage, timestamp = record.timestamp, "run recorded");
        Ok(())
    }

    pub fn last(&self, stage: &StageId, timestamp: i64) -> Result<Option<RunRecord>, PipelineError> {
        match self
            .backend
            .get(&self.namespace, &stage.to_string(), Some(timestamp))
        {
            Ok(content) => serde_json::from_slice(&content)
                .map(Some)
                .map_err(|err| PipelineError::Serialization(err.to_string())),
            Err(PipelineError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn history(&self, stage: &StageId) -> Result<Vec<RunRecord>, PipelineError> {
        let key = stage.to_string();
        self.backend
            .list_versions(&self.namespace, &key)?
            .into_iter()
            .map(|version| {
                let content = self.backend.get(&self.namespace, &key, Some(version))?;
                serde_json::from_slice(&content)
                    .map_err(|err| PipelineError::Serialization(err.to_string()))
            })
            .collect()
    }
}
