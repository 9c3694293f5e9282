use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use crate::config::ResolvedConfig;
use crate::domain::{FileRef, StageKind};
use crate::error::PipelineError;
use crate::ledger::RunRecord;
use crate::log_store::FsVersionedStore;
use crate::stage::{Services, Stage};
use crate::stages::StageRegistry;
use crate::store::FsObjectStore;

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    /// Continue with an empty input set for the next stage.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub stage: String,
    pub timestamp: i64,
    pub error: String,
    pub logs: Vec<String>,
}

impl FailureSummary {
    fn from_error(err: &PipelineError, failed: &Stage, at: i64) -> Self {
        match err {
            PipelineError::StageFailed {
                stage,
                timestamp,
                logs,
                source,
            } => Self {
                stage: stage.clone(),
                timestamp: *timestamp,
                error: source.to_string(),
                logs: logs.clone(),
            },
            other => Self {
                stage: failed.id().to_string(),
                timestamp: at,
                error: other.to_string(),
                logs: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub timestamp: i64,
    pub records: Vec<RunRecord>,
    pub failures: Vec<FailureSummary>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn outputs(&self) -> &[FileRef] {
        self.records
            .last()
            .map(|record| record.outputs.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Recover,
}

pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    services: Services,
    policy: FailurePolicy,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Pipeline {
    /// Sources may only come first and sinks only last. Stage names are unique.
    pub fn new(
        name: &str,
        stages: Vec<Stage>,
        services: Services,
        policy: FailurePolicy,
    ) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidPipeline(format!(
                "pipeline {name} has no stages"
            )));
        }
        let mut names = HashSet::new();
        let last = stages.len() - 1;
        for (index, stage) in stages.iter().enumerate() {
            if !names.insert(stage.id().name().to_string()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "duplicate stage {}",
                    stage.id()
                )));
            }
            match stage.kind() {
                StageKind::Source if index != 0 => {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "source stage {} must be first",
                        stage.id()
                    )));
                }
                StageKind::Sink if index != last => {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "sink stage {} must be last",
                        stage.id()
                    )));
                }
                _ => {}
            }
        }
        Ok(Self {
            name: name.to_string(),
            stages,
            services,
            policy,
        })
    }

    pub fn from_config(
        config: &ResolvedConfig,
        registry: &StageRegistry,
    ) -> Result<Self, PipelineError> {
        let services = Services::new(
            &config.name,
            Arc::new(FsObjectStore::new(config.storage.remote.clone())),
            Arc::new(FsVersionedStore::new(config.storage.logs.clone())),
            config.storage.scratch.clone(),
            config.max_log_versions,
            config.max_run_records,
        );
        let stages = config
            .stages
            .iter()
            .map(|stage| registry.build(stage))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Self::new(&config.name, stages, services, config.on_failure)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs every stage at `timestamp`, feeding each stage's outputs to the next.
    pub fn run(&self, timestamp: i64, initial: Vec<FileRef>) -> Result<PipelineReport, PipelineError> {
        self.drive(Mode::Run, timestamp, initial)
    }

    /// Like `run`, but stages that already succeeded at `timestamp` are not repeated.
    pub fn recover(
        &self,
        timestamp: i64,
        initial: Vec<FileRef>,
    ) -> Result<PipelineReport, PipelineError> {
        self.drive(Mode::Recover, timestamp, initial)
    }

    fn drive(
        &self,
        mode: Mode,
        timestamp: i64,
        initial: Vec<FileRef>,
    ) -> Result<PipelineReport, PipelineError> {
        let span = info_span!("pipeline", pipeline = %self.name, timestamp);
        let _entered = span.enter();
        info!(stages = self.stages.len(), mode = ?mode, "pipeline started");

        let mut report = PipelineReport {
            pipeline: self.name.clone(),
            timestamp,
            records: Vec::new(),
            failures: Vec::new(),
        };
        let mut inputs = initial;

        for stage in &self.stages {
            let result = match (mode, stage.kind()) {
                (Mode::Run, _) => stage.run(&self.services, &inputs, timestamp),
                (Mode::Recover, StageKind::Sink) => {
                    stage.recover_sink(&self.services, &inputs, timestamp)
                }
                (Mode::Recover, _) => stage.recover(&self.services, &inputs, timestamp),
            };
            match result {
                Ok(record) => {
                    inputs = record.outputs.clone();
                    report.records.push(record);
                }
                Err(err) if err.is_misuse() || self.policy == FailurePolicy::Abort => {
                    error!(stage = %stage.id(), error = %err, "pipeline aborted");
                    return Err(err);
                }
                Err(err) => {
                    warn!(stage = %stage.id(), error = %err, "stage failed, continuing");
                    report
                        .failures
                        .push(FailureSummary::from_error(&err, stage, timestamp));
                    inputs = Vec::new();
                }
            }
        }

        info!(
            records = report.records.len(),
            failures = report.failures.len(),
            "pipeline finished"
        );
        Ok(report)
    }

    /// Deletes outputs and meta bundles older than each stage's `storage_days`.
    /// The newest meta bundle of a stage is always kept.
    pub fn expire(&self, now: i64) -> Result<Vec<FileRef>, PipelineError> {
        let gateway = self.services.gateway();
        let mut removed = Vec::new();
        for stage in &self.stages {
            let Some(days) = stage.output().storage_days else {
                continue;
            };
            let is_expired = |file: &FileRef| now - file.timestamp() > i64::from(days) * MILLIS_PER_DAY;

            for file in gateway.list(&stage.output().dir)? {
                if is_expired(&file) {
                    gateway.remove(&file)?;
                    removed.push(file);
                }
            }

            let remote_meta = self.services.workspace().remote_meta_dir(stage.id());
            let mut bundles = gateway.list(&remote_meta)?;
            bundles.sort_by_key(FileRef::timestamp);
            bundles.pop();
            for file in bundles {
                if is_expired(&file) {
                    gateway.remove(&file)?;
                    removed.push(file);
                }
            }
        }
        info!(pipeline = %self.name, removed = removed.len(), "expired old outputs");
        Ok(removed)
    }
}
