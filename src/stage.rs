use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use crate::domain::{Compression, FileRef, StageId, StageKind};
use crate::error::PipelineError;
use crate::fs_util;
use crate::gateway::StorageGateway;
use crate::ledger::{Outcome, RunLedger, RunRecord};
use crate::log_store::{LogRef, LogStore, VersionedStore};
use crate::store::ObjectStore;
use crate::workspace::{DirectorySet, LocalWorkspace};

#[derive(Clone)]
pub struct Services {
    pipeline: String,
    gateway: StorageGateway,
    workspace: LocalWorkspace,
    logs: LogStore,
    ledger: RunLedger,
}

impl Services {
    pub fn new(
        pipeline: &str,
        store: Arc<dyn ObjectStore>,
        versioned: Arc<dyn VersionedStore>,
        scratch: impl Into<Utf8PathBuf>,
        max_log_versions: usize,
        max_run_records: usize,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            gateway: StorageGateway::new(store),
            workspace: LocalWorkspace::new(scratch, pipeline),
            logs: LogStore::new(versioned.clone(), pipeline, max_log_versions),
            ledger: RunLedger::new(versioned, pipeline, max_run_records),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    pub fn workspace(&self) -> &LocalWorkspace {
        &self.workspace
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }
}

pub struct StageContext<'a> {
    stage: &'a StageId,
    args: &'a str,
    timestamp: i64,
    dirs: &'a DirectorySet,
    gateway: &'a StorageGateway,
    log_files: Vec<Utf8PathBuf>,
}

impl<'a> StageContext<'a> {
    fn new(
        stage: &'a StageId,
        args: &'a str,
        timestamp: i64,
        dirs: &'a DirectorySet,
        gateway: &'a StorageGateway,
    ) -> Self {
        Self {
            stage,
            args,
            timestamp,
            dirs,
            gateway,
            log_files: Vec::new(),
        }
    }

    pub fn stage(&self) -> &StageId {
        self.stage
    }

    pub fn args(&self) -> &str {
        self.args
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn dirs(&self) -> &DirectorySet {
        self.dirs
    }

    pub fn gateway(&self) -> &StorageGateway {
        self.gateway
    }

    pub fn meta_files(&self) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        fs_util::list_files(&self.dirs.meta)
    }

    pub fn output_files(&self) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        fs_util::list_files(&self.dirs.output)
    }

    pub fn create_log(&mut self, name: &str) -> Result<Utf8PathBuf, PipelineError> {
        let path = self.dirs.log.join(name);
        fs::File::create(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("create log {path}: {err}")))?;
        self.add_log(path.clone());
        Ok(path)
    }

    /// Registers a log file that may live outside the log dir.
    pub fn add_log(&mut self, path: Utf8PathBuf) {
        if !self.log_files.contains(&path) {
            self.log_files.push(path);
        }
    }

    pub fn log_files(&self) -> &[Utf8PathBuf] {
        &self.log_files
    }

    fn collect_logs(&self) -> Vec<Utf8PathBuf> {
        let mut files = self.log_files.clone();
        match fs_util::list_files(&self.dirs.log) {
            Ok(found) => {
                for path in found {
                    if !files.contains(&path) {
                        files.push(path);
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not scan log dir"),
        }
        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub file_ref: FileRef,
    pub local: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// Local file to publish under the stage's output dir.
    Local(Utf8PathBuf),
    /// Object already on the distributed tier, forwarded as is.
    Existing(FileRef),
}

pub trait SourceLogic: Send + Sync {
    fn retrieve(&self, ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError>;

    fn min_outputs(&self) -> usize {
        1
    }
}

pub trait FilterLogic: Send + Sync {
    fn process(
        &self,
        inputs: &[StagedInput],
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError>;

    fn stages_inputs(&self) -> bool {
        true
    }
}

pub trait SinkLogic: Send + Sync {
    fn sink(&self, inputs: &[StagedInput], ctx: &mut StageContext<'_>) -> Result<(), PipelineError>;

    fn stages_inputs(&self) -> bool {
        true
    }
}

pub enum StageBehavior {
    Source(Box<dyn SourceLogic>),
    Filter(Box<dyn FilterLogic>),
    Sink(Box<dyn SinkLogic>),
}

impl StageBehavior {
    pub fn kind(&self) -> StageKind {
        match self {
            StageBehavior::Source(_) => StageKind::Source,
            StageBehavior::Filter(_) => StageKind::Filter,
            StageBehavior::Sink(_) => StageKind::Sink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub dir: Utf8PathBuf,
    pub compression: Compression,
    pub storage_days: Option<u32>,
}

impl OutputSpec {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            compression: Compression::None,
            storage_days: None,
        }
    }
}

pub struct Stage {
    id: StageId,
    args: String,
    behavior: StageBehavior,
    output: OutputSpec,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("args", &self.args)
            .field("output", &self.output)
            .finish()
    }
}

impl Stage {
    pub fn new(id: StageId, args: &str, behavior: StageBehavior, output: OutputSpec) -> Self {
        Self {
            id,
            args: args.to_string(),
            behavior,
            output,
        }
    }

    pub fn id(&self) -> &StageId {
        &self.id
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn kind(&self) -> StageKind {
        self.behavior.kind()
    }

    pub fn output(&self) -> &OutputSpec {
        &self.output
    }

    fn expect_kind(&self, operation: &'static str, allowed: &[StageKind]) -> Result<(), PipelineError> {
        if allowed.contains(&self.kind()) {
            return Ok(());
        }
        let err = PipelineError::Misuse {
            stage: self.id.to_string(),
            operation,
            kind: self.kind().to_string(),
        };
        error!(stage = %self.id, error = %err, "stage misuse");
        Err(err)
    }

    pub fn retrieve(&self, services: &Services, timestamp: i64) -> Result<RunRecord, PipelineError> {
        self.expect_kind("retrieve", &[StageKind::Source])?;
        self.invoke(services, &[], timestamp)
    }

    pub fn process(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        self.expect_kind("process", &[StageKind::Filter])?;
        self.invoke(services, inputs, timestamp)
    }

    pub fn sink(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        self.expect_kind("sink", &[StageKind::Sink])?;
        self.invoke(services, inputs, timestamp)
    }

    pub fn run(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        match self.kind() {
            StageKind::Source => {
                if !inputs.is_empty() {
                    warn!(stage = %self.id, count = inputs.len(), "source stage ignores inputs");
                }
                self.retrieve(services, timestamp)
            }
            StageKind::Filter => self.process(services, inputs, timestamp),
            StageKind::Sink => self.sink(services, inputs, timestamp),
        }
    }

    /// Resumes a source or filter run. A recorded success whose outputs still exist
    /// is returned as is; anything else is reclaimed and run again.
    pub fn recover(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        self.expect_kind("recover", &[StageKind::Source, StageKind::Filter])?;
        self.reclaim(services, timestamp)?;

        if let Some(record) = services.ledger().last(&self.id, timestamp)? {
            if record.is_success() && self.outputs_exist(services, &record)? {
                info!(stage = %self.id, timestamp, "reusing recorded outputs");
                return Ok(record);
            }
        }
        if self.kind() == StageKind::Source && !inputs.is_empty() {
            warn!(stage = %self.id, count = inputs.len(), "source stage ignores inputs");
        }
        self.invoke(services, inputs, timestamp)
    }

    /// Re-runs a sink. There are no prior outputs to reconcile.
    pub fn recover_sink(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        self.expect_kind("recover_sink", &[StageKind::Sink])?;
        self.reclaim(services, timestamp)?;
        self.invoke(services, inputs, timestamp)
    }

    fn reclaim(&self, services: &Services, timestamp: i64) -> Result<(), PipelineError> {
        services
            .workspace()
            .reclaim(&self.id, timestamp, services.gateway())
            .map(|_| ())
            .map_err(|err| PipelineError::StageInit {
                stage: self.id.to_string(),
                message: err.to_string(),
            })
    }

    fn outputs_exist(&self, services: &Services, record: &RunRecord) -> Result<bool, PipelineError> {
        for output in &record.outputs {
            if !services.gateway().exists(output)? {
                debug!(stage = %self.id, file = %output, "recorded output is gone");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn invoke(
        &self,
        services: &Services,
        inputs: &[FileRef],
        timestamp: i64,
    ) -> Result<RunRecord, PipelineError> {
        let span = info_span!("stage", stage = %self.id, kind = %self.kind(), timestamp);
        let _entered = span.enter();

        let guard = services
            .workspace()
            .acquire(&self.id, timestamp, services.gateway())
            .map_err(|err| PipelineError::StageInit {
                stage: self.id.to_string(),
                message: err.to_string(),
            })?;

        let mut ctx = StageContext::new(
            &self.id,
            &self.args,
            timestamp,
            guard.dirs(),
            services.gateway(),
        );
        let mut published = Vec::new();
        let executed = self.execute(services, &mut ctx, inputs, &mut published);

        let log_files = ctx.collect_logs();
        let (logs, log_error) = match services.logs().persist(&self.id, timestamp, &log_files) {
            Ok(logs) => (logs, None),
            Err(err) => (Vec::new(), Some(err)),
        };
        let executed = match (executed, log_error) {
            (Ok(_), Some(err)) => Err(err),
            (Err(err), Some(log_error)) => {
                warn!(error = %log_error, "log persistence failed after stage failure");
                Err(err)
            }
            (executed, None) => executed,
        };

        if let Err(err) = guard.release() {
            warn!(error = %err, "workspace cleanup failed");
        }

        let record = self.record(services, timestamp, &executed, published, logs);
        let executed = match (executed, services.ledger().record(&record)) {
            (executed, Ok(())) => executed,
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Err(ledger_error)) => {
                warn!(error = %ledger_error, "run record not written after stage failure");
                Err(err)
            }
        };

        match executed {
            Ok(_) => {
                info!(
                    processed = record.processed,
                    outputs = record.outputs.len(),
                    logs = record.logs.len(),
                    "stage finished"
                );
                Ok(record)
            }
            Err(err) => {
                error!(error = %err, "stage failed");
                Err(PipelineError::StageFailed {
                    stage: self.id.to_string(),
                    timestamp,
                    logs: record.logs.iter().map(ToString::to_string).collect(),
                    source: Box::new(err),
                })
            }
        }
    }

    fn record(
        &self,
        services: &Services,
        timestamp: i64,
        executed: &Result<usize, PipelineError>,
        outputs: Vec<FileRef>,
        logs: Vec<LogRef>,
    ) -> RunRecord {
        let (outcome, processed, error) = match executed {
            Ok(processed) => (Outcome::Success, *processed, None),
            Err(err) => (Outcome::Failed, 0, Some(err.to_string())),
        };
        RunRecord {
            pipeline: services.pipeline().to_string(),
            stage: self.id.clone(),
            timestamp,
            outcome,
            processed,
            outputs,
            logs,
            error,
            finished_at: Utc::now().to_rfc3339(),
        }
    }

    fn execute(
        &self,
        services: &Services,
        ctx: &mut StageContext<'_>,
        inputs: &[FileRef],
        published: &mut Vec<FileRef>,
    ) -> Result<usize, PipelineError> {
        let dirs = ctx.dirs().clone();
        services
            .gateway()
            .fetch_meta(&dirs.remote_meta, ctx.timestamp(), &dirs.meta, &dirs.tmp)?;

        let processed = match &self.behavior {
            StageBehavior::Source(logic) => {
                let produced = logic.retrieve(ctx)?;
                if produced.len() < logic.min_outputs() {
                    return Err(PipelineError::logic(
                        &self.id,
                        format!(
                            "produced {} outputs, expected at least {}",
                            produced.len(),
                            logic.min_outputs()
                        ),
                    ));
                }
                self.publish_outputs(services, produced, ctx.timestamp(), published)?;
                0
            }
            StageBehavior::Filter(logic) => {
                let staged = self.stage_in(services, &dirs.input, inputs, logic.stages_inputs())?;
                let produced = logic.process(&staged, ctx)?;
                self.publish_outputs(services, produced, ctx.timestamp(), published)?;
                staged.len()
            }
            StageBehavior::Sink(logic) => {
                let staged = self.stage_in(services, &dirs.input, inputs, logic.stages_inputs())?;
                logic.sink(&staged, ctx)?;
                staged.len()
            }
        };

        services
            .gateway()
            .publish_meta(&dirs.meta, &dirs.remote_meta, ctx.timestamp(), &dirs.tmp)?;
        Ok(processed)
    }

    fn stage_in(
        &self,
        services: &Services,
        input_dir: &Utf8Path,
        inputs: &[FileRef],
        fetch: bool,
    ) -> Result<Vec<StagedInput>, PipelineError> {
        if !fetch {
            return Ok(inputs
                .iter()
                .map(|file_ref| StagedInput {
                    file_ref: file_ref.clone(),
                    local: None,
                })
                .collect());
        }
        let mut claimed: HashMap<&str, &FileRef> = HashMap::new();
        for file_ref in inputs {
            if let Some(previous) = claimed.insert(file_ref.name(), file_ref) {
                return Err(PipelineError::transfer(
                    file_ref,
                    format!("stages to the same local file as {previous}"),
                ));
            }
        }

        let mut staged = Vec::with_capacity(inputs.len());
        for file_ref in inputs {
            let fetched = services.gateway().fetch(file_ref, input_dir)?;
            if fetched.is_empty() {
                warn!(file = %file_ref, "skipping zero-byte input");
                if let Err(err) = fs::remove_file(fetched.local.as_std_path()) {
                    warn!(file = %fetched.local, error = %err, "could not remove empty input");
                }
                continue;
            }
            staged.push(StagedInput {
                file_ref: file_ref.clone(),
                local: Some(fetched.local),
            });
        }
        Ok(staged)
    }

    /// Publishes produced files. Calling this on a sink is misuse.
    pub fn stage_out(
        &self,
        services: &Services,
        produced: Vec<StageOutput>,
        timestamp: i64,
    ) -> Result<Vec<FileRef>, PipelineError> {
        let mut outputs = Vec::with_capacity(produced.len());
        self.publish_outputs(services, produced, timestamp, &mut outputs)?;
        Ok(outputs)
    }

    /// Publishes in order, leaving everything published so far in `outputs` on failure.
    fn publish_outputs(
        &self,
        services: &Services,
        produced: Vec<StageOutput>,
        timestamp: i64,
        outputs: &mut Vec<FileRef>,
    ) -> Result<(), PipelineError> {
        self.expect_kind("stage_out", &[StageKind::Source, StageKind::Filter])?;
        for output in produced {
            let file_ref = match output {
                StageOutput::Local(path) => services.gateway().publish(
                    &path,
                    &self.output.dir,
                    timestamp,
                    self.output.compression,
                )?,
                StageOutput::Existing(file_ref) => file_ref,
            };
            outputs.push(file_ref);
        }
        Ok(())
    }
}
