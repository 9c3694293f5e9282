#![allow(dead_code)]

use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use kira_pipeline::domain::{Compression, FileRef, StageId};
use kira_pipeline::error::PipelineError;
use kira_pipeline::log_store::MemoryVersionedStore;
use kira_pipeline::stage::{
    FilterLogic, OutputSpec, Services, SinkLogic, SourceLogic, StageContext, StageOutput,
    StagedInput,
};
use kira_pipeline::store::{FsObjectStore, ObjectStore};

pub const PIPELINE: &str = "geo";

pub struct Fixture {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub store: Arc<FsObjectStore>,
    pub versioned: Arc<MemoryVersionedStore>,
    pub services: Services,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_versions(5)
    }

    pub fn with_versions(max_log_versions: usize) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Arc::new(FsObjectStore::new(root.join("remote")));
        let versioned = Arc::new(MemoryVersionedStore::new());
        let services = Services::new(
            PIPELINE,
            store.clone(),
            versioned.clone(),
            root.join("scratch"),
            max_log_versions,
            50,
        );
        Self {
            _temp: temp,
            root,
            store,
            versioned,
            services,
        }
    }

    pub fn put_remote(&self, dir: &str, name: &str, timestamp: i64, content: &[u8]) -> FileRef {
        let file = FileRef::new(Utf8Path::new(dir), name, timestamp, Compression::None);
        self.store.put(file.path(), content).unwrap();
        file
    }

    pub fn read_remote(&self, file: &FileRef) -> Vec<u8> {
        self.store.get(file.path()).unwrap()
    }

    pub fn workspace_root(&self, stage: &StageId, timestamp: i64) -> Utf8PathBuf {
        self.services.workspace().layout(stage, timestamp).root
    }
}

pub fn stage_id(num: u32, name: &str) -> StageId {
    StageId::new(num, name).unwrap()
}

pub fn output(stage: &str) -> OutputSpec {
    OutputSpec::new(format!("data/{PIPELINE}/{stage}"))
}

/// Writes fixed files into the output dir.
pub struct WriteSource {
    pub files: Vec<(&'static str, &'static str)>,
}

impl SourceLogic for WriteSource {
    fn retrieve(&self, ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError> {
        let mut outputs = Vec::new();
        for (name, content) in &self.files {
            let path = ctx.dirs().output.join(name);
            fs::write(path.as_std_path(), content).unwrap();
            outputs.push(StageOutput::Local(path));
        }
        Ok(outputs)
    }
}

/// Uppercases every staged input into `<stem>.out` and logs what it did.
#[derive(Default)]
pub struct UppercaseFilter {
    pub seen: Arc<Mutex<Vec<FileRef>>>,
}

impl FilterLogic for UppercaseFilter {
    fn process(
        &self,
        inputs: &[StagedInput],
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
        let log = ctx.create_log("run.log")?;
        let mut outputs = Vec::new();
        for input in inputs {
            self.seen.lock().unwrap().push(input.file_ref.clone());
            let local = input.local.as_ref().unwrap();
            let content = fs::read_to_string(local.as_std_path()).unwrap();
            let stem = local.file_stem().unwrap();
            let path = ctx.dirs().output.join(format!("{stem}.out"));
            fs::write(path.as_std_path(), content.to_uppercase()).unwrap();
            outputs.push(StageOutput::Local(path));
        }
        fs::write(log.as_std_path(), format!("processed {}\n", inputs.len())).unwrap();
        Ok(outputs)
    }
}

/// Writes a log and an error file, then fails.
pub struct FailingFilter;

impl FilterLogic for FailingFilter {
    fn process(
        &self,
        _inputs: &[StagedInput],
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
        let log = ctx.create_log("run.log")?;
        fs::write(log.as_std_path(), "starting\n").unwrap();
        let err = ctx.create_log("run.err")?;
        fs::write(err.as_std_path(), "matrix is malformed\n").unwrap();
        Err(PipelineError::StageLogic {
            stage: ctx.stage().to_string(),
            message: "matrix is malformed".to_string(),
        })
    }
}

/// Records the inputs it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub seen: Arc<Mutex<Vec<FileRef>>>,
}

impl SinkLogic for RecordingSink {
    fn sink(&self, inputs: &[StagedInput], _ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(inputs.iter().map(|input| input.file_ref.clone()));
        Ok(())
    }
}
