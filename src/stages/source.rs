use camino::Utf8PathBuf;

use crate::config::StageConfig;
use crate::error::PipelineError;
use crate::fs_util;
use crate::stage::{SourceLogic, StageBehavior, StageContext, StageOutput};
use crate::stages::command::{self, CommandVars};

/// Forwards the newest version of every object in a remote directory.
pub struct ListDir {
    dir: Utf8PathBuf,
}

impl ListDir {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        let dir = required_dir(config)?;
        Ok(StageBehavior::Source(Box::new(Self::new(dir))))
    }
}

impl SourceLogic for ListDir {
    fn retrieve(&self, ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError> {
        Ok(ctx
            .gateway()
            .list_newest(&self.dir)?
            .into_iter()
            .map(StageOutput::Existing)
            .collect())
    }
}

/// Publishes the files of a local directory.
pub struct LocalFiles {
    dir: Utf8PathBuf,
}

impl LocalFiles {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        let dir = required_dir(config)?;
        Ok(StageBehavior::Source(Box::new(Self::new(dir))))
    }
}

impl SourceLogic for LocalFiles {
    fn retrieve(&self, _ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError> {
        Ok(fs_util::list_files(&self.dir)?
            .into_iter()
            .map(StageOutput::Local)
            .collect())
    }
}

/// Runs a command that writes its results into `{output_dir}`.
pub struct ExecuteSource {
    template: Vec<String>,
}

impl ExecuteSource {
    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Source(Box::new(Self {
            template: command::parse_template(&config.args)?,
        })))
    }
}

impl SourceLogic for ExecuteSource {
    fn retrieve(&self, ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError> {
        let argv = CommandVars::from_context(ctx).substitute(&self.template);
        let stem = ctx.stage().name().to_string();
        command::run_command(&argv, ctx, &stem)?;
        Ok(ctx
            .output_files()?
            .into_iter()
            .map(StageOutput::Local)
            .collect())
    }
}

/// Produces nothing and accepts that.
pub struct NullSource;

impl NullSource {
    pub fn build(_config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Source(Box::new(NullSource)))
    }
}

impl SourceLogic for NullSource {
    fn retrieve(&self, _ctx: &mut StageContext<'_>) -> Result<Vec<StageOutput>, PipelineError> {
        Ok(Vec::new())
    }

    fn min_outputs(&self) -> usize {
        0
    }
}

fn required_dir(config: &StageConfig) -> Result<Utf8PathBuf, PipelineError> {
    let dir = config.args.trim();
    if dir.is_empty() {
        return Err(PipelineError::InvalidPipeline(format!(
            "stage {} ({}) needs a directory in its args",
            config.id, config.stage_type
        )));
    }
    Ok(Utf8PathBuf::from(dir))
}
