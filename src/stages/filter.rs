use regex::Regex;

use crate::config::StageConfig;
use crate::error::PipelineError;
use crate::stage::{FilterLogic, StageBehavior, StageContext, StageOutput, StagedInput};
use crate::stages::command::{self, CommandVars};

/// Forwards the inputs whose remote path matches a pattern. Nothing is staged.
pub struct RegexFilter {
    pattern: Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str) -> Result<Self, PipelineError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| PipelineError::InvalidPipeline(format!("invalid filter pattern: {err}")))?;
        Ok(Self { pattern })
    }

    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Filter(Box::new(Self::new(&config.args)?)))
    }
}

impl FilterLogic for RegexFilter {
    fn process(
        &self,
        inputs: &[StagedInput],
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
        Ok(inputs
            .iter()
            .filter(|input| self.pattern.is_match(input.file_ref.path().as_str()))
            .map(|input| StageOutput::Existing(input.file_ref.clone()))
            .collect())
    }

    fn stages_inputs(&self) -> bool {
        false
    }
}

/// Runs a command once per staged input, substituting `{file}` and `{file_noext}`.
pub struct ExecutePerFile {
    template: Vec<String>,
}

impl ExecutePerFile {
    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Filter(Box::new(Self {
            template: command::parse_template(&config.args)?,
        })))
    }
}

impl FilterLogic for ExecutePerFile {
    fn process(
        &self,
        inputs: &[StagedInput],
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
        for input in inputs {
            let Some(local) = &input.local else {
                continue;
            };
            let argv = CommandVars::from_context(ctx)
                .with_file(local)
                .substitute(&self.template);
            command::run_command(&argv, ctx, input.file_ref.name())?;
        }
        Ok(ctx
            .output_files()?
            .into_iter()
            .map(StageOutput::Local)
            .collect())
    }
}

/// Runs a command once over the whole input dir.
pub struct ExecutePerDir {
    template: Vec<String>,
}

impl ExecutePerDir {
    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Filter(Box::new(Self {
            template: command::parse_template(&config.args)?,
        })))
    }
}

impl FilterLogic for ExecutePerDir {
    fn process(
        &self,
        _inputs: &[StagedInput],
        ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
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

/// Passes inputs through untouched.
pub struct NullStage;

impl NullStage {
    pub fn build(_config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Filter(Box::new(NullStage)))
    }
}

impl FilterLogic for NullStage {
    fn process(
        &self,
        inputs: &[StagedInput],
        _ctx: &mut StageContext<'_>,
    ) -> Result<Vec<StageOutput>, PipelineError> {
        Ok(inputs
            .iter()
            .map(|input| StageOutput::Existing(input.file_ref.clone()))
            .collect())
    }

    fn stages_inputs(&self) -> bool {
        false
    }
}
