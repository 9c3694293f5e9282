pub mod command;
pub mod filter;
pub mod sink;
pub mod source;

use std::collections::HashMap;

use crate::config::StageConfig;
use crate::error::PipelineError;
use crate::stage::{Stage, StageBehavior};

pub type StageConstructor = fn(&StageConfig) -> Result<StageBehavior, PipelineError>;

/// Maps stage type tags to their constructors.
pub struct StageRegistry {
    constructors: HashMap<&'static str, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("list_dir", source::ListDir::build);
        registry.register("local_files", source::LocalFiles::build);
        registry.register("execute_source", source::ExecuteSource::build);
        registry.register("null_source", source::NullSource::build);
        registry.register("filter", filter::RegexFilter::build);
        registry.register("execute_per_file", filter::ExecutePerFile::build);
        registry.register("execute_per_dir", filter::ExecutePerDir::build);
        registry.register("null_stage", filter::NullStage::build);
        registry.register("copy_to_local", sink::CopyToLocal::build);
        registry.register("null_sink", sink::NullSink::build);
        registry
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Adds or replaces the constructor for `stage_type`.
    pub fn register(&mut self, stage_type: &'static str, constructor: StageConstructor) {
        self.constructors.insert(stage_type, constructor);
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn build(&self, config: &StageConfig) -> Result<Stage, PipelineError> {
        let constructor = self
            .constructors
            .get(config.stage_type.as_str())
            .ok_or_else(|| PipelineError::UnknownStageType(config.stage_type.clone()))?;
        let behavior = constructor(config)?;
        Ok(Stage::new(
            config.id.clone(),
            &config.args,
            behavior,
            config.output.clone(),
        ))
    }
}
