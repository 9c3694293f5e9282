use std::fs;
use std::io::Write;

use camino::Utf8PathBuf;
use tracing::info;

use crate::config::StageConfig;
use crate::error::PipelineError;
use crate::stage::{SinkLogic, StageBehavior, StageContext, StagedInput};

/// Copies staged inputs into `<dest>/<timestamp>/` on local storage.
pub struct CopyToLocal {
    dest: Utf8PathBuf,
}

impl CopyToLocal {
    pub fn new(dest: impl Into<Utf8PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    pub fn build(config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        let dest = config.args.trim();
        if dest.is_empty() {
            return Err(PipelineError::InvalidPipeline(format!(
                "stage {} (copy_to_local) needs a destination in its args",
                config.id
            )));
        }
        Ok(StageBehavior::Sink(Box::new(Self::new(dest))))
    }
}

impl SinkLogic for CopyToLocal {
    fn sink(&self, inputs: &[StagedInput], ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        if inputs.is_empty() {
            return Ok(());
        }
        let target_dir = self.dest.join(ctx.timestamp().to_string());
        fs::create_dir_all(target_dir.as_std_path())
            .map_err(|err| PipelineError::logic(ctx.stage(), format!("create {target_dir}: {err}")))?;

        let log_path = ctx.create_log("copy_to_local.log")?;
        let mut log = fs::OpenOptions::new()
            .append(true)
            .open(log_path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        for input in inputs {
            let Some(local) = &input.local else {
                continue;
            };
            let target = target_dir.join(input.file_ref.name());
            fs::copy(local.as_std_path(), target.as_std_path())
                .map_err(|err| PipelineError::logic(ctx.stage(), format!("copy to {target}: {err}")))?;
            writeln!(log, "{} -> {target}", input.file_ref)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        info!(dest = %target_dir, count = inputs.len(), "copied to local destination");
        Ok(())
    }
}

/// Accepts inputs and does nothing with them.
pub struct NullSink;

impl NullSink {
    pub fn build(_config: &StageConfig) -> Result<StageBehavior, PipelineError> {
        Ok(StageBehavior::Sink(Box::new(NullSink)))
    }
}

impl SinkLogic for NullSink {
    fn sink(&self, _inputs: &[StagedInput], _ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        Ok(())
    }

    fn stages_inputs(&self) -> bool {
        false
    }
}
