use std::fs;
use std::process::Command;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::stage::StageContext;

/// Splits stage args on whitespace. Single quotes group words and are removed.
pub fn split_args(args: &str) -> Result<Vec<String>, PipelineError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for ch in args.chars() {
        match ch {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            ch if ch.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            ch => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err(PipelineError::InvalidPipeline(format!(
            "unclosed quote in stage args: {args}"
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parses a command template and rejects an empty one.
pub fn parse_template(args: &str) -> Result<Vec<String>, PipelineError> {
    let template = split_args(args)?;
    if template.is_empty() {
        return Err(PipelineError::InvalidPipeline(
            "command stage needs a program in its args".to_string(),
        ));
    }
    Ok(template)
}

/// Placeholder values for one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandVars {
    values: Vec<(&'static str, String)>,
}

impl CommandVars {
    pub fn from_context(ctx: &StageContext<'_>) -> Self {
        let dirs = ctx.dirs();
        Self {
            values: vec![
                ("input_dir", dirs.input.to_string()),
                ("output_dir", dirs.output.to_string()),
                ("meta_dir", dirs.meta.to_string()),
                ("log_dir", dirs.log.to_string()),
                ("tmp_dir", dirs.tmp.to_string()),
                ("timestamp", ctx.timestamp().to_string()),
            ],
        }
    }

    pub fn with_file(mut self, file: &Utf8Path) -> Self {
        let noext = file.with_extension("");
        self.values.push(("file", file.to_string()));
        self.values.push(("file_noext", noext.to_string()));
        self
    }

    pub fn substitute(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .map(|word| {
                self.values
                    .iter()
                    .fold(word.clone(), |word, (name, value)| {
                        word.replace(&format!("{{{name}}}"), value)
                    })
            })
            .collect()
    }
}

/// Runs `argv` without a shell from the stage tmp dir. Output is captured into
/// `<stem>.out` and `<stem>.err` in the log dir. A non-zero exit fails the stage.
pub fn run_command(
    argv: &[String],
    ctx: &mut StageContext<'_>,
    stem: &str,
) -> Result<(), PipelineError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(PipelineError::logic(ctx.stage(), "empty command"));
    };
    info!(program = %program, args = ?args, "running command");

    let output = Command::new(program)
        .args(args)
        .current_dir(ctx.dirs().tmp.as_std_path())
        .output()
        .map_err(|err| PipelineError::logic(ctx.stage(), format!("failed to start {program}: {err}")))?;

    let out_path = ctx.dirs().log.join(format!("{stem}.out"));
    let err_path = ctx.dirs().log.join(format!("{stem}.err"));
    fs::write(out_path.as_std_path(), &output.stdout)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    fs::write(err_path.as_std_path(), &output.stderr)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    ctx.add_log(out_path);
    ctx.add_log(err_path);

    if !output.status.success() {
        return Err(PipelineError::logic(
            ctx.stage(),
            format!("{program} exited with {}", output.status),
        ));
    }
    debug!(program = %program, "command finished");
    Ok(())
}
