use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{Compression, StageId};
use crate::error::PipelineError;
use crate::pipeline::FailurePolicy;
use crate::stage::OutputSpec;

pub const DEFAULT_CONFIG_FILE: &str = "kira-pipeline.json";
pub const DEFAULT_MAX_LOG_VERSIONS: usize = 5;
pub const DEFAULT_MAX_RUN_RECORDS: usize = 50;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub name: String,
    #[serde(default)]
    pub storage: StorageEntry,
    #[serde(default)]
    pub max_log_versions: Option<usize>,
    #[serde(default)]
    pub max_run_records: Option<usize>,
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub scratch: Option<Utf8PathBuf>,
    #[serde(default)]
    pub remote: Option<Utf8PathBuf>,
    #[serde(default)]
    pub logs: Option<Utf8PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StageEntry {
    Shorthand(String),
    Detailed(StageEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StageEntryObject {
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub output_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub compression: Option<Compression>,
    #[serde(default)]
    pub storage_days: Option<u32>,
}

/// Local scratch, distributed tier and versioned store roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub scratch: Utf8PathBuf,
    pub remote: Utf8PathBuf,
    pub logs: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub id: StageId,
    pub stage_type: String,
    pub args: String,
    pub output: OutputSpec,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub name: String,
    pub storage: StorageLayout,
    pub max_log_versions: usize,
    pub max_run_records: usize,
    pub on_failure: FailurePolicy,
    pub stages: Vec<StageConfig>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(PipelineError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let name = config.name.trim().to_string();
        let is_valid_name = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid_name {
            return Err(PipelineError::ConfigParse(format!(
                "invalid pipeline name: {:?}",
                config.name
            )));
        }

        let storage = resolve_storage(config.storage)?;
        let max_log_versions = config.max_log_versions.unwrap_or(DEFAULT_MAX_LOG_VERSIONS);
        let max_run_records = config.max_run_records.unwrap_or(DEFAULT_MAX_RUN_RECORDS);
        if max_log_versions == 0 || max_run_records == 0 {
            return Err(PipelineError::ConfigParse(
                "max_log_versions and max_run_records must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let stages = config
            .stages
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let stage = resolve_stage(&name, index as u32, entry)?;
                if !seen.insert(stage.id.name().to_string()) {
                    return Err(PipelineError::ConfigParse(format!(
                        "duplicate stage name: {}",
                        stage.id.name()
                    )));
                }
                Ok(stage)
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            name,
            storage,
            max_log_versions,
            max_run_records,
            on_failure: config.on_failure.unwrap_or_default(),
            stages,
        })
    }
}

fn resolve_stage(pipeline: &str, num: u32, entry: StageEntry) -> Result<StageConfig, PipelineError> {
    let entry = match entry {
        StageEntry::Shorthand(value) => {
            let (stage_type, args) = match value.split_once(':') {
                Some((stage_type, args)) => (stage_type, Some(args.to_string())),
                None => (value.as_str(), None),
            };
            StageEntryObject {
                stage_type: stage_type.trim().to_string(),
                name: None,
                args,
                output_dir: None,
                compression: None,
                storage_days: None,
            }
        }
        StageEntry::Detailed(obj) => obj,
    };

    let name = entry.name.as_deref().unwrap_or(&entry.stage_type);
    let id = StageId::new(num, name)?;
    let output = OutputSpec {
        dir: entry
            .output_dir
            .unwrap_or_else(|| default_output_dir(pipeline, &id)),
        compression: entry.compression.unwrap_or_default(),
        storage_days: entry.storage_days,
    };
    if output.dir.is_absolute() {
        return Err(PipelineError::ConfigParse(format!(
            "output_dir of stage {id} must be relative to the remote root"
        )));
    }
    Ok(StageConfig {
        id,
        stage_type: entry.stage_type,
        args: entry.args.unwrap_or_default(),
        output,
    })
}

pub fn default_output_dir(pipeline: &str, stage: &StageId) -> Utf8PathBuf {
    Utf8PathBuf::from("data").join(pipeline).join(stage.to_string())
}

fn resolve_storage(entry: StorageEntry) -> Result<StorageLayout, PipelineError> {
    let needs_default = entry.scratch.is_none() || entry.remote.is_none() || entry.logs.is_none();
    let base = if needs_default {
        Some(default_storage_root()?)
    } else {
        None
    };
    let pick = |value: Option<Utf8PathBuf>, dir: &str| -> Result<Utf8PathBuf, PipelineError> {
        match (value, &base) {
            (Some(value), _) => Ok(value),
            (None, Some(base)) => Ok(base.join(dir)),
            (None, None) => Err(PipelineError::Filesystem(
                "unable to resolve storage directory".to_string(),
            )),
        }
    };
    Ok(StorageLayout {
        scratch: pick(entry.scratch, "scratch")?,
        remote: pick(entry.remote, "remote")?,
        logs: pick(entry.logs, "logs")?,
    })
}

fn default_storage_root() -> Result<Utf8PathBuf, PipelineError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-pipeline")).ok()
        })
        .ok_or_else(|| PipelineError::Filesystem("unable to resolve cache directory".to_string()))
}
