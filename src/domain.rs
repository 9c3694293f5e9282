use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Stage identity within a pipeline, rendered as `003-name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId {
    num: u32,
    name: String,
}

impl StageId {
    pub fn new(num: u32, name: &str) -> Result<Self, PipelineError> {
        let name = name.trim();
        let is_valid = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid || num > 999 {
            return Err(PipelineError::InvalidStageId(format!("{num:03}-{name}")));
        }
        Ok(Self {
            num,
            name: name.to_string(),
        })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{}", self.num, self.name)
    }
}

impl FromStr for StageId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (num, name) = value
            .trim()
            .split_once('-')
            .ok_or_else(|| PipelineError::InvalidStageId(value.to_string()))?;
        let num = num
            .parse::<u32>()
            .map_err(|_| PipelineError::InvalidStageId(value.to_string()))?;
        Self::new(num, name)
    }
}

impl TryFrom<String> for StageId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageId> for String {
    fn from(value: StageId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Filter,
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Filter => write!(f, "filter"),
            StageKind::Sink => write!(f, "sink"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gz,
}

impl Compression {
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gz => "gz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Compression {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Compression::None),
            "gz" => Ok(Compression::Gz),
            other => Err(PipelineError::InvalidFileRef(format!(
                "unknown compression: {other}"
            ))),
        }
    }
}

/// A versioned object on the distributed tier: `<dir>/<name>.<timestamp>.<compression>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileRef {
    path: Utf8PathBuf,
    name: String,
    timestamp: i64,
    compression: Compression,
}

impl FileRef {
    pub fn new(dir: &Utf8Path, name: &str, timestamp: i64, compression: Compression) -> Self {
        let path = dir.join(format!("{name}.{timestamp}.{}", compression.extension()));
        Self {
            path,
            name: name.to_string(),
            timestamp,
            compression,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn dir(&self) -> &Utf8Path {
        self.path.parent().unwrap_or(Utf8Path::new(""))
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl FromStr for FileRef {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let path = Utf8PathBuf::from(value.trim());
        let basename = path
            .file_name()
            .ok_or_else(|| PipelineError::InvalidFileRef(value.to_string()))?;
        let mut parts = basename.rsplitn(3, '.');
        let (Some(ext), Some(timestamp), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(PipelineError::InvalidFileRef(value.to_string()));
        };
        let compression = ext.parse()?;
        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|_| PipelineError::InvalidFileRef(value.to_string()))?;
        if name.is_empty() {
            return Err(PipelineError::InvalidFileRef(value.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            path,
            timestamp,
            compression,
        })
    }
}

impl TryFrom<String> for FileRef {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileRef> for String {
    fn from(value: FileRef) -> Self {
        value.path.into_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Out,
    Error,
    Log,
    Other,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::Out,
        LogCategory::Error,
        LogCategory::Log,
        LogCategory::Other,
    ];

    /// Category for a log file, decided by its basename and last suffix.
    pub fn classify(filename: &str) -> Self {
        let basename = Utf8Path::new(filename).file_name().unwrap_or(filename);
        match basename {
            "stdout" => return LogCategory::Out,
            "stderr" => return LogCategory::Error,
            _ => {}
        }
        match basename.rsplit_once('.').map(|(_, ext)| ext) {
            Some("out") => LogCategory::Out,
            Some("err") | Some("error") => LogCategory::Error,
            Some("log") => LogCategory::Log,
            _ => LogCategory::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Out => "out",
            LogCategory::Error => "error",
            LogCategory::Log => "log",
            LogCategory::Other => "other",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
