use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{LogCategory, StageId};
use crate::error::PipelineError;
use crate::fs_util;

pub trait VersionedStore: Send + Sync {
    /// Stores `content` at `version`, then evicts the oldest versions beyond
    /// `max_versions`. Returns false when `version` itself was evicted.
    fn put(
        &self,
        namespace: &str,
        key: &str,
        content: &[u8],
        version: i64,
        max_versions: usize,
    ) -> Result<bool, PipelineError>;

    fn get(&self, namespace: &str, key: &str, version: Option<i64>) -> Result<Vec<u8>, PipelineError>;

    fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<i64>, PipelineError>;

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, PipelineError>;
}

fn not_found(namespace: &str, key: &str, version: Option<i64>) -> PipelineError {
    match version {
        Some(version) => PipelineError::NotFound(format!("{namespace}/{key}@{version}")),
        None => PipelineError::NotFound(format!("{namespace}/{key}")),
    }
}

fn lock_poisoned() -> PipelineError {
    PipelineError::Filesystem("versioned store lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct MemoryVersionedStore {
    entries: Mutex<HashMap<(String, String), BTreeMap<i64, Vec<u8>>>>,
}

impl MemoryVersionedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionedStore for MemoryVersionedStore {
    fn put(
        &self,
        namespace: &str,
        key: &str,
        content: &[u8],
        version: i64,
        max_versions: usize,
    ) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        let versions = entries
            .entry((namespace.to_string(), key.to_string()))
            .or_default();
        versions.insert(version, content.to_vec());
        while versions.len() > max_versions.max(1) {
            versions.pop_first();
        }
        Ok(versions.contains_key(&version))
    }

    fn get(&self, namespace: &str, key: &str, version: Option<i64>) -> Result<Vec<u8>, PipelineError> {
        let entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        let versions = entries
            .get(&(namespace.to_string(), key.to_string()))
            .ok_or_else(|| not_found(namespace, key, version))?;
        let content = match version {
            Some(version) => versions.get(&version),
            None => versions.values().next_back(),
        };
        content
            .cloned()
            .ok_or_else(|| not_found(namespace, key, version))
    }

    fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<i64>, PipelineError> {
        let entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, PipelineError> {
        let entries = self.entries.lock().map_err(|_| lock_poisoned())?;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory-backed store: `<root>/<namespace>/<key>/<version>`.
#[derive(Debug)]
pub struct FsVersionedStore {
    root: Utf8PathBuf,
    lock: Mutex<()>,
}

impl FsVersionedStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<Utf8PathBuf, PipelineError> {
        validate_part(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn key_dir(&self, namespace: &str, key: &str) -> Result<Utf8PathBuf, PipelineError> {
        validate_part(key)?;
        Ok(self.namespace_dir(namespace)?.join(key))
    }

    fn versions_in(dir: &Utf8Path) -> Result<Vec<i64>, PipelineError> {
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PipelineError::Filesystem(format!("read dir {dir}: {err}"))),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

impl VersionedStore for FsVersionedStore {
    fn put(
        &self,
        namespace: &str,
        key: &str,
        content: &[u8],
        version: i64,
        max_versions: usize,
    ) -> Result<bool, PipelineError> {
        let dir = self.key_dir(namespace, key)?;
        let _guard = self.lock.lock().map_err(|_| lock_poisoned())?;

        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".kira-pl-version")
            .tempfile_in(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        temp.persist(dir.join(version.to_string()).as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.error.to_string()))?;

        let versions = Self::versions_in(&dir)?;
        let excess = versions.len().saturating_sub(max_versions.max(1));
        for evicted in &versions[..excess] {
            fs::remove_file(dir.join(evicted.to_string()).as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            debug!(namespace, key, version = evicted, "evicted version");
        }
        Ok(!versions[..excess].contains(&version))
    }

    fn get(&self, namespace: &str, key: &str, version: Option<i64>) -> Result<Vec<u8>, PipelineError> {
        let dir = self.key_dir(namespace, key)?;
        let version = match version {
            Some(version) => version,
            None => *Self::versions_in(&dir)?
                .last()
                .ok_or_else(|| not_found(namespace, key, None))?,
        };
        match fs::read(dir.join(version.to_string()).as_std_path()) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(not_found(namespace, key, Some(version)))
            }
            Err(err) => Err(PipelineError::Filesystem(err.to_string())),
        }
    }

    fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<i64>, PipelineError> {
        Self::versions_in(&self.key_dir(namespace, key)?)
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, PipelineError> {
        let ns_dir = self.namespace_dir(namespace)?;
        let mut keys = Vec::new();
        for path in fs_util::list_files(&ns_dir)? {
            let is_version = path
                .file_name()
                .map(|name| name.parse::<i64>().is_ok())
                .unwrap_or(false);
            if !is_version {
                continue;
            }
            let Some(key_dir) = path.parent() else {
                continue;
            };
            let key = key_dir
                .strip_prefix(&ns_dir)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            keys.push(key.as_str().to_string());
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn validate_part(part: &str) -> Result<(), PipelineError> {
    let is_valid = !part.is_empty()
        && Utf8Path::new(part)
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
    if is_valid {
        Ok(())
    } else {
        Err(PipelineError::Filesystem(format!(
            "invalid versioned store key: {part}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRef {
    pub category: LogCategory,
    pub key: String,
    pub version: i64,
}

impl fmt::Display for LogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.category, self.key, self.version)
    }
}

/// Categorized run logs of one pipeline, namespaced `<pipeline>.<category>`.
#[derive(Clone)]
pub struct LogStore {
    backend: Arc<dyn VersionedStore>,
    pipeline: String,
    max_versions: usize,
}

impl LogStore {
    pub fn new(backend: Arc<dyn VersionedStore>, pipeline: &str, max_versions: usize) -> Self {
        Self {
            backend,
            pipeline: pipeline.to_string(),
            max_versions,
        }
    }

    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    pub fn classify(filename: &str) -> LogCategory {
        LogCategory::classify(filename)
    }

    pub fn key(stage: &StageId, filename: &str) -> String {
        format!("{stage}/{filename}")
    }

    fn namespace(&self, category: LogCategory) -> String {
        format!("{}.{category}", self.pipeline)
    }

    /// Returns `None` when `version` is older than every retained version and
    /// was evicted by this write.
    pub fn put(
        &self,
        category: LogCategory,
        key: &str,
        content: &[u8],
        version: i64,
    ) -> Result<Option<LogRef>, PipelineError> {
        let retained = self.backend.put(
            &self.namespace(category),
            key,
            content,
            version,
            self.max_versions,
        )?;
        if !retained {
            warn!(category = %category, key, version, "log version evicted on write");
            return Ok(None);
        }
        Ok(Some(LogRef {
            category,
            key: key.to_string(),
            version,
        }))
    }

    pub fn get(
        &self,
        category: LogCategory,
        key: &str,
        version: Option<i64>,
    ) -> Result<Vec<u8>, PipelineError> {
        self.backend.get(&self.namespace(category), key, version)
    }

    pub fn list_versions(&self, category: LogCategory, key: &str) -> Result<Vec<i64>, PipelineError> {
        self.backend.list_versions(&self.namespace(category), key)
    }

    /// A store failure is returned after the remaining files were attempted.
    pub fn persist(
        &self,
        stage: &StageId,
        timestamp: i64,
        files: &[Utf8PathBuf],
    ) -> Result<Vec<LogRef>, PipelineError> {
        let mut refs = Vec::new();
        let mut first_error = None;
        for file in files {
            let Some(filename) = file.file_name() else {
                continue;
            };
            let content = match fs::read(file.as_std_path()) {
                Ok(content) => content,
                Err(err) => {
                    warn!(file = %file, error = %err, "log file not readable, skipping");
                    continue;
                }
            };
            let category = Self::classify(filename);
            match self.put(category, &Self::key(stage, filename), &content, timestamp) {
                Ok(Some(log_ref)) => refs.push(log_ref),
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %file, error = %err, "failed to persist log");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(refs),
        }
    }

    pub fn restore(
        &self,
        stage: &StageId,
        timestamp: i64,
        dir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let prefix = format!("{stage}/");
        let mut restored = Vec::new();
        for category in LogCategory::ALL {
            let namespace = self.namespace(category);
            for key in self.backend.list_keys(&namespace)? {
                let Some(filename) = key.strip_prefix(&prefix) else {
                    continue;
                };
                if !self.backend.list_versions(&namespace, &key)?.contains(&timestamp) {
                    continue;
                }
                let content = self.backend.get(&namespace, &key, Some(timestamp))?;
                let target = dir.join(filename);
                fs::write(target.as_std_path(), content)
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                restored.push(target);
            }
        }
        restored.sort();
        Ok(restored)
    }
}
