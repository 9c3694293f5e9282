use std::fs;
use std::io::{self, Write};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::PipelineError;
use crate::fs_util;

/// Write-once object storage for the distributed tier.
///
/// Paths are relative to the store root. `put` never replaces an existing object.
pub trait ObjectStore: Send + Sync {
    fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, PipelineError>;

    fn put(&self, path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError>;

    fn stat(&self, path: &Utf8Path) -> Result<Option<u64>, PipelineError>;

    fn delete(&self, path: &Utf8Path) -> Result<(), PipelineError>;

    fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError>;

    fn copy_to(&self, path: &Utf8Path, dest: &Utf8Path) -> Result<u64, PipelineError> {
        let content = self.get(path)?;
        fs::write(dest.as_std_path(), &content)
            .map_err(|err| PipelineError::transfer(dest, err))?;
        Ok(content.len() as u64)
    }

    fn put_from(&self, path: &Utf8Path, src: &Utf8Path) -> Result<(), PipelineError> {
        let content =
            fs::read(src.as_std_path()).map_err(|err| PipelineError::transfer(src, err))?;
        self.put(path, &content)
    }
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, path: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
        let is_relative = path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir));
        if !is_relative {
            return Err(PipelineError::transfer(
                path,
                "object path must be relative and stay inside the store",
            ));
        }
        Ok(self.root.join(path))
    }

    fn staging_file(&self, target: &Utf8Path) -> Result<NamedTempFile, PipelineError> {
        let parent = target
            .parent()
            .ok_or_else(|| PipelineError::transfer(target, "invalid destination path"))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::transfer(target, err))?;
        tempfile::Builder::new()
            .prefix(".kira-pl-put")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PipelineError::transfer(target, err))
    }

    fn persist(&self, temp: NamedTempFile, target: &Utf8Path) -> Result<(), PipelineError> {
        temp.persist_noclobber(target.as_std_path())
            .map_err(|err| match err.error.kind() {
                io::ErrorKind::AlreadyExists => {
                    PipelineError::transfer(target, "object already exists")
                }
                _ => PipelineError::transfer(target, err.error),
            })?;
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, path: &Utf8Path) -> Result<Vec<u8>, PipelineError> {
        let full = self.resolve(path)?;
        fs::read(full.as_std_path()).map_err(|err| PipelineError::transfer(path, err))
    }

    fn put(&self, path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
        let full = self.resolve(path)?;
        if full.as_std_path().exists() {
            return Err(PipelineError::transfer(path, "object already exists"));
        }
        let mut temp = self.staging_file(&full)?;
        temp.write_all(content)
            .map_err(|err| PipelineError::transfer(path, err))?;
        self.persist(temp, &full)
    }

    fn stat(&self, path: &Utf8Path) -> Result<Option<u64>, PipelineError> {
        let full = self.resolve(path)?;
        match fs::metadata(full.as_std_path()) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PipelineError::transfer(path, err)),
        }
    }

    fn delete(&self, path: &Utf8Path) -> Result<(), PipelineError> {
        let full = self.resolve(path)?;
        match fs::remove_file(full.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PipelineError::transfer(path, err)),
        }
    }

    fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        let full = self.resolve(prefix)?;
        let mut objects = Vec::new();
        for path in fs_util::list_files(&full)? {
            let is_staging = path
                .file_name()
                .map(|name| name.starts_with(".kira-pl-put"))
                .unwrap_or(false);
            if is_staging {
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            objects.push(relative.to_path_buf());
        }
        Ok(objects)
    }

    fn copy_to(&self, path: &Utf8Path, dest: &Utf8Path) -> Result<u64, PipelineError> {
        let full = self.resolve(path)?;
        fs::copy(full.as_std_path(), dest.as_std_path())
            .map_err(|err| PipelineError::transfer(path, err))
    }

    fn put_from(&self, path: &Utf8Path, src: &Utf8Path) -> Result<(), PipelineError> {
        let full = self.resolve(path)?;
        if full.as_std_path().exists() {
            return Err(PipelineError::transfer(path, "object already exists"));
        }
        let temp = self.staging_file(&full)?;
        fs::copy(src.as_std_path(), temp.path())
            .map_err(|err| PipelineError::transfer(path, err))?;
        self.persist(temp, &full)
    }
}
