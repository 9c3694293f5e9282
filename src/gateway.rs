use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use crate::domain::{Compression, FileRef};
use crate::error::PipelineError;
use crate::fs_util;
use crate::store::ObjectStore;

pub const META_BUNDLE: &str = "meta.zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub local: Utf8PathBuf,
    pub bytes: u64,
}

impl Fetched {
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// The only path between stages and the distributed tier.
#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<dyn ObjectStore>,
}

impl StorageGateway {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Copies `remote` into `local_dir` under its unversioned name, decompressed.
    pub fn fetch(&self, remote: &FileRef, local_dir: &Utf8Path) -> Result<Fetched, PipelineError> {
        if self.store.stat(remote.path())?.is_none() {
            return Err(PipelineError::transfer(remote, "object does not exist"));
        }
        fs::create_dir_all(local_dir.as_std_path())
            .map_err(|err| PipelineError::transfer(local_dir, err))?;
        let local = local_dir.join(remote.name());

        let bytes = match remote.compression() {
            Compression::None => self.store.copy_to(remote.path(), &local)?,
            Compression::Gz => {
                let packed = self.store.get(remote.path())?;
                let mut content = Vec::new();
                GzDecoder::new(packed.as_slice())
                    .read_to_end(&mut content)
                    .map_err(|err| PipelineError::transfer(remote, err))?;
                fs::write(local.as_std_path(), &content)
                    .map_err(|err| PipelineError::transfer(&local, err))?;
                content.len() as u64
            }
        };

        if bytes == 0 {
            warn!(file = %remote, "fetched a zero-byte file");
        } else {
            debug!(file = %remote, bytes, "fetched");
        }
        Ok(Fetched { local, bytes })
    }

    /// Same bytes at an existing version return that version; different bytes are rejected.
    pub fn publish(
        &self,
        local: &Utf8Path,
        remote_dir: &Utf8Path,
        timestamp: i64,
        compression: Compression,
    ) -> Result<FileRef, PipelineError> {
        let name = fs_util::file_name(local)?;
        let target = FileRef::new(remote_dir, name, timestamp, compression);

        if self.store.stat(target.path())?.is_some() {
            let existing = self.store.get(target.path())?;
            if existing == encode(local, compression)? {
                info!(file = %target, "already published with identical content");
                return Ok(target);
            }
            return Err(PipelineError::transfer(
                &target,
                "version already exists with different content",
            ));
        }

        match compression {
            Compression::None => self.store.put_from(target.path(), local)?,
            Compression::Gz => self.store.put(target.path(), &encode(local, compression)?)?,
        }
        debug!(file = %target, "published");
        Ok(target)
    }

    pub fn size(&self, remote: &FileRef) -> Result<u64, PipelineError> {
        self.store
            .stat(remote.path())?
            .ok_or_else(|| PipelineError::transfer(remote, "object does not exist"))
    }

    pub fn exists(&self, remote: &FileRef) -> Result<bool, PipelineError> {
        Ok(self.store.stat(remote.path())?.is_some())
    }

    pub fn remove(&self, remote: &FileRef) -> Result<(), PipelineError> {
        self.store.delete(remote.path())
    }

    pub fn list(&self, dir: &Utf8Path) -> Result<Vec<FileRef>, PipelineError> {
        let mut refs = Vec::new();
        for path in self.store.list(dir)? {
            if path.parent() != Some(dir) {
                continue;
            }
            match path.as_str().parse::<FileRef>() {
                Ok(file) => refs.push(file),
                Err(_) => debug!(path = %path, "skipping unversioned object"),
            }
        }
        Ok(refs)
    }

    pub fn list_at(&self, dir: &Utf8Path, timestamp: i64) -> Result<Vec<FileRef>, PipelineError> {
        Ok(self
            .list(dir)?
            .into_iter()
            .filter(|file| file.timestamp() == timestamp)
            .collect())
    }

    pub fn list_newest(&self, dir: &Utf8Path) -> Result<Vec<FileRef>, PipelineError> {
        let mut newest: BTreeMap<String, FileRef> = BTreeMap::new();
        for file in self.list(dir)? {
            let replace = newest
                .get(file.name())
                .map(|current| current.timestamp() < file.timestamp())
                .unwrap_or(true);
            if replace {
                newest.insert(file.name().to_string(), file);
            }
        }
        Ok(newest.into_values().collect())
    }

    pub fn remove_prefix(&self, prefix: &Utf8Path) -> Result<usize, PipelineError> {
        let objects = self.store.list(prefix)?;
        for path in &objects {
            self.store.delete(path)?;
        }
        Ok(objects.len())
    }

    /// Unpacks the newest meta bundle published strictly before `before`.
    pub fn fetch_meta(
        &self,
        remote_meta: &Utf8Path,
        before: i64,
        meta_dir: &Utf8Path,
        tmp_dir: &Utf8Path,
    ) -> Result<Option<FileRef>, PipelineError> {
        let bundle = self
            .list(remote_meta)?
            .into_iter()
            .filter(|file| file.name() == META_BUNDLE && file.timestamp() < before)
            .max_by_key(|file| file.timestamp());
        let Some(bundle) = bundle else {
            return Ok(None);
        };
        let fetched = self.fetch(&bundle, tmp_dir)?;
        if !fetched.is_empty() {
            fs_util::extract_zip(fetched.local.as_std_path(), meta_dir.as_std_path())?;
        }
        fs::remove_file(fetched.local.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        debug!(bundle = %bundle, "meta restored");
        Ok(Some(bundle))
    }

    pub fn publish_meta(
        &self,
        meta_dir: &Utf8Path,
        remote_meta: &Utf8Path,
        timestamp: i64,
        tmp_dir: &Utf8Path,
    ) -> Result<Option<FileRef>, PipelineError> {
        if fs_util::list_files(meta_dir)?.is_empty() {
            return Ok(None);
        }
        let bundle_path = tmp_dir.join(META_BUNDLE);
        fs_util::write_zip(meta_dir, &bundle_path)?;
        let published = self.publish(&bundle_path, remote_meta, timestamp, Compression::None);
        fs::remove_file(bundle_path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        published.map(Some)
    }
}

fn encode(local: &Utf8Path, compression: Compression) -> Result<Vec<u8>, PipelineError> {
    let content =
        fs::read(local.as_std_path()).map_err(|err| PipelineError::transfer(local, err))?;
    match compression {
        Compression::None => Ok(content),
        Compression::Gz => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder
                .write_all(&content)
                .map_err(|err| PipelineError::transfer(local, err))?;
            encoder
                .finish()
                .map_err(|err| PipelineError::transfer(local, err))
        }
    }
}
