use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::domain::StageId;
use crate::error::PipelineError;
use crate::fs_util;
use crate::gateway::StorageGateway;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySet {
    pub root: Utf8PathBuf,
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub meta: Utf8PathBuf,
    pub log: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
    pub remote_meta: Utf8PathBuf,
    pub remote_tmp: Utf8PathBuf,
}

impl DirectorySet {
    fn local_dirs(&self) -> [&Utf8Path; 5] {
        [
            self.input.as_path(),
            self.output.as_path(),
            self.meta.as_path(),
            self.log.as_path(),
            self.tmp.as_path(),
        ]
    }
}

/// Local scratch laid out as `<scratch>/<pipeline>/<stage>/<timestamp>/`.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    scratch: Utf8PathBuf,
    pipeline: String,
}

impl LocalWorkspace {
    pub fn new(scratch: impl Into<Utf8PathBuf>, pipeline: &str) -> Self {
        Self {
            scratch: scratch.into(),
            pipeline: pipeline.to_string(),
        }
    }

    pub fn scratch(&self) -> &Utf8Path {
        &self.scratch
    }

    pub fn remote_meta_dir(&self, stage: &StageId) -> Utf8PathBuf {
        Utf8PathBuf::from("meta")
            .join(&self.pipeline)
            .join(stage.to_string())
    }

    pub fn layout(&self, stage: &StageId, timestamp: i64) -> DirectorySet {
        let root = self
            .scratch
            .join(&self.pipeline)
            .join(stage.to_string())
            .join(timestamp.to_string());
        DirectorySet {
            input: root.join("input"),
            output: root.join("output"),
            meta: root.join("meta"),
            log: root.join("log"),
            tmp: root.join("tmp"),
            remote_meta: self.remote_meta_dir(stage),
            remote_tmp: Utf8PathBuf::from("tmp")
                .join(&self.pipeline)
                .join(stage.to_string())
                .join(timestamp.to_string()),
            root,
        }
    }

    /// Creates fresh local directories. Leftover content from an earlier run is an error.
    pub fn materialize(&self, stage: &StageId, timestamp: i64) -> Result<DirectorySet, PipelineError> {
        let dirs = self.layout(stage, timestamp);
        for dir in dirs.local_dirs() {
            if dir.as_std_path().exists() && !fs_util::dir_is_empty(dir)? {
                return Err(PipelineError::Workspace(format!(
                    "unclean workspace at {dir}, recover the run to reclaim it"
                )));
            }
        }
        for dir in dirs.local_dirs() {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| PipelineError::Workspace(format!("create {dir}: {err}")))?;
        }
        debug!(root = %dirs.root, "workspace materialized");
        Ok(dirs)
    }

    pub fn cleanup(&self, dirs: &DirectorySet, gateway: &StorageGateway) -> Result<(), PipelineError> {
        let mut first_error = None;
        if dirs.root.as_std_path().exists() {
            if let Err(err) = fs::remove_dir_all(dirs.root.as_std_path()) {
                first_error = Some(PipelineError::Workspace(format!(
                    "remove {}: {err}",
                    dirs.root
                )));
            }
        }
        if let Err(err) = gateway.remove_prefix(&dirs.remote_tmp) {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(root = %dirs.root, "workspace removed");
                Ok(())
            }
        }
    }

    /// Removes whatever an interrupted run left behind. Returns whether anything was there.
    pub fn reclaim(
        &self,
        stage: &StageId,
        timestamp: i64,
        gateway: &StorageGateway,
    ) -> Result<bool, PipelineError> {
        let dirs = self.layout(stage, timestamp);
        let stale = dirs.root.as_std_path().exists();
        self.cleanup(&dirs, gateway)?;
        if stale {
            info!(stage = %stage, timestamp, "reclaimed stale workspace");
        }
        Ok(stale)
    }

    /// Materializes the workspace and hands back a guard that removes it when dropped.
    pub fn acquire<'a>(
        &'a self,
        stage: &StageId,
        timestamp: i64,
        gateway: &'a StorageGateway,
    ) -> Result<WorkspaceGuard<'a>, PipelineError> {
        let dirs = self.materialize(stage, timestamp)?;
        Ok(WorkspaceGuard {
            workspace: self,
            gateway,
            dirs,
            released: false,
        })
    }
}

pub struct WorkspaceGuard<'a> {
    workspace: &'a LocalWorkspace,
    gateway: &'a StorageGateway,
    dirs: DirectorySet,
    released: bool,
}

impl WorkspaceGuard<'_> {
    pub fn dirs(&self) -> &DirectorySet {
        &self.dirs
    }

    pub fn release(mut self) -> Result<(), PipelineError> {
        self.released = true;
        self.workspace.cleanup(&self.dirs, self.gateway)
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.workspace.cleanup(&self.dirs, self.gateway) {
            warn!(root = %self.dirs.root, error = %err, "workspace cleanup failed");
        }
    }
}
