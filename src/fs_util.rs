use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::error::PipelineError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        PipelineError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(PipelineError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

/// Bundles every file under `root` into `zip_path`. Entries are sorted and carry a
/// fixed modification time so the same directory content gives the same bytes.
pub fn write_zip(root: &Utf8Path, zip_path: &Utf8Path) -> Result<usize, PipelineError> {
    let files = list_files(root)?;
    let file = fs::File::create(zip_path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("create zip {zip_path}: {err}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default());

    for path in &files {
        let relative = path
            .strip_prefix(root)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        writer
            .start_file(relative.as_str(), options)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let content =
            fs::read(path.as_std_path()).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        writer
            .write_all(&content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(files.len())
}

/// All regular files below `root`, sorted. A missing root lists as empty.
pub fn list_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    if !root.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("read dir {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = to_utf8(entry.path())?;
            if path.as_std_path().is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub fn dir_is_empty(dir: &Utf8Path) -> Result<bool, PipelineError> {
    let mut entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("read dir {dir}: {err}")))?;
    Ok(entries.next().is_none())
}

pub fn to_utf8(path: PathBuf) -> Result<Utf8PathBuf, PipelineError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| PipelineError::Filesystem(format!("non-utf8 path: {}", path.display())))
}

pub fn file_name(path: &Utf8Path) -> Result<&str, PipelineError> {
    path.file_name()
        .ok_or_else(|| PipelineError::Filesystem(format!("path has no file name: {path}")))
}
