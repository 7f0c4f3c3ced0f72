use super::{extension_of, BackupType};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One regular file found under a job's source directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl SourceFile {
    pub fn target_in(&self, target_root: &Path) -> PathBuf {
        target_root.join(&self.relative)
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<SourceFile>,
    /// Relative paths of every directory below the source root.
    pub directories: Vec<PathBuf>,
    /// Entries that could not be read; they are skipped.
    pub unreadable: Vec<(PathBuf, String)>,
}

pub struct DirectoryScanner<'a> {
    source: &'a Path,
}

impl<'a> DirectoryScanner<'a> {
    pub fn new(source: &'a Path) -> Self {
        Self { source }
    }

    /// Walks the tree depth-first. Fails only if the root itself is unreadable.
    pub fn scan(&self) -> std::io::Result<ScanResult> {
        std::fs::read_dir(self.source)?;

        let mut result = ScanResult::default();
        for entry in WalkDir::new(self.source).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!("Skipping unreadable entry {}: {}", path.display(), e);
                    result.unreadable.push((path, e.to_string()));
                    continue;
                }
            };

            let relative = match entry.path().strip_prefix(self.source) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };

            if entry.file_type().is_dir() {
                result.directories.push(relative);
                continue;
            }
            if !entry.file_type().is_file() {
                debug!("Skipping non-regular entry {}", entry.path().display());
                continue;
            }

            match entry.metadata() {
                Ok(metadata) => result.files.push(SourceFile {
                    path: entry.path().to_path_buf(),
                    relative,
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                }),
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    result.unreadable.push((entry.path().to_path_buf(), e.to_string()));
                }
            }
        }

        Ok(result)
    }
}

/// Whether the file must be copied for this backup type.
///
/// DIFFERENTIAL copies only when the target is missing or older than the source.
pub fn needs_copy(file: &SourceFile, target: &Path, backup_type: BackupType) -> bool {
    if backup_type == BackupType::Full {
        return true;
    }
    let target_modified = match std::fs::metadata(target).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return true,
    };
    match file.modified {
        Some(source_modified) => source_modified > target_modified,
        None => true,
    }
}

/// Rank of a file under the configured priority extensions; lower runs first.
pub fn priority_rank(path: &Path, priority_extensions: &[String]) -> usize {
    extension_of(path)
        .and_then(|ext| priority_extensions.iter().position(|p| *p == ext))
        .unwrap_or(priority_extensions.len())
}

/// Stable reorder: priority files first in configured order, the rest keep
/// their walk order.
pub fn order_by_priority(files: &mut [SourceFile], priority_extensions: &[String]) {
    if priority_extensions.is_empty() {
        return;
    }
    files.sort_by_key(|file| priority_rank(&file.path, priority_extensions));
}
