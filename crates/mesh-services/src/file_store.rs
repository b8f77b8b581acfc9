//! Received-file store.
//!
//! Each completed transfer lands in the node's workspace directory under a
//! name derived from its file id:
//!   <workspace_root>/Workspace_<host>_<port>/<sanitized file_id>
//!
//! Writes go to a temp file first and are renamed into place, so a reader
//! never sees a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Longest file name kept verbatim. Longer ids are truncated and suffixed
/// with a hash so distinct ids stay distinct.
const MAX_NAME_LEN: usize = 120;
const TRUNCATED_PREFIX_LEN: usize = 96;

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create workspace: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a completed transfer. Returns the final path.
    pub fn save(&self, file_id: &str, data: &[u8]) -> Result<PathBuf> {
        let name = file_name_for(file_id);
        let path = self.root.join(&name);

        // Atomic write: tmp file → rename
        let tmp_path = self.root.join(format!("{name}.part"));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write received file")?;
            file.sync_all().context("failed to sync received file")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::debug!(path = %path.display(), bytes = data.len(), "file written");
        Ok(path)
    }

    /// Read back a stored transfer, if present.
    pub fn read(&self, file_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(file_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(data))
    }

    pub fn path_for(&self, file_id: &str) -> PathBuf {
        self.root.join(file_name_for(file_id))
    }

    /// Count stored files, ignoring in-flight temp files.
    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().extension().map_or(true, |ext| ext != "part"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Map a file id onto a single safe path component.
fn file_name_for(file_id: &str) -> String {
    let mut name: String = file_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // No hidden files, no "." or "..".
    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }

    if name.len() > MAX_NAME_LEN {
        let digest = blake3::hash(file_id.as_bytes());
        let suffix = hex::encode(&digest.as_bytes()[..8]);
        name.truncate(TRUNCATED_PREFIX_LEN);
        name.push('-');
        name.push_str(&suffix);
    }
    name
}
