//! Project file store: relative path keys, whole-file text values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::types::FilePatch;

/// Key-value view of the project's files.
pub trait FileStore {
    /// Content at `path`, or `None` if it does not exist.
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Overwrite (or create) `path` with `content`.
    fn write(&self, path: &str, content: &str) -> Result<()>;

    /// Every text file under the root, keyed and ordered by relative path.
    fn list_files(&self) -> Result<BTreeMap<String, String>>;
}

/// Apply a patch as an unconditional overwrite.
pub fn apply_patch<S: FileStore + ?Sized>(store: &S, patch: &FilePatch) -> Result<()> {
    store
        .write(&patch.path, &patch.content)
        .with_context(|| format!("apply patch to {}", patch.path))
}

/// [`FileStore`] over a directory on disk.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    ignore: Vec<String>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>, ignore: Vec<String>) -> Self {
        Self {
            root: root.into(),
            ignore,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || path.trim().is_empty() {
            return Err(anyhow!("path is not inside the project: {path}"));
        }
        Ok(self.root.join(rel))
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|ignored| ignored == name)
    }
}

impl FileStore for DirStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))?;
        Ok(Some(contents))
    }

    #[instrument(skip_all, fields(path = %path))]
    fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&full, content).with_context(|| format!("write {}", full.display()))?;
        debug!(bytes = content.len(), "wrote file");
        Ok(())
    }

    fn list_files(&self) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| self.is_ignored(name))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            match fs::read(entry.path()) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        files.insert(key, text);
                    }
                    Err(_) => debug!(path = %key, "skipping non-text file"),
                },
                Err(err) => return Err(err).with_context(|| format!("read {key}")),
            }
        }
        Ok(files)
    }
}
