use anyhow::Context;
use std::path::{Component, Path, PathBuf};

/// Filesystem access scoped to the storage directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Storage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `relative`, refusing anything that would leave the root.
    pub fn path(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            anyhow::bail!("path '{}' leaves the storage directory", relative.display());
        }
        Ok(self.root.join(relative))
    }

    pub fn put(&self, relative: &str, contents: &[u8]) -> anyhow::Result<()> {
        let path = self.path(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, relative: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path(relative)?;
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).map(|p| p.exists()).unwrap_or(false)
    }

    /// Removes a file. Returns false if it was not there.
    pub fn delete(&self, relative: &str) -> anyhow::Result<bool> {
        let path = self.path(relative)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    pub fn delete_dir(&self, relative: &str) -> anyhow::Result<()> {
        let path = self.path(relative)?;
        match std::fs::remove_dir_all(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("deleting {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    pub fn ensure_dir(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let path = self.path(relative)?;
        std::fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
        Ok(path)
    }
}
