use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Where Vanish keeps its files under one root directory:
///
/// ```text
/// <root>/vanish.key   encryption key (0600)
/// <root>/secrets/     one file per token (file storage)
/// <root>/vanish.db    redb database (redb storage)
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Resolve and create the root directory.
    ///
    /// Priority:
    /// 1. `explicit` (from `--data-dir`)
    /// 2. `VANISH_DATA_DIR` environment variable
    /// 3. Platform-specific app data dir (`~/.local/share/vanish/`, etc.)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(dir) => dir.to_owned(),
            None => match std::env::var_os("VANISH_DATA_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => ProjectDirs::from("", "", "vanish")
                    .context("could not determine platform data directory")?
                    .data_dir()
                    .to_owned(),
            },
        };
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create data dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_file(&self) -> PathBuf {
        self.root.join("vanish.key")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("vanish.db")
    }
}
