use std::path::{Component, Path, PathBuf};

use crate::{
    errors::Result,
    utils::{sanitize_relative, validate_username},
};

pub mod local;

pub use local::*;

pub const HOME_DIR: &str = "home";
pub const SHARED_DIR: &str = "shared";
pub const TRASH_DIR: &str = "trash";
pub const STAGING_DIR: &str = ".uploads";

/// Which accounting area a path under the data root belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageArea {
    Home { owner: String },
    Shared,
    Trash { owner: String },
    Staging,
    Outside,
}

/// Directory layout of the data root:
///
/// ```text
/// <root>/home/<user>/...     per-user files (also exported over SMB)
/// <root>/shared/...          shared pool, not charged to any quota
/// <root>/trash/<user>/<id>/  soft-deleted items
/// <root>/.uploads/<id>.part  in-flight resumable uploads
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Creates the top-level directories and returns a layout rooted at the
    /// canonical root, so paths reported by the OS strip cleanly.
    pub async fn prepare(&self) -> std::io::Result<DataLayout> {
        for dir in [HOME_DIR, SHARED_DIR, TRASH_DIR, STAGING_DIR] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        let root = tokio::fs::canonicalize(&self.root).await?;
        Ok(DataLayout { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn home_dir(&self, owner: &str) -> PathBuf {
        self.root.join(HOME_DIR).join(owner)
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(SHARED_DIR)
    }

    pub fn trash_dir(&self, owner: &str) -> PathBuf {
        self.root.join(TRASH_DIR).join(owner)
    }

    pub fn staging_file(&self, upload_id: &uuid::Uuid) -> PathBuf {
        self.root.join(STAGING_DIR).join(format!("{}.part", upload_id))
    }

    /// Resolves a client supplied path inside the owner's home.
    pub fn resolve_home_path(&self, owner: &str, raw: &str) -> Result<(PathBuf, PathBuf)> {
        validate_username(owner)?;
        let relative = sanitize_relative(raw)?;
        let absolute = self.home_dir(owner).join(&relative);
        Ok((relative, absolute))
    }

    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    pub fn classify(&self, path: &Path) -> StorageArea {
        let Some(relative) = self.relative(path) else {
            return StorageArea::Outside;
        };

        let mut parts = relative.components().filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        });

        match parts.next().as_deref() {
            Some(HOME_DIR) => match parts.next() {
                Some(owner) => StorageArea::Home { owner },
                None => StorageArea::Outside,
            },
            Some(TRASH_DIR) => match parts.next() {
                Some(owner) => StorageArea::Trash { owner },
                None => StorageArea::Outside,
            },
            Some(SHARED_DIR) => StorageArea::Shared,
            Some(STAGING_DIR) => StorageArea::Staging,
            _ => StorageArea::Outside,
        }
    }
}
