use async_trait::async_trait;
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
};

/// Computes the byte size of a directory tree.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TreeSizer: Send + Sync {
    async fn tree_size(&self, path: &Path) -> std::io::Result<u64>;
}

/// Walks the local filesystem. A missing root counts as empty; symlinks are
/// not followed.
#[derive(Debug, Default, Clone)]
pub struct FsTreeSizer;

#[async_trait]
impl TreeSizer for FsTreeSizer {
    async fn tree_size(&self, path: &Path) -> std::io::Result<u64> {
        tree_size(path).await
    }
}

pub async fn tree_size(root: &Path) -> std::io::Result<u64> {
    let metadata = match fs::symlink_metadata(root).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // removed while we were walking
            Err(e) if e.kind() == ErrorKind::NotFound && dir != root => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

pub async fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

pub async fn create_empty_file(path: &Path) -> std::io::Result<()> {
    ensure_parent_exists(path).await?;
    fs::File::create(path).await?;
    Ok(())
}

/// Writes `data` at `offset`, leaving the rest of the file untouched.
pub async fn write_chunk_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Outcome of a move that must not replace anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed,
    Occupied,
}

/// Flushes the staging file to disk and moves it into place. The final path
/// only ever holds complete content. Unless `replace` is set, an existing
/// destination is left alone and `Occupied` is returned.
pub async fn promote(
    staging: &Path,
    destination: &Path,
    replace: bool,
) -> std::io::Result<Placement> {
    let file = fs::OpenOptions::new().write(true).open(staging).await?;
    file.sync_all().await?;
    drop(file);

    ensure_parent_exists(destination).await?;
    if replace {
        fs::rename(staging, destination).await?;
        return Ok(Placement::Placed);
    }
    link_then_unlink(staging, destination).await
}

pub async fn move_item(from: &Path, to: &Path) -> std::io::Result<()> {
    ensure_parent_exists(to).await?;
    fs::rename(from, to).await
}

/// Like `move_item`, but never replaces whatever sits at `to`.
///
/// Files are hard-linked into place, which fails atomically on an existing
/// name. Directories claim `to` with `create_dir` first and are then renamed
/// over the empty directory they just created.
pub async fn move_new(from: &Path, to: &Path) -> std::io::Result<Placement> {
    ensure_parent_exists(to).await?;

    if !fs::symlink_metadata(from).await?.is_dir() {
        return link_then_unlink(from, to).await;
    }

    match fs::create_dir(to).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(Placement::Occupied),
        Err(e) => return Err(e),
    }
    if let Err(e) = fs::rename(from, to).await {
        let _ = fs::remove_dir(to).await;
        return Err(e);
    }
    Ok(Placement::Placed)
}

async fn link_then_unlink(from: &Path, to: &Path) -> std::io::Result<Placement> {
    match fs::hard_link(from, to).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(Placement::Occupied),
        Err(e) => return Err(e),
    }
    fs::remove_file(from).await?;
    Ok(Placement::Placed)
}

pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes a file or a whole directory tree.
pub async fn remove_tree(path: &Path) -> std::io::Result<()> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

pub async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
