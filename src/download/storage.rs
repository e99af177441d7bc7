use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

/// Filesystem operations the downloader needs.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Whether a regular file exists at `path`. Called on the request path, so
    /// it must not block for long.
    fn exists(&self, path: &Path) -> bool;

    /// Move `from` to `to` so that `to` is either absent or complete.
    async fn atomic_move(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Copy `from` to `to` with the same all-or-nothing visibility.
    async fn atomic_copy(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file. A missing file is not an error.
    async fn delete(&self, path: &Path) -> io::Result<()>;

    /// Remove everything below `root`, keeping `root` itself. Returns the
    /// number of files removed.
    async fn delete_all(&self, root: &Path) -> io::Result<u64>;
}

/// [`FileStore`] backed by the local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }

    fn staging_path(dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    async fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn exists(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn atomic_move(&self, from: &Path, to: &Path) -> io::Result<()> {
        Self::ensure_parent(to).await?;

        if fs::rename(from, to).await.is_ok() {
            return Ok(());
        }

        // Different filesystems: stage next to the destination, then rename.
        debug!(from = %from.display(), to = %to.display(), "rename failed, copying instead");
        self.atomic_copy(from, to).await?;
        fs::remove_file(from).await
    }

    async fn atomic_copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        Self::ensure_parent(to).await?;

        let staging = Self::staging_path(to);
        if let Err(e) = fs::copy(from, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&staging, to).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn delete_all(&self, root: &Path) -> io::Result<u64> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || -> io::Result<u64> {
            if !root.exists() {
                return Ok(0);
            }

            let mut removed = 0u64;
            for entry in WalkDir::new(&root).min_depth(1).contents_first(true) {
                let entry = entry.map_err(io::Error::other)?;
                if entry.file_type().is_dir() {
                    std::fs::remove_dir(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_move_creates_parents() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.part");
        let dest = dir.path().join("nested/deeper/file.bin");
        fs::write(&src, b"payload").await.unwrap();

        let store = LocalFileStore::new();
        store.atomic_move(&src, &dest).await.unwrap();

        assert!(store.exists(&dest));
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_atomic_copy_leaves_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        let dest = dir.path().join("b.bin");
        fs::write(&src, b"abc").await.unwrap();

        LocalFileStore.atomic_copy(&src, &dest).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
        assert_eq!(fs::read(&dest).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_exists_ignores_directories() {
        let dir = TempDir::new().unwrap();
        assert!(!LocalFileStore.exists(dir.path()));
        assert!(!LocalFileStore.exists(&dir.path().join("missing")));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(LocalFileStore.delete(&dir.path().join("nope")).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_all_keeps_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("one.bin"), b"1").unwrap();
        std::fs::write(root.join("sub/two.bin"), b"2").unwrap();

        let removed = LocalFileStore.delete_all(&root).await.unwrap();
        assert_eq!(removed, 2);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);

        assert_eq!(LocalFileStore.delete_all(&dir.path().join("absent")).await.unwrap(), 0);
    }
}
