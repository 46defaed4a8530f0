use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};

use super::{Lease, LeaseRelease, LockError, LockProvider};

/// Lock provider backed by exclusive advisory file locks under a directory.
///
/// Works across processes sharing the directory. A lock held by a process
/// that dies is released by the operating system.
#[derive(Clone, Debug)]
pub struct FileLockProvider {
    root: PathBuf,
}

impl FileLockProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.lock", sanitize(name)))
    }

    /// Synchronous try-acquire, usable from blocking contexts.
    pub fn try_acquire_blocking(&self, name: &str) -> Result<Option<Lease>, LockError> {
        let io_err = |source| LockError::Io {
            name: name.to_string(),
            source,
        };
        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Lease::new(name, Box::new(FileRelease { file: Some(file), path })))),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Readable stem plus a digest of the raw name, so names that sanitize alike
/// still get distinct files.
fn sanitize(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let digest = Sha256::digest(name.as_bytes());
    let tag: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{stem}-{tag}")
}

struct FileRelease {
    file: Option<File>,
    path: PathBuf,
}

impl LeaseRelease for FileRelease {
    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                tracing::warn!(target: "flowhost::sync", path = %self.path.display(), error = %e, "failed to unlock lease file");
            }
        }
    }
}

#[async_trait::async_trait]
impl LockProvider for FileLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>, LockError> {
        let provider = self.clone();
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || provider.try_acquire_blocking(&owned))
            .await
            .map_err(|e| LockError::Io {
                name: name.to_string(),
                source: std::io::Error::other(e),
            })?
    }
}
