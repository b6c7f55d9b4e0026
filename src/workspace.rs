use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::JobId;

/// A job-exclusive scratch directory.
///
/// The directory is removed exactly once: by [`Workspace::release`] on the
/// normal path, or by `Drop` if the owning future panics or is cancelled.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    released: bool,
}

impl Workspace {
    /// Create `<root>/<job-id>`. Fails if that directory already exists.
    pub async fn acquire(root: &Path, job_id: &JobId) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let dir = root.join(job_id.to_string());
        tokio::fs::create_dir(&dir).await?;
        debug!("Acquired workspace {}", dir.display());
        Ok(Self { dir, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Delete everything under the workspace, then the workspace itself
    pub async fn release(mut self) {
        cleanup(&self.dir).await;
        // a release cancelled mid-cleanup leaves `Drop` to finish the job
        self.released = true;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            warn!("Workspace {} dropped without release, cleaning up", self.dir.display());
            cleanup_blocking(&self.dir);
        }
    }
}

/// Best-effort removal of a workspace directory and all its contents.
///
/// Individual failures are logged and skipped. A missing directory is not an error.
pub async fn cleanup(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Workspace {} already gone", dir.display());
            return;
        }
        Err(e) => {
            warn!("Cleanup: cannot list {}: {e}", dir.display());
            remove_dir(dir).await;
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Cleanup: error reading {}: {e}", dir.display());
                break;
            }
        };
        let path = entry.path();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => debug!("Cleaned up: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cleanup: failed to remove {}: {e}", path.display()),
        }
    }

    remove_dir(dir).await;
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed workspace {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cleanup: failed to remove workspace {}: {e}", dir.display()),
    }
}

fn cleanup_blocking(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed workspace {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cleanup: failed to remove workspace {}: {e}", dir.display()),
    }
}
