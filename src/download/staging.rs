use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use axum::body::Body;
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// A finished download sitting in its own job directory. Dropping it
/// schedules removal of the whole job directory after the grace delay.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    job_dir: PathBuf,
    size: u64,
    cleanup_grace: Duration,
}

impl StagedFile {
    pub(crate) fn new(path: PathBuf, job_dir: PathBuf, size: u64, cleanup_grace: Duration) -> Self {
        Self {
            path,
            job_dir,
            size,
            cleanup_grace,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn into_body(self) -> std::io::Result<Body> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut guard = TransferGuard {
            staged: self,
            sent: 0,
        };

        // The closure must own the whole guard, not only `sent`.
        let stream = ReaderStream::new(file).map(move |chunk| {
            let guard = &mut guard;
            if let Ok(bytes) = &chunk {
                guard.sent += bytes.len() as u64;
            }
            chunk
        });

        Ok(Body::from_stream(stream))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let job_dir = std::mem::take(&mut self.job_dir);
        if job_dir.as_os_str().is_empty() {
            return;
        }
        let grace = self.cleanup_grace;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    cleanup_job_dir(&job_dir).await;
                });
            }
            Err(_) => {
                if let Err(error) = std::fs::remove_dir_all(&job_dir)
                    && error.kind() != ErrorKind::NotFound
                {
                    warn!("No se pudo limpiar carpeta temporal {:?}: {error}", job_dir);
                }
            }
        }
    }
}

// Lives inside the body stream; dropped when the stream ends or the client
// goes away.
struct TransferGuard {
    staged: StagedFile,
    sent: u64,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.sent >= self.staged.size {
            debug!(
                "Transferencia completa de {:?} ({} bytes)",
                self.staged.path, self.sent
            );
        } else {
            info!(
                "Transferencia interrumpida de {:?}: {} de {} bytes",
                self.staged.path, self.sent, self.staged.size
            );
        }
    }
}

pub async fn cleanup_job_dir(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        info!("No se pudo limpiar carpeta temporal: {error}");
    }
}
