use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{cache::MetadataCache, rate_limit::RateLimiter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staged_removed: usize,
    pub cache_purged: usize,
    pub windows_pruned: usize,
}

pub struct Housekeeper {
    staging_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    cache: Arc<MetadataCache>,
    limiter: Arc<RateLimiter>,
}

impl Housekeeper {
    pub fn new(
        staging_dir: PathBuf,
        max_age: Duration,
        interval: Duration,
        cache: Arc<MetadataCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            staging_dir,
            max_age,
            interval,
            cache,
            limiter,
        }
    }

    pub async fn run_once(&self) -> SweepReport {
        let report = SweepReport {
            staged_removed: cleanup_stale_staging(&self.staging_dir, self.max_age).await,
            cache_purged: self.cache.purge_expired(),
            windows_pruned: self.limiter.prune_expired(),
        };

        if report == SweepReport::default() {
            debug!("Limpieza periodica sin cambios");
        } else {
            info!(
                "Limpieza periodica: {} archivos temporales, {} entradas de cache, {} ventanas de limite",
                report.staged_removed, report.cache_purged, report.windows_pruned
            );
        }
        report
    }

    /// The first sweep runs immediately, then once per interval until the
    /// token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Limpieza periodica detenida");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}

pub async fn cleanup_stale_staging(staging_dir: &Path, max_age: Duration) -> usize {
    if max_age.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(staging_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("No se pudo leer fecha de modificacion de {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => {
                debug!("Archivo temporal antiguo eliminado: {:?}", path);
                removed += 1;
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar {:?}: {error}", path),
        }
    }

    removed
}
