// System
use std::collections::VecDeque;
use std::path::PathBuf;

// Third Party
use anyhow::Context;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

// Local
use crate::{PodEvent, PodEventKind, PodIdentity};

const META_FILE_EXTENSION: &str = "meta";

/// A snapshot file whose pod has been removed, due for deletion once
/// `not_before` has passed. Tickets are appended with a constant retention
/// offset, so the queue stays ordered by `not_before` and a sweep can stop
/// at the first ticket that is still in the future.
struct DeletionTicket {
    path: PathBuf,
    not_before: Instant,
}

/// Maintains one metadata snapshot file per tracked pod in `directory`,
/// named `<namespace>_<name>.meta`. A snapshot is written when the pod is
/// created and deleted `retention` after the pod is removed; deletion is
/// lazy, performed at the front of each `handle` call.
///
/// The writer owns the snapshot files and the deletion queue exclusively
/// and expects one `handle` call at a time, so it needs no locking.
pub struct PodMetaWriter {
    directory: PathBuf,
    retention: Duration,
    pending_deletions: VecDeque<DeletionTicket>,
}

impl PodMetaWriter {
    /// Creates a writer for `directory` with the given retention period.
    ///
    /// Snapshot files left behind by a previous run are removed eagerly:
    /// they describe pods this process has never observed and cannot be
    /// trusted. Per-file removal failures are logged and skipped.
    pub fn new(directory: impl Into<PathBuf>, retention: Duration) -> Self {
        let writer = Self {
            directory: directory.into(),
            retention,
            pending_deletions: VecDeque::new(),
        };
        writer.remove_all_meta_files();
        writer
    }

    /// Handles a pod lifecycle event. The exact behaviour depends on the
    /// event kind:
    /// - `Created` - writes (or overwrites) the pod's snapshot file
    /// - `Removed` - schedules the snapshot file for deletion
    /// - `Updated` / `Ignore` - no-op
    ///
    /// Every call first sweeps the deletion queue, deleting any snapshot
    /// whose retention period has elapsed. Only a failed snapshot write is
    /// escalated as an error; deletion failures are logged and swallowed.
    pub async fn handle(&mut self, event: PodEvent) -> Result<(), anyhow::Error> {
        self.sweep_expired().await;

        match event.kind {
            PodEventKind::Created => self.write_snapshot(&event).await,
            PodEventKind::Removed => {
                self.schedule_deletion(&event.identity);
                Ok(())
            }
            PodEventKind::Updated | PodEventKind::Ignore => Ok(()),
        }
    }

    async fn write_snapshot(&self, event: &PodEvent) -> Result<(), anyhow::Error> {
        let path = self.snapshot_path(&event.identity);
        let content = serde_json::to_vec(&event.pod).context("error serializing pod metadata")?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("error writing snapshot file {}", path.display()))
    }

    fn schedule_deletion(&mut self, identity: &PodIdentity) {
        self.pending_deletions.push_back(DeletionTicket {
            path: self.snapshot_path(identity),
            not_before: Instant::now() + self.retention,
        });
    }

    async fn sweep_expired(&mut self) {
        let now = Instant::now();
        while let Some(ticket) = self.pending_deletions.front() {
            if now < ticket.not_before {
                break;
            }
            match tokio::fs::remove_file(&ticket.path).await {
                Ok(()) => debug!("Deleted expired snapshot {}", ticket.path.display()),
                // A missing file only means the snapshot was already gone,
                // e.g. a duplicate ticket; nothing to escalate either way.
                Err(error) => warn!("Error deleting file {}: {}", ticket.path.display(), error),
            }
            self.pending_deletions.pop_front();
        }
    }

    fn remove_all_meta_files(&self) {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    "Error listing directory {}: {}",
                    self.directory.display(),
                    error
                );
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .extension()
                .map_or(false, |extension| extension == META_FILE_EXTENSION)
            {
                if let Err(error) = std::fs::remove_file(&path) {
                    warn!("Error deleting file {}: {}", path.display(), error);
                }
            }
        }
    }

    fn snapshot_path(&self, identity: &PodIdentity) -> PathBuf {
        self.directory.join(format!(
            "{}_{}.{}",
            identity.namespace, identity.name, META_FILE_EXTENSION
        ))
    }
}
