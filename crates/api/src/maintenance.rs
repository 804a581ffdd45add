//! Periodic maintenance loop
//!
//! One interval drives both the presence sweep (guest eviction and presence
//! writes) and the cleanup of attachments no message refers to anymore.
//! Failures are logged; the next tick retries.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use parley_shared::{Store, StoreError};

use crate::state::AppState;
use crate::websocket::presence::SweepReport;
use crate::websocket::PresenceHandle;

/// Outcome of one maintenance tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub presence: Option<SweepReport>,
    pub attachments_removed: usize,
}

/// Start the maintenance loop for `state`
pub fn spawn(state: &AppState) -> JoinHandle<()> {
    let presence = state.presence.clone();
    let store = Arc::clone(&state.store);
    let upload_dir = state.config.upload_dir.clone();
    let retention = state.config.attachment_retention;
    let period = state.config.sweep_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            run_once(&presence, store.as_ref(), &upload_dir, retention).await;
        }
    })
}

/// Run one maintenance pass
pub async fn run_once(
    presence: &PresenceHandle,
    store: &dyn Store,
    upload_dir: &Path,
    retention: Duration,
) -> MaintenanceReport {
    let presence = match presence.sweep().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "Presence sweep skipped");
            None
        }
    };

    let attachments_removed = match cleanup_attachments(store, upload_dir, retention).await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!(error = %e, "Attachment cleanup failed, will retry on next tick");
            0
        }
    };

    MaintenanceReport {
        presence,
        attachments_removed,
    }
}

/// Delete files and rows of unreferenced attachments older than `retention`.
/// Returns how many were removed.
pub async fn cleanup_attachments(
    store: &dyn Store,
    upload_dir: &Path,
    retention: Duration,
) -> Result<usize, StoreError> {
    let retention = time::Duration::try_from(retention).unwrap_or(time::Duration::MAX);
    let before = OffsetDateTime::now_utc()
        .checked_sub(retention)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

    let old = store.get_old_attachments(before).await?;
    let mut removed = 0;

    for attachment in old {
        let Some(path) = upload_path(upload_dir, &attachment.storage_key) else {
            tracing::warn!(
                attachment_id = attachment.id,
                storage_key = %attachment.storage_key,
                "Refusing to delete attachment outside upload directory"
            );
            continue;
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    attachment_id = attachment.id,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete attachment file"
                );
                continue;
            }
        }

        match store.delete_attachment(attachment.id).await {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(attachment_id = attachment.id, error = %e, "Failed to delete attachment record");
            }
        }
    }

    if removed > 0 {
        tracing::info!(removed, "Removed old attachments");
    }
    Ok(removed)
}

fn upload_path(upload_dir: &Path, storage_key: &str) -> Option<PathBuf> {
    let relative = Path::new(storage_key);
    let contained = !storage_key.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    contained.then(|| upload_dir.join(relative))
}
