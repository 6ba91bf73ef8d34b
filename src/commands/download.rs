use crate::models::{CatalogEntry, DownloadTask};
use crate::AppState;

/// `Ok(false)` when the title already has a queued or active task.
pub fn enqueue_install(state: &AppState, entry: CatalogEntry) -> Result<bool, String> {
    if entry.download_path.trim().is_empty() {
        return Err(format!("{} has no download reference", entry.name));
    }
    if state.installed.is_installed(&entry.name, &entry.version) {
        tracing::info!(
            "install skipped, already present title={} version={}",
            entry.name,
            entry.version
        );
        return Ok(false);
    }
    Ok(state.scheduler.enqueue(entry))
}

pub fn cancel_install(state: &AppState, title: &str) -> Result<bool, String> {
    Ok(state.scheduler.cancel(title))
}

pub async fn uninstall(state: &AppState, title: &str, version: &str) -> Result<bool, String> {
    state
        .installer
        .uninstall(title, version)
        .await
        .map_err(|err| format!("Failed to uninstall {title} {version}: {err}"))
}

pub fn download_snapshot(state: &AppState) -> Result<Vec<DownloadTask>, String> {
    Ok(state.scheduler.snapshot())
}
