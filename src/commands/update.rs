use std::path::PathBuf;

use crate::models::UpdateManifest;
use crate::services::{PendingUpdate, UpdateCheck};
use crate::AppState;

pub async fn check_for_update(state: &AppState, explicit: bool) -> Result<UpdateCheck, String> {
    state
        .updater
        .check_for_update(explicit)
        .await
        .map_err(|err| format!("Failed to check for updates: {err}"))
}

/// Stages the update and launches the finalize script. On success the host
/// should exit once the updater's exit request fires.
pub async fn perform_update(state: &AppState, manifest: UpdateManifest) -> Result<PathBuf, String> {
    state
        .updater
        .perform_update(&manifest)
        .await
        .map_err(|err| format!("Update failed: {err}"))
}

pub async fn complete_pending_update(state: &AppState) -> Result<PendingUpdate, String> {
    state
        .updater
        .complete_pending_update()
        .await
        .map_err(|err| err.to_string())
}
