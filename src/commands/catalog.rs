use crate::models::{CatalogFetch, InstalledMap};
use crate::AppState;

/// Remote catalog, or the cached snapshot when the remote is unusable.
pub async fn fetch_catalog(state: &AppState) -> Result<CatalogFetch, String> {
    Ok(state.catalog.fetch_catalog().await)
}

pub fn list_installed(state: &AppState) -> Result<InstalledMap, String> {
    Ok(state.installed.list_installed())
}
