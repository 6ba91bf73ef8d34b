use std::path::PathBuf;

use chrono::Utc;
use reqwest::header::HeaderMap;

use crate::errors::Result;
use crate::models::{Catalog, CatalogFetch, CatalogSnapshot, CatalogSource};
use crate::services::transfer_client::TransferClient;
use crate::utils::file::FileManager;

pub const CATALOG_CACHE_FILE: &str = "games_cache.json";

/// Remote catalog with a last-known-good snapshot on disk. Stale data is
/// served without any age limit when the remote is unusable.
#[derive(Clone)]
pub struct CatalogStore {
    transfer: TransferClient,
    files: FileManager,
    catalog_path: String,
}

impl CatalogStore {
    pub fn new(transfer: TransferClient, files: FileManager, catalog_path: &str) -> Self {
        Self {
            transfer,
            files,
            catalog_path: catalog_path.to_string(),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.files.data_dir().join(CATALOG_CACHE_FILE)
    }

    pub async fn fetch_catalog(&self) -> CatalogFetch {
        let response = self.transfer.get(&self.catalog_path, HeaderMap::new()).await;
        if response.is_ok() {
            match serde_json::from_slice::<Catalog>(&response.body) {
                Ok(catalog) => {
                    let catalog = catalog.with_ids();
                    if let Err(err) = self.save_snapshot(&catalog) {
                        tracing::warn!("failed to persist catalog cache: {}", err);
                    }
                    tracing::info!("catalog fetched entries={}", catalog.games.len());
                    return CatalogFetch {
                        catalog,
                        source: CatalogSource::Remote,
                    };
                }
                Err(err) => tracing::warn!("malformed catalog document, using cache: {}", err),
            }
        } else {
            tracing::warn!(
                "catalog server returned status {}, using cache",
                response.status
            );
        }
        self.cached()
    }

    /// Replaces the snapshot with `catalog` stamped with the current time.
    pub fn save_snapshot(&self, catalog: &Catalog) -> Result<i64> {
        let last_update = Utc::now().timestamp();
        let snapshot = CatalogSnapshot {
            games: catalog.games.clone(),
            last_update,
        };
        let payload = serde_json::to_vec_pretty(&snapshot)?;
        self.files.write_atomic(&self.cache_path(), &payload)?;
        Ok(last_update)
    }

    pub fn load_snapshot(&self) -> Option<CatalogSnapshot> {
        let path = self.cache_path();
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CatalogSnapshot>(&data) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!("unreadable catalog cache {}: {}", path.display(), err);
                None
            }
        }
    }

    /// The persisted snapshot, or an empty catalog when there is none.
    pub fn cached(&self) -> CatalogFetch {
        let snapshot = self.load_snapshot().unwrap_or_default();
        CatalogFetch {
            catalog: Catalog {
                games: snapshot.games,
            }
            .with_ids(),
            source: CatalogSource::Cached {
                last_update: snapshot.last_update,
            },
        }
    }
}
