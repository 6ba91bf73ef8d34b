pub mod commands;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::LauncherConfig;
use crate::errors::Result;
use crate::models::DownloadEvent;
use crate::services::{
    ArchiveInstaller, CatalogStore, DetachedProcessLauncher, DownloadScheduler, FinalizeLauncher,
    InstalledIndex, SelfUpdater, TlsMode, TransferClient, VersionLocks,
};
use crate::utils::file::FileManager;
use crate::utils::paths::ensure_dir;

/// Engine services shared by every public operation.
#[derive(Clone)]
pub struct AppState {
    pub config: LauncherConfig,
    pub files: FileManager,
    pub catalog: CatalogStore,
    pub installed: InstalledIndex,
    pub installer: ArchiveInstaller,
    pub scheduler: DownloadScheduler,
    pub updater: SelfUpdater,
}

impl AppState {
    /// Wires the engine under `root` and starts the download pool, so it must
    /// run inside a tokio runtime. The receiver is the single consumer end of
    /// the engine's event channel.
    pub fn bootstrap(
        config: LauncherConfig,
        root: &Path,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<DownloadEvent>)> {
        let target_exe = std::env::current_exe()?;
        Self::bootstrap_with(config, root, target_exe, Arc::new(DetachedProcessLauncher))
    }

    pub fn bootstrap_with(
        config: LauncherConfig,
        root: &Path,
        target_exe: PathBuf,
        finalize: Arc<dyn FinalizeLauncher>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<DownloadEvent>)> {
        let data_dir = config.data_dir(root);
        let install_dir = config.install_dir(root);
        ensure_dir(&data_dir);
        ensure_dir(&install_dir);
        let files = FileManager::new(data_dir, install_dir.clone());

        let transfer = TransferClient::new(
            &config.base_url,
            TlsMode::from_verify(config.verify_tls),
            config.request_timeout(),
            config.connect_timeout(),
        )?;
        let update_transfer = TransferClient::new(
            &config.update_url,
            TlsMode::from_verify(config.update_verify_tls),
            config.request_timeout(),
            config.connect_timeout(),
        )?;

        let catalog = CatalogStore::new(transfer.clone(), files.clone(), &config.catalog_path);
        let installer = ArchiveInstaller::new(files.clone(), transfer, VersionLocks::new());
        let (scheduler, events) =
            DownloadScheduler::new(installer.clone(), config.max_active_downloads);
        let updater = SelfUpdater::new(
            update_transfer,
            files.clone(),
            &config.launcher_version,
            std::time::Duration::from_secs(config.update_check_interval_secs),
            target_exe,
            finalize,
        );

        scheduler.start();
        tracing::info!(
            "launcher {} ready install_dir={} max_active={}",
            config.launcher_version,
            install_dir.display(),
            scheduler.max_active()
        );

        let state = AppState {
            config,
            files,
            catalog,
            installed: InstalledIndex::new(install_dir),
            installer,
            scheduler,
            updater,
        };
        Ok((Arc::new(state), events))
    }
}
