pub mod archive_installer;
pub mod catalog_store;
pub mod installed_index;
pub mod integrity;
pub mod scheduler;
pub mod self_updater;
pub mod transfer_client;
pub mod version_locks;

pub use archive_installer::{ArchiveInstaller, InstallReporter};
pub use catalog_store::CatalogStore;
pub use installed_index::InstalledIndex;
pub use integrity::IntegrityVerifier;
pub use scheduler::DownloadScheduler;
pub use self_updater::{
    DetachedProcessLauncher, FinalizeLauncher, PendingUpdate, SelfUpdater, UpdateCheck,
    UpdateNotice, UpdatePhase,
};
pub use transfer_client::{TlsMode, TransferClient, TransferControl, TransferResponse};
pub use version_locks::VersionLocks;
