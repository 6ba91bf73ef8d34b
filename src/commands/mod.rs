pub mod catalog;
pub mod download;
pub mod update;

pub use catalog::{fetch_catalog, list_installed};
pub use download::{cancel_install, download_snapshot, enqueue_install, uninstall};
pub use update::{check_for_update, complete_pending_update, perform_update};
