use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::InstalledMap;
use crate::services::archive_installer::{artifact_stem, is_transfer_artifact};
use crate::utils::paths::sanitize_folder_name;

/// Scans `<install_root>/<title>/<version>/` on every call; nothing is cached.
#[derive(Clone, Debug)]
pub struct InstalledIndex {
    install_dir: PathBuf,
}

impl InstalledIndex {
    pub fn new(install_dir: PathBuf) -> Self {
        Self { install_dir }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn list_installed(&self) -> InstalledMap {
        let mut installed = InstalledMap::new();
        let Ok(titles) = fs::read_dir(&self.install_dir) else {
            return installed;
        };

        for title_entry in titles.flatten() {
            let title_path = title_entry.path();
            if !title_path.is_dir() {
                continue;
            }
            let title = title_entry.file_name().to_string_lossy().to_string();
            let Ok(versions) = fs::read_dir(&title_path) else {
                continue;
            };
            let mut found = BTreeSet::new();
            for version_entry in versions.flatten() {
                let version_path = version_entry.path();
                if !version_path.is_dir() {
                    continue;
                }
                let version = version_entry.file_name().to_string_lossy().to_string();
                if is_completed_install(&version_path, &title, &version) {
                    found.insert(version);
                }
            }
            if !found.is_empty() {
                installed.insert(title, found);
            }
        }
        installed
    }

    /// Takes catalog names; they are sanitized the way install directories are.
    pub fn is_installed(&self, title: &str, version: &str) -> bool {
        self.list_installed()
            .get(&sanitize_folder_name(title))
            .map(|versions| versions.contains(&sanitize_folder_name(version)))
            .unwrap_or(false)
    }
}

/// Non-empty, holds something besides `*.tmp` transfer files, and no longer
/// holds its own pending archive.
fn is_completed_install(version_path: &Path, title: &str, version: &str) -> bool {
    let Ok(entries) = fs::read_dir(version_path) else {
        return false;
    };
    let pending_archive = format!("{}.zip", artifact_stem(title, version));
    let mut has_content = false;
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name().to_string_lossy() == pending_archive {
            return false;
        }
        if path.is_file() && is_transfer_artifact(&path) {
            continue;
        }
        has_content = true;
    }
    has_content
}
