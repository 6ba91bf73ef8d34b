use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::utils::paths::sanitize_folder_name;

#[derive(Clone, Debug)]
pub struct FileManager {
    data_dir: PathBuf,
    install_dir: PathBuf,
}

impl FileManager {
    pub fn new(data_dir: PathBuf, install_dir: PathBuf) -> Self {
        Self {
            data_dir,
            install_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Writes `contents` to a sibling `.tmp` file, syncs it, then renames it
    /// over `path`.
    pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let temp_path = path.with_extension("tmp");
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(temp_path, path)?;
        Ok(())
    }

    pub fn title_dir(&self, title: &str) -> PathBuf {
        self.install_dir.join(sanitize_folder_name(title))
    }

    pub fn version_dir(&self, title: &str, version: &str) -> PathBuf {
        self.title_dir(title).join(sanitize_folder_name(version))
    }
}

pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Removes `path` if present; a missing file is not an error.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
