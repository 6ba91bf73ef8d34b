use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use sysinfo::Disks;
use tokio::sync::watch;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::errors::{LauncherError, Result};
use crate::models::{CatalogEntry, TaskState};
use crate::services::integrity::IntegrityVerifier;
use crate::services::transfer_client::{TransferClient, TransferControl};
use crate::services::version_locks::VersionLocks;
use crate::utils::file::{is_non_empty_dir, remove_file_if_exists, FileManager};
use crate::utils::paths::sanitize_folder_name;

const TEMP_EXTENSION: &str = "tmp";
const ARCHIVE_EXTENSION: &str = "zip";
const EXTRACT_BUFFER_SIZE: usize = 64 * 1024;

/// Receives step transitions and transfer progress from an install.
pub trait InstallReporter: Send + Sync {
    fn state(&self, state: TaskState);
    fn progress(&self, percent: u8);
}

/// Materializes `<install_root>/<title>/<version>/` from a verified archive.
#[derive(Clone)]
pub struct ArchiveInstaller {
    files: FileManager,
    transfer: TransferClient,
    verifier: IntegrityVerifier,
    locks: VersionLocks,
}

impl ArchiveInstaller {
    pub fn new(files: FileManager, transfer: TransferClient, locks: VersionLocks) -> Self {
        Self {
            files,
            transfer,
            verifier: IntegrityVerifier::new(),
            locks,
        }
    }

    /// Paths of the in-flight temp file and the verified archive.
    pub fn artifact_paths(&self, title: &str, version: &str) -> (PathBuf, PathBuf) {
        let dir = self.files.version_dir(title, version);
        let stem = artifact_stem(title, version);
        (
            dir.join(format!("{stem}.{TEMP_EXTENSION}")),
            dir.join(format!("{stem}.{ARCHIVE_EXTENSION}")),
        )
    }

    /// Runs download, verify, rename, extract and archive removal in that
    /// order. On failure both the temp file and the archive are removed; the
    /// version directory itself is left behind. A cancelled transfer keeps its
    /// temp file so the next attempt can resume it.
    pub async fn install(
        &self,
        entry: &CatalogEntry,
        source: &str,
        reporter: &dyn InstallReporter,
        control: &watch::Receiver<TransferControl>,
    ) -> Result<PathBuf> {
        let title = entry.name.as_str();
        let version = entry.version.as_str();
        ensure_valid_names(title, version)?;
        let _guard = self.locks.acquire(title, version).await;

        let version_dir = self.files.version_dir(title, version);
        tokio::fs::create_dir_all(&version_dir).await?;
        let (temp_path, archive_path) = self.artifact_paths(title, version);

        let result = self
            .run_steps(entry, source, &version_dir, &temp_path, &archive_path, reporter, control)
            .await;

        match result {
            Ok(()) => {
                tracing::info!("install completed title={} version={}", title, version);
                Ok(version_dir)
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(
                    "install cancelled title={} version={} keeping={}",
                    title,
                    version,
                    temp_path.display()
                );
                Err(err)
            }
            Err(err) => {
                tracing::error!(
                    "install failed title={} version={} error={}",
                    title,
                    version,
                    err
                );
                rollback(&temp_path, &archive_path).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        entry: &CatalogEntry,
        source: &str,
        version_dir: &Path,
        temp_path: &Path,
        archive_path: &Path,
        reporter: &dyn InstallReporter,
        control: &watch::Receiver<TransferControl>,
    ) -> Result<()> {
        let title = entry.name.as_str();
        let version = entry.version.as_str();

        ensure_storage(version_dir, temp_path, entry.declared_size_bytes())?;

        reporter.state(TaskState::Downloading);
        tracing::info!("download started title={} version={} source={}", title, version, source);
        let size = self
            .transfer
            .download_to(source, temp_path, control, |progress| {
                if let Some(percent) = progress.percent() {
                    reporter.progress(percent);
                }
            })
            .await?;
        reporter.progress(100);
        tracing::info!("download finished title={} version={} bytes={}", title, version, size);

        reporter.state(TaskState::Verifying);
        self.verifier
            .verify_file_async(temp_path, &entry.checksum)
            .await?;

        tokio::fs::rename(temp_path, archive_path).await?;

        reporter.state(TaskState::Extracting);
        let archive = archive_path.to_path_buf();
        let destination = version_dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_zip_archive(&archive, &destination))
            .await
            .map_err(|err| LauncherError::Config(format!("extraction task failed: {err}")))??;
        tracing::info!(
            "extracted title={} version={} entries={}",
            title,
            version,
            extracted
        );

        tokio::fs::remove_file(archive_path).await?;
        Ok(())
    }

    /// Deletes the version directory, and the title directory when no other
    /// version remains. `false` when the version was not present.
    pub async fn uninstall(&self, title: &str, version: &str) -> Result<bool> {
        ensure_valid_names(title, version)?;
        let _guard = self.locks.acquire(title, version).await;

        let version_dir = self.files.version_dir(title, version);
        if !version_dir.is_dir() {
            tracing::warn!("uninstall skipped title={} version={} not installed", title, version);
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&version_dir).await?;

        let title_dir = self.files.title_dir(title);
        if title_dir.is_dir() && !is_non_empty_dir(&title_dir) {
            match tokio::fs::remove_dir(&title_dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!("uninstalled title={} version={}", title, version);
        Ok(true)
    }
}

pub fn artifact_stem(title: &str, version: &str) -> String {
    format!(
        "{}_{}",
        sanitize_folder_name(title),
        sanitize_folder_name(version)
    )
}

pub fn is_transfer_artifact(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(TEMP_EXTENSION))
        .unwrap_or(false)
}

/// Both names must survive sanitizing, otherwise the version directory would
/// collapse onto the title directory or the install root.
fn ensure_valid_names(title: &str, version: &str) -> Result<()> {
    if sanitize_folder_name(title).is_empty() || sanitize_folder_name(version).is_empty() {
        return Err(LauncherError::NotFound(format!(
            "invalid title or version: '{title}' '{version}'"
        )));
    }
    Ok(())
}

async fn rollback(temp_path: &Path, archive_path: &Path) {
    for path in [temp_path, archive_path] {
        if let Err(err) = remove_file_if_exists(path).await {
            tracing::warn!("rollback could not remove {}: {}", path.display(), err);
        }
    }
}

fn ensure_storage(version_dir: &Path, temp_path: &Path, declared_bytes: u64) -> Result<()> {
    let already = std::fs::metadata(temp_path).map(|meta| meta.len()).unwrap_or(0);
    let required = declared_bytes.saturating_sub(already);
    if required == 0 {
        return Ok(());
    }
    match available_disk_space(version_dir) {
        Some(available) if available < required => {
            Err(LauncherError::InsufficientStorage { required, available })
        }
        _ => Ok(()),
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }
    best.map(|(_, available)| available)
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().all(|component| {
        !matches!(
            component,
            Component::Prefix(_) | Component::RootDir | Component::ParentDir
        )
    })
}

fn classify_zip_error(err: ZipError) -> LauncherError {
    match err {
        ZipError::Io(err) => LauncherError::Io(err),
        other => LauncherError::CorruptArchive(other.to_string()),
    }
}

/// Extracts every safe entry of `archive_path` under `install_dir`. Read
/// failures inside the archive are `CorruptArchive`; write failures are I/O.
fn extract_zip_archive(archive_path: &Path, install_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(classify_zip_error)?;
    let mut extracted = 0;
    let mut buffer = vec![0_u8; EXTRACT_BUFFER_SIZE];

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(classify_zip_error)?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            tracing::warn!("skipping unsafe archive entry {}", name);
            continue;
        }
        let out_path = install_dir.join(entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        loop {
            let read = entry
                .read(&mut buffer)
                .map_err(|err| LauncherError::CorruptArchive(format!("{name}: {err}")))?;
            if read == 0 {
                break;
            }
            outfile.write_all(&buffer[..read])?;
        }
        extracted += 1;
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::errors::FailureReason;
    use crate::services::transfer_client::TlsMode;
    use crate::test_support::{md5_hex, temp_dir, zip_bytes, FixtureServer, Route};

    #[derive(Default)]
    struct RecordingReporter {
        states: Mutex<Vec<TaskState>>,
        progress: Mutex<Vec<u8>>,
    }

    impl InstallReporter for RecordingReporter {
        fn state(&self, state: TaskState) {
            self.states.lock().expect("states lock").push(state);
        }

        fn progress(&self, percent: u8) {
            self.progress.lock().expect("progress lock").push(percent);
        }
    }

    fn installer(base: &str, root: &Path) -> ArchiveInstaller {
        let transfer = TransferClient::new(
            base,
            TlsMode::Verified,
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .expect("transfer client");
        ArchiveInstaller::new(
            FileManager::new(root.join("data"), root.join("apps")),
            transfer,
            VersionLocks::new(),
        )
    }

    fn entry(checksum: &str) -> CatalogEntry {
        CatalogEntry {
            id: "g1".to_string(),
            name: "Game".to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            file_size: 0.0,
            required_ram: 0.0,
            required_storage: 0.0,
            download_path: "/d/g1.zip".to_string(),
            checksum: checksum.to_string(),
        }
    }

    #[tokio::test]
    async fn installs_verified_archive_and_removes_artifacts() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("game.exe", &b"MZ binary"[..]), ("data/level1.dat", &b"level"[..])]);
        server.route("/d/g1.zip", Route::ok(archive.clone()));
        let root = temp_dir("installer");
        let installer = installer(&server.base_url, &root);
        let reporter = RecordingReporter::default();
        let (_tx, control) = watch::channel(TransferControl::Running);

        let dir = installer
            .install(&entry(&md5_hex(&archive)), "/d/g1.zip", &reporter, &control)
            .await
            .expect("install succeeds");

        assert_eq!(dir, root.join("apps").join("Game").join("1.0"));
        assert_eq!(std::fs::read(dir.join("game.exe")).expect("exe"), b"MZ binary");
        assert_eq!(std::fs::read(dir.join("data/level1.dat")).expect("data"), b"level");
        let (temp, zip) = installer.artifact_paths("Game", "1.0");
        assert!(!temp.exists());
        assert!(!zip.exists());
        assert_eq!(
            *reporter.states.lock().expect("states"),
            vec![TaskState::Downloading, TaskState::Verifying, TaskState::Extracting]
        );
        assert_eq!(reporter.progress.lock().expect("progress").last(), Some(&100));
    }

    #[tokio::test]
    async fn checksum_mismatch_never_extracts() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("game.exe", &b"MZ binary"[..])]);
        server.route("/d/g1.zip", Route::ok(archive));
        let root = temp_dir("installer");
        let installer = installer(&server.base_url, &root);
        let reporter = RecordingReporter::default();
        let (_tx, control) = watch::channel(TransferControl::Running);

        let err = installer
            .install(&entry(&md5_hex(b"other bytes")), "/d/g1.zip", &reporter, &control)
            .await
            .expect_err("mismatch must fail");

        assert_eq!(err.failure_reason(), FailureReason::ChecksumMismatch);
        let dir = root.join("apps").join("Game").join("1.0");
        assert!(!dir.join("game.exe").exists());
        let (temp, zip) = installer.artifact_paths("Game", "1.0");
        assert!(!temp.exists());
        assert!(!zip.exists());
        assert!(!reporter
            .states
            .lock()
            .expect("states")
            .contains(&TaskState::Extracting));
    }

    #[tokio::test]
    async fn structurally_invalid_archive_is_corrupt() {
        let server = FixtureServer::start();
        let bogus = b"this is not a zip archive at all".to_vec();
        server.route("/d/g1.zip", Route::ok(bogus.clone()));
        let root = temp_dir("installer");
        let installer = installer(&server.base_url, &root);
        let (_tx, control) = watch::channel(TransferControl::Running);

        let err = installer
            .install(
                &entry(&md5_hex(&bogus)),
                "/d/g1.zip",
                &RecordingReporter::default(),
                &control,
            )
            .await
            .expect_err("bogus archive must fail");

        assert_eq!(err.failure_reason(), FailureReason::CorruptArchive);
        let (temp, zip) = installer.artifact_paths("Game", "1.0");
        assert!(!temp.exists());
        assert!(!zip.exists());
    }

    #[tokio::test]
    async fn network_failure_removes_temp_file() {
        let server = FixtureServer::start();
        server.route("/d/g1.zip", Route::status(500));
        let root = temp_dir("installer");
        let installer = installer(&server.base_url, &root);
        let (temp, _) = installer.artifact_paths("Game", "1.0");
        std::fs::create_dir_all(temp.parent().expect("parent")).expect("create dir");
        std::fs::write(&temp, b"partial").expect("write partial");
        let (_tx, control) = watch::channel(TransferControl::Running);

        let err = installer
            .install(&entry("abc"), "/d/g1.zip", &RecordingReporter::default(), &control)
            .await
            .expect_err("server error must fail");

        assert_eq!(err.failure_reason(), FailureReason::NetworkError);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn resumes_from_leftover_temp_file() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("game.exe", &[7_u8; 50_000][..])]);
        server.route("/d/g1.zip", Route::ok(archive.clone()));
        let root = temp_dir("installer");
        let installer = installer(&server.base_url, &root);
        let (temp, _) = installer.artifact_paths("Game", "1.0");
        std::fs::create_dir_all(temp.parent().expect("parent")).expect("create dir");
        std::fs::write(&temp, &archive[..archive.len() / 2]).expect("write partial");
        let (_tx, control) = watch::channel(TransferControl::Running);

        installer
            .install(&entry(&md5_hex(&archive)), "/d/g1.zip", &RecordingReporter::default(), &control)
            .await
            .expect("resumed install succeeds");

        let ranges: Vec<_> = server.requests().into_iter().filter_map(|r| r.range).collect();
        assert_eq!(ranges, vec![format!("bytes={}-", archive.len() / 2)]);
    }

    #[tokio::test]
    async fn uninstall_removes_empty_title_directory() {
        let root = temp_dir("installer");
        let installer = installer("http://127.0.0.1:9", &root);
        let apps = root.join("apps");
        std::fs::create_dir_all(apps.join("Game").join("1.0")).expect("v1");
        std::fs::create_dir_all(apps.join("Game").join("2.0")).expect("v2");
        std::fs::write(apps.join("Game").join("1.0").join("game.exe"), b"x").expect("file");

        assert!(installer.uninstall("Game", "1.0").await.expect("uninstall v1"));
        assert!(!apps.join("Game").join("1.0").exists());
        assert!(apps.join("Game").exists());

        assert!(installer.uninstall("Game", "2.0").await.expect("uninstall v2"));
        assert!(!apps.join("Game").exists());

        assert!(!installer.uninstall("Game", "2.0").await.expect("uninstall again"));
        assert!(installer.uninstall("Game", "..").await.is_err());
        assert!(apps.exists());
    }

    #[test]
    fn rejects_traversal_entries() {
        assert!(is_safe_relative_path(Path::new("data/file.bin")));
        assert!(!is_safe_relative_path(Path::new("../escape.bin")));
        assert!(!is_safe_relative_path(Path::new("/etc/passwd")));
        assert!(is_transfer_artifact(Path::new("Game_1.0.tmp")));
        assert!(!is_transfer_artifact(Path::new("Game_1.0.zip")));
    }
}
