use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::{FailureReason, LauncherError, Result};
use crate::models::UpdateManifest;
use crate::services::integrity::{normalize_checksum, IntegrityVerifier};
use crate::services::transfer_client::{TransferClient, TransferControl};
use crate::utils::file::{remove_file_if_exists, FileManager};
use crate::utils::version::{compare_versions, is_newer};

pub const LAST_CHECK_FILE: &str = "last_update_check.txt";
pub const STAGED_MARKER_FILE: &str = "update.staged.json";
const STAGING_DIR: &str = "temp_update";

#[cfg(target_os = "windows")]
const STAGED_BINARY: &str = "launcher_new.exe";
#[cfg(not(target_os = "windows"))]
const STAGED_BINARY: &str = "launcher_new";

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;
#[cfg(target_os = "windows")]
const DETACHED_PROCESS: u32 = 0x00000008;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UpdateNotice {
    pub current: String,
    pub manifest: UpdateManifest,
}

impl UpdateNotice {
    /// Confirmation text shown before an update is applied.
    pub fn prompt_text(&self) -> String {
        let changelog = if self.manifest.changelog.trim().is_empty() {
            "No changelog available"
        } else {
            self.manifest.changelog.trim()
        };
        format!(
            "New version {} is available!\n\nCurrent version: {}\nFile size: {} MB\n\nChanges:\n{}\n\nDo you want to update now?",
            self.manifest.version, self.current, self.manifest.file_size, changelog
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateCheck {
    UpToDate { current: String },
    Available(UpdateNotice),
    /// Background check throttled, or failed quietly.
    Skipped,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Staged,
    Finalizing,
    ExitRequested,
    Failed(FailureReason),
}

/// Written once the new binary is verified; cleared by the next launch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StagedUpdate {
    pub version: String,
    pub staged_path: PathBuf,
    pub target_path: PathBuf,
    pub staged_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PendingUpdate {
    Nothing,
    Applied { version: String },
    /// The swap did not take effect. There is no rollback; the marker is
    /// cleared and the running binary stays as it is.
    SwapIncomplete {
        staged_version: String,
        running_version: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    Batch,
    Shell,
}

impl ScriptKind {
    pub fn native() -> Self {
        if cfg!(target_os = "windows") {
            ScriptKind::Batch
        } else {
            ScriptKind::Shell
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ScriptKind::Batch => "update_launcher.bat",
            ScriptKind::Shell => "update_launcher.sh",
        }
    }
}

/// Starts the finalize script outside the current process tree.
pub trait FinalizeLauncher: Send + Sync {
    fn launch(&self, script: &Path) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedProcessLauncher;

impl FinalizeLauncher for DetachedProcessLauncher {
    fn launch(&self, script: &Path) -> Result<()> {
        #[cfg(target_os = "windows")]
        let mut command = {
            let mut command = Command::new("cmd");
            command
                .arg("/C")
                .arg(script)
                .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS);
            command
        };
        #[cfg(not(target_os = "windows"))]
        let mut command = {
            use std::os::unix::process::CommandExt;
            let mut command = Command::new("sh");
            command.arg(script).process_group(0);
            command
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

/// Checks the remote manifest and replaces the running executable through a
/// staged binary and an external finalize script.
#[derive(Clone)]
pub struct SelfUpdater {
    transfer: TransferClient,
    files: FileManager,
    verifier: IntegrityVerifier,
    current_version: String,
    check_interval: Duration,
    target_exe: PathBuf,
    launcher: Arc<dyn FinalizeLauncher>,
    phase: Arc<watch::Sender<UpdatePhase>>,
    exit: Arc<watch::Sender<bool>>,
}

impl SelfUpdater {
    pub fn new(
        transfer: TransferClient,
        files: FileManager,
        current_version: &str,
        check_interval: Duration,
        target_exe: PathBuf,
        launcher: Arc<dyn FinalizeLauncher>,
    ) -> Self {
        let (phase, _) = watch::channel(UpdatePhase::Idle);
        let (exit, _) = watch::channel(false);
        Self {
            transfer,
            files,
            verifier: IntegrityVerifier::new(),
            current_version: current_version.to_string(),
            check_interval,
            target_exe,
            launcher,
            phase: Arc::new(phase),
            exit: Arc::new(exit),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<UpdatePhase> {
        self.phase.subscribe()
    }

    /// Flips to `true` once the finalize script is running and the host
    /// process should exit.
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.files.data_dir().join(STAGING_DIR)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.files.data_dir().join(STAGED_MARKER_FILE)
    }

    fn last_check_path(&self) -> PathBuf {
        self.files.data_dir().join(LAST_CHECK_FILE)
    }

    fn set_phase(&self, phase: UpdatePhase) {
        tracing::debug!("update phase {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Explicit checks always query the manifest and surface failures.
    /// Background checks run at most once per interval and fail quietly.
    pub async fn check_for_update(&self, explicit: bool) -> Result<UpdateCheck> {
        if !explicit {
            if !self.background_check_due() {
                return Ok(UpdateCheck::Skipped);
            }
            if let Err(err) = self.record_check() {
                tracing::warn!("failed to record update check time: {}", err);
            }
        }

        self.set_phase(UpdatePhase::Checking);
        let manifest = self.fetch_manifest().await;
        self.set_phase(UpdatePhase::Idle);

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(err) if explicit => {
                tracing::error!("update check error: {}", err);
                return Err(err);
            }
            Err(err) => {
                tracing::debug!("background update check failed: {}", err);
                return Ok(UpdateCheck::Skipped);
            }
        };

        if is_newer(&manifest.version, &self.current_version) {
            tracing::info!(
                "update available current={} latest={}",
                self.current_version,
                manifest.version
            );
            Ok(UpdateCheck::Available(UpdateNotice {
                current: self.current_version.clone(),
                manifest,
            }))
        } else {
            Ok(UpdateCheck::UpToDate {
                current: self.current_version.clone(),
            })
        }
    }

    async fn fetch_manifest(&self) -> Result<UpdateManifest> {
        let response = self.transfer.get("", HeaderMap::new()).await;
        if !response.is_ok() {
            return Err(LauncherError::Http(format!(
                "update server returned status {}",
                response.status
            )));
        }
        Ok(serde_json::from_slice::<UpdateManifest>(&response.body)?)
    }

    fn background_check_due(&self) -> bool {
        let Ok(raw) = std::fs::read_to_string(self.last_check_path()) else {
            return true;
        };
        let Ok(last) = raw.trim().parse::<f64>() else {
            return true;
        };
        let elapsed = Utc::now().timestamp() as f64 - last;
        elapsed < 0.0 || elapsed >= self.check_interval.as_secs_f64()
    }

    fn record_check(&self) -> Result<()> {
        let now = Utc::now().timestamp().to_string();
        self.files.write_atomic(&self.last_check_path(), now.as_bytes())?;
        Ok(())
    }

    /// Downloads, verifies and stages `manifest`, launches the finalize
    /// script and raises the exit request. The running binary is untouched
    /// on every failure before the script starts.
    pub async fn perform_update(&self, manifest: &UpdateManifest) -> Result<PathBuf> {
        let result = self.stage_and_finalize(manifest).await;
        if let Err(err) = &result {
            tracing::error!("update to {} failed: {}", manifest.version, err);
            self.set_phase(UpdatePhase::Failed(err.failure_reason()));
        }
        result
    }

    async fn stage_and_finalize(&self, manifest: &UpdateManifest) -> Result<PathBuf> {
        let expected = normalize_checksum(&manifest.checksum);
        if expected.is_empty() {
            return Err(LauncherError::ChecksumMismatch {
                expected,
                actual: "<manifest declares no checksum>".to_string(),
            });
        }

        self.set_phase(UpdatePhase::Downloading);
        let staging_dir = self.staging_dir();
        tokio::fs::create_dir_all(&staging_dir).await?;
        let staged = staging_dir.join(STAGED_BINARY);
        remove_file_if_exists(&staged).await?;

        let (_control_tx, control) = watch::channel(TransferControl::Running);
        if let Err(err) = self
            .transfer
            .download_to(&manifest.download_url, &staged, &control, |_| {})
            .await
        {
            discard(&staged).await;
            return Err(err);
        }

        self.set_phase(UpdatePhase::Verifying);
        if let Err(err) = self.verifier.verify_file_async(&staged, &expected).await {
            discard(&staged).await;
            return Err(err);
        }

        let kind = ScriptKind::native();
        let script_path = self.files.data_dir().join(kind.file_name());
        if let Err(err) = self.stage_and_launch(manifest, &staged, kind, &script_path).await {
            for path in [self.marker_path(), script_path, staged] {
                discard(&path).await;
            }
            return Err(err);
        }

        tracing::info!("finalize script launched, requesting exit");
        self.set_phase(UpdatePhase::ExitRequested);
        self.exit.send_replace(true);
        Ok(script_path)
    }

    /// The script goes to disk before the marker, so a marker on disk always
    /// means a finalize script existed for it.
    async fn stage_and_launch(
        &self,
        manifest: &UpdateManifest,
        staged: &Path,
        kind: ScriptKind,
        script_path: &Path,
    ) -> Result<()> {
        make_executable(staged)?;
        let script = finalize_script(kind, std::process::id(), staged, &self.target_exe);
        tokio::fs::write(script_path, script).await?;

        let marker = StagedUpdate {
            version: manifest.version.clone(),
            staged_path: staged.to_path_buf(),
            target_path: self.target_exe.clone(),
            staged_at: Utc::now().timestamp(),
        };
        self.files
            .write_atomic(&self.marker_path(), &serde_json::to_vec_pretty(&marker)?)?;
        self.set_phase(UpdatePhase::Staged);
        tracing::info!("update {} staged at {}", manifest.version, staged.display());

        self.set_phase(UpdatePhase::Finalizing);
        self.launcher.launch(script_path)
    }

    /// Run on startup: reports whether a previously staged update took effect
    /// and clears the marker and staging directory either way.
    pub async fn complete_pending_update(&self) -> Result<PendingUpdate> {
        let marker_path = self.marker_path();
        let raw = match tokio::fs::read(&marker_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PendingUpdate::Nothing),
            Err(err) => return Err(err.into()),
        };

        let outcome = match serde_json::from_slice::<StagedUpdate>(&raw) {
            Ok(staged) if compare_versions(&self.current_version, &staged.version) >= 0 => {
                tracing::info!("update to {} applied", staged.version);
                PendingUpdate::Applied {
                    version: staged.version,
                }
            }
            Ok(staged) => {
                tracing::error!(
                    "staged update {} did not replace running version {}",
                    staged.version,
                    self.current_version
                );
                PendingUpdate::SwapIncomplete {
                    staged_version: staged.version,
                    running_version: self.current_version.clone(),
                }
            }
            Err(err) => {
                tracing::warn!("discarding unreadable update marker: {}", err);
                PendingUpdate::Nothing
            }
        };

        remove_file_if_exists(&marker_path).await?;
        match tokio::fs::remove_dir_all(self.staging_dir()).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("failed to clear update staging directory: {}", err),
        }
        Ok(outcome)
    }
}

/// Waits for `pid` to exit, copies `staged` over `target`, relaunches it and
/// deletes the staged binary, its directory and the script itself.
pub fn finalize_script(kind: ScriptKind, pid: u32, staged: &Path, target: &Path) -> String {
    let staged_dir = staged.parent().unwrap_or(staged);
    match kind {
        ScriptKind::Batch => format!(
            "@echo off\r\n\
             echo Updating Pintuxx Game Launcher...\r\n\
             :wait\r\n\
             tasklist /fi \"PID eq {pid}\" | find \"{pid}\" >nul\r\n\
             if not errorlevel 1 (\r\n\
             \x20   timeout /t 1 /nobreak >nul\r\n\
             \x20   goto wait\r\n\
             )\r\n\
             copy /Y \"{staged}\" \"{target}\" >nul\r\n\
             start \"\" \"{target}\"\r\n\
             del \"{staged}\" >nul\r\n\
             rd \"{dir}\" >nul 2>&1\r\n\
             del \"%~f0\" >nul\r\n",
            pid = pid,
            staged = staged.display(),
            target = target.display(),
            dir = staged_dir.display(),
        ),
        ScriptKind::Shell => format!(
            "#!/bin/sh\n\
             while kill -0 {pid} 2>/dev/null; do\n\
             \x20   sleep 1\n\
             done\n\
             cp -f {staged} {target} && chmod +x {target}\n\
             nohup {target} >/dev/null 2>&1 &\n\
             rm -f {staged}\n\
             rmdir {dir} 2>/dev/null\n\
             rm -f \"$0\"\n",
            pid = pid,
            staged = shell_quote(staged),
            target = shell_quote(target),
            dir = shell_quote(staged_dir),
        ),
    }
}

async fn discard(path: &Path) {
    if let Err(err) = remove_file_if_exists(path).await {
        tracing::warn!("update cleanup could not remove {}: {}", path.display(), err);
    }
}

/// Single-quotes `path` for `sh`; an embedded `'` becomes `'\''`.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
