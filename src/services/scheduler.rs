use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::MAX_ACTIVE_DOWNLOADS;
use crate::models::{CatalogEntry, DownloadEvent, DownloadTask, TaskState};
use crate::services::archive_installer::{ArchiveInstaller, InstallReporter};
use crate::services::transfer_client::TransferControl;

struct ActiveTask {
    task: DownloadTask,
    control: watch::Sender<TransferControl>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<DownloadTask>,
    active: HashMap<String, ActiveTask>,
    shutting_down: bool,
}

impl SchedulerState {
    fn contains(&self, title: &str) -> bool {
        self.active.contains_key(title) || self.queue.iter().any(|task| task.title() == title)
    }
}

struct SchedulerInner {
    installer: ArchiveInstaller,
    max_active: usize,
    state: Mutex<SchedulerState>,
    notify: Notify,
    events: mpsc::UnboundedSender<DownloadEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// FIFO install queue drained by a fixed pool of workers. One task per title
/// across the queue and the active set.
#[derive(Clone)]
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
}

impl DownloadScheduler {
    pub fn new(
        installer: ArchiveInstaller,
        max_active: usize,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                installer,
                max_active: max_active.clamp(1, MAX_ACTIVE_DOWNLOADS),
                state: Mutex::new(SchedulerState::default()),
                notify: Notify::new(),
                events,
                workers: Mutex::new(Vec::new()),
            }),
        };
        (scheduler, receiver)
    }

    pub fn max_active(&self) -> usize {
        self.inner.max_active
    }

    /// Spawns the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = lock(&self.inner.workers);
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.inner.max_active {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(index).await }));
        }
        tracing::info!("download pool started workers={}", self.inner.max_active);
    }

    /// Queues `entry` unless its title already has a queued or active task.
    pub fn enqueue(&self, entry: CatalogEntry) -> bool {
        let title = entry.name.clone();
        let version = entry.version.clone();
        {
            let mut state = lock(&self.inner.state);
            if state.shutting_down {
                tracing::warn!("enqueue rejected during shutdown title={}", title);
                return false;
            }
            if state.contains(&title) {
                tracing::info!("enqueue ignored, already scheduled title={}", title);
                return false;
            }
            let source = entry.download_path.clone();
            state.queue.push_back(DownloadTask::new(entry, source));
        }
        tracing::info!("queued title={} version={}", title, version);
        self.inner.emit(DownloadEvent::Queued { title, version });
        self.inner.notify.notify_one();
        true
    }

    /// Drops a queued task, or asks an active one to stop at its next chunk.
    pub fn cancel(&self, title: &str) -> bool {
        let removed = {
            let mut state = lock(&self.inner.state);
            if let Some(position) = state.queue.iter().position(|task| task.title() == title) {
                state.queue.remove(position)
            } else if let Some(active) = state.active.get(title) {
                let _ = active.control.send(TransferControl::Cancelled);
                tracing::info!("cancel requested title={}", title);
                return true;
            } else {
                None
            }
        };
        match removed {
            Some(task) => {
                tracing::info!("removed queued task title={}", title);
                self.inner.emit(DownloadEvent::Finished {
                    title: title.to_string(),
                    version: task.entry.version,
                    state: TaskState::Cancelled,
                    message: None,
                });
                true
            }
            None => false,
        }
    }

    /// Active tasks ordered by worker, then the queue in dispatch order.
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        let state = lock(&self.inner.state);
        let mut active: Vec<DownloadTask> =
            state.active.values().map(|active| active.task.clone()).collect();
        active.sort_by_key(|task| task.worker);
        active.extend(state.queue.iter().cloned());
        active
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.state).active.len()
    }

    pub fn downloading_count(&self) -> usize {
        lock(&self.inner.state)
            .active
            .values()
            .filter(|active| active.task.state == TaskState::Downloading)
            .count()
    }

    /// Cancels queued work, signals active transfers and waits for the pool.
    pub async fn shutdown(&self) {
        let drained: Vec<DownloadTask> = {
            let mut state = lock(&self.inner.state);
            state.shutting_down = true;
            for active in state.active.values() {
                let _ = active.control.send(TransferControl::Cancelled);
            }
            state.queue.drain(..).collect()
        };
        for task in drained {
            self.inner.emit(DownloadEvent::Finished {
                title: task.title().to_string(),
                version: task.entry.version.clone(),
                state: TaskState::Cancelled,
                message: None,
            });
        }
        self.inner.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("download worker ended abnormally: {}", err);
            }
        }
        tracing::info!("download pool stopped");
    }
}

impl SchedulerInner {
    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        loop {
            let claimed = {
                // Registered before the queue check so an enqueue in between
                // still wakes this worker.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.claim(index) {
                    Some(claimed) => Some(claimed),
                    None if self.is_shutting_down() => break,
                    None => {
                        notified.await;
                        None
                    }
                }
            };
            if let Some((task, control)) = claimed {
                self.run_task(task, control).await;
            }
        }
        tracing::debug!("download worker {} exiting", index);
    }

    fn is_shutting_down(&self) -> bool {
        lock(&self.state).shutting_down
    }

    fn claim(&self, index: usize) -> Option<(DownloadTask, watch::Receiver<TransferControl>)> {
        let mut state = lock(&self.state);
        if state.shutting_down {
            return None;
        }
        let mut task = state.queue.pop_front()?;
        task.worker = Some(index);
        let (control, receiver) = watch::channel(TransferControl::Running);
        state.active.insert(
            task.title().to_string(),
            ActiveTask {
                task: task.clone(),
                control,
            },
        );
        tracing::info!("dispatched title={} worker={}", task.title(), index);
        Some((task, receiver))
    }

    async fn run_task(
        self: &Arc<Self>,
        task: DownloadTask,
        control: watch::Receiver<TransferControl>,
    ) {
        let title = task.title().to_string();
        let version = task.entry.version.clone();
        let reporter = TaskReporter {
            inner: self.clone(),
            title: title.clone(),
            last_percent: AtomicI16::new(-1),
        };

        let result = self
            .installer
            .install(&task.entry, &task.source_url, &reporter, &control)
            .await;
        let (state, message) = match result {
            Ok(_) => (TaskState::Completed, None),
            Err(err) if err.is_cancelled() => (TaskState::Cancelled, None),
            Err(err) => (TaskState::Failed(err.failure_reason()), Some(err.to_string())),
        };

        lock(&self.state).active.remove(&title);
        tracing::info!("finished title={} version={} state={}", title, version, state);
        self.emit(DownloadEvent::Finished {
            title,
            version,
            state,
            message,
        });
        self.emit(DownloadEvent::RefreshRequested);
    }
}

/// Mirrors install steps into the active set and the event channel.
struct TaskReporter {
    inner: Arc<SchedulerInner>,
    title: String,
    last_percent: AtomicI16,
}

impl InstallReporter for TaskReporter {
    fn state(&self, state: TaskState) {
        if let Some(active) = lock(&self.inner.state).active.get_mut(&self.title) {
            active.task.state = state;
        }
        self.inner.emit(DownloadEvent::StateChanged {
            title: self.title.clone(),
            state,
        });
    }

    fn progress(&self, percent: u8) {
        let percent = i16::from(percent.min(100));
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        if percent <= previous {
            return;
        }
        if let Some(active) = lock(&self.inner.state).active.get_mut(&self.title) {
            active.task.progress = percent as u8;
        }
        self.inner.emit(DownloadEvent::Progress {
            title: self.title.clone(),
            percent: percent as u8,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::errors::FailureReason;
    use crate::services::installed_index::InstalledIndex;
    use crate::services::transfer_client::{TlsMode, TransferClient};
    use crate::services::version_locks::VersionLocks;
    use crate::test_support::{md5_hex, temp_dir, zip_bytes, FixtureServer, Route};
    use crate::utils::file::FileManager;

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

    fn entry(name: &str, path: &str, checksum: &str) -> CatalogEntry {
        CatalogEntry {
            id: name.to_ascii_lowercase(),
            name: name.to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            file_size: 0.0,
            required_ram: 0.0,
            required_storage: 0.0,
            download_path: path.to_string(),
            checksum: checksum.to_string(),
        }
    }

    /// Task states and progress percents for `title` until its `Finished` event.
    async fn history_until_finished(
        events: &mut mpsc::UnboundedReceiver<DownloadEvent>,
        title: &str,
    ) -> (Vec<TaskState>, Vec<u8>) {
        let mut states = Vec::new();
        let mut percents = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
                .await
                .expect("event before timeout")
                .expect("event channel open");
            match event {
                DownloadEvent::Queued { title: t, .. } if t == title => states.push(TaskState::Queued),
                DownloadEvent::StateChanged { title: t, state } if t == title => states.push(state),
                DownloadEvent::Progress { title: t, percent } if t == title => percents.push(percent),
                DownloadEvent::Finished { title: t, state, .. } if t == title => {
                    states.push(state);
                    return (states, percents);
                }
                _ => {}
            }
        }
    }

    async fn states_until_finished(
        events: &mut mpsc::UnboundedReceiver<DownloadEvent>,
        title: &str,
    ) -> Vec<TaskState> {
        history_until_finished(events, title).await.0
    }

    /// Incompressible bytes, so a deflated archive stays as large as its input.
    fn noise(len: usize) -> Vec<u8> {
        let mut seed: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn duplicate_title_yields_one_task() {
        let root = temp_dir("scheduler");
        let (scheduler, mut events) = DownloadScheduler::new(installer("http://127.0.0.1:9", &root), 3);

        assert!(scheduler.enqueue(entry("Game", "/d/g1.zip", "abc")));
        assert!(!scheduler.enqueue(entry("Game", "/d/g1.zip", "abc")));
        assert_eq!(scheduler.snapshot().len(), 1);

        assert!(scheduler.cancel("Game"));
        assert!(scheduler.snapshot().is_empty());
        assert!(!scheduler.cancel("Game"));

        assert!(matches!(events.recv().await, Some(DownloadEvent::Queued { .. })));
        assert!(matches!(
            events.recv().await,
            Some(DownloadEvent::Finished {
                state: TaskState::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn installs_end_to_end_through_every_state() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("game.exe", &b"MZ"[..])]);
        server.route("/d/g1.zip", Route::ok(archive.clone()));
        let root = temp_dir("scheduler");
        let (scheduler, mut events) = DownloadScheduler::new(installer(&server.base_url, &root), 3);
        scheduler.start();

        assert!(scheduler.enqueue(entry("Game", "/d/g1.zip", &md5_hex(&archive))));
        let (states, percents) = history_until_finished(&mut events, "Game").await;

        assert!(percents.windows(2).all(|pair| pair[0] < pair[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(
            states,
            vec![
                TaskState::Queued,
                TaskState::Downloading,
                TaskState::Verifying,
                TaskState::Extracting,
                TaskState::Completed,
            ]
        );
        let installed = InstalledIndex::new(root.join("apps")).list_installed();
        assert_eq!(installed.len(), 1);
        assert!(installed["Game"].contains("1.0"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_without_install() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("game.exe", &b"MZ"[..])]);
        server.route("/d/g1.zip", Route::ok(archive));
        let root = temp_dir("scheduler");
        let (scheduler, mut events) = DownloadScheduler::new(installer(&server.base_url, &root), 3);
        scheduler.start();

        scheduler.enqueue(entry("Game", "/d/g1.zip", &md5_hex(b"different")));
        let states = states_until_finished(&mut events, "Game").await;

        assert_eq!(
            states.last(),
            Some(&TaskState::Failed(FailureReason::ChecksumMismatch))
        );
        assert!(!states.contains(&TaskState::Extracting));
        assert!(InstalledIndex::new(root.join("apps")).list_installed().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn never_more_than_three_downloading() {
        let server = FixtureServer::start();
        let root = temp_dir("scheduler");
        let titles = ["A", "B", "C", "D", "E"];
        let mut entries = Vec::new();
        for title in titles {
            let archive = zip_bytes(&[("data.bin", title.as_bytes())]);
            let path = format!("/d/{title}.zip");
            server.route(
                &path,
                Route::ok(archive.clone()).delayed(Duration::from_millis(300)),
            );
            entries.push(entry(title, &path, &md5_hex(&archive)));
        }
        let (scheduler, mut events) = DownloadScheduler::new(installer(&server.base_url, &root), 3);
        scheduler.start();
        for entry in entries {
            assert!(scheduler.enqueue(entry));
        }

        let mut finished = 0;
        let mut peak = 0;
        while finished < titles.len() {
            peak = peak.max(scheduler.downloading_count());
            assert!(scheduler.active_count() <= 3);
            match tokio::time::timeout(Duration::from_millis(20), events.recv()).await {
                Ok(Some(DownloadEvent::Finished { state, .. })) => {
                    assert_eq!(state, TaskState::Completed);
                    finished += 1;
                }
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => panic!("event channel closed"),
            }
        }

        assert!(peak <= 3);
        assert_eq!(
            InstalledIndex::new(root.join("apps")).list_installed().len(),
            titles.len()
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn config_cap_is_clamped() {
        let root = temp_dir("scheduler");
        let (scheduler, _events) = DownloadScheduler::new(installer("http://127.0.0.1:9", &root), 8);
        assert_eq!(scheduler.max_active(), 3);
    }

    #[tokio::test]
    async fn progress_is_reported_only_when_it_grows() {
        let root = temp_dir("scheduler");
        let (scheduler, mut events) = DownloadScheduler::new(installer("http://127.0.0.1:9", &root), 3);
        let reporter = TaskReporter {
            inner: scheduler.inner.clone(),
            title: "Game".to_string(),
            last_percent: AtomicI16::new(-1),
        };

        for percent in [10, 5, 10, 40] {
            reporter.progress(percent);
        }

        let mut reported = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Progress { title, percent } = event {
                assert_eq!(title, "Game");
                reported.push(percent);
            }
        }
        assert_eq!(reported, vec![10, 40]);
    }

    #[tokio::test]
    async fn cancelled_transfer_keeps_temp_file_and_resumes() {
        let server = FixtureServer::start();
        let archive = zip_bytes(&[("data.bin", &noise(64 * 1024)[..])]);
        server.route(
            "/d/g1.zip",
            Route::ok(archive.clone()).trickled(4096, Duration::from_millis(50)),
        );
        let root = temp_dir("scheduler");
        let (temp_path, _) = installer(&server.base_url, &root).artifact_paths("Game", "1.0");
        let (scheduler, mut events) = DownloadScheduler::new(installer(&server.base_url, &root), 3);
        scheduler.start();

        assert!(scheduler.enqueue(entry("Game", "/d/g1.zip", &md5_hex(&archive))));
        loop {
            let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
                .await
                .expect("event before timeout")
                .expect("event channel open");
            if let DownloadEvent::Progress { percent, .. } = event {
                if percent > 0 {
                    break;
                }
            }
        }
        assert!(scheduler.cancel("Game"));
        let states = states_until_finished(&mut events, "Game").await;
        assert_eq!(states.last(), Some(&TaskState::Cancelled));

        assert_eq!(temp_path.file_name().and_then(|name| name.to_str()), Some("Game_1.0.tmp"));
        let kept = std::fs::metadata(&temp_path).expect("temp file kept").len();
        assert!(kept > 0 && kept < archive.len() as u64, "kept {kept} bytes");
        assert!(InstalledIndex::new(root.join("apps")).list_installed().is_empty());

        server.route("/d/g1.zip", Route::ok(archive.clone()));
        assert!(scheduler.enqueue(entry("Game", "/d/g1.zip", &md5_hex(&archive))));
        let states = states_until_finished(&mut events, "Game").await;
        assert_eq!(states.last(), Some(&TaskState::Completed));

        let resumed = server.requests().last().cloned().expect("resumed request");
        assert_eq!(resumed.path, "/d/g1.zip");
        assert_eq!(resumed.range, Some(format!("bytes={kept}-")));
        assert!(!temp_path.exists());
        assert!(InstalledIndex::new(root.join("apps")).list_installed()["Game"].contains("1.0"));
        scheduler.shutdown().await;
    }
}
