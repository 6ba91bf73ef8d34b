use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FailureReason;

/// title -> installed versions
pub type InstalledMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Megabytes.
    #[serde(default)]
    pub file_size: f64,
    /// Gigabytes.
    #[serde(default)]
    pub required_ram: f64,
    /// Gigabytes.
    #[serde(default)]
    pub required_storage: f64,
    pub download_path: String,
    pub checksum: String,
}

impl CatalogEntry {
    pub fn declared_size_bytes(&self) -> u64 {
        if self.file_size.is_finite() && self.file_size > 0.0 {
            (self.file_size * 1024.0 * 1024.0) as u64
        } else {
            0
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub games: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    /// Copies each map key into its entry's `id`.
    pub fn with_ids(mut self) -> Self {
        for (id, entry) in self.games.iter_mut() {
            entry.id = id.clone();
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.games.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CatalogEntry> {
        self.games.values().find(|entry| entry.name == name)
    }
}

/// On-disk form of the last successfully fetched catalog.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub games: BTreeMap<String, CatalogEntry>,
    #[serde(default)]
    pub last_update: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogSource {
    Remote,
    Cached { last_update: i64 },
}

#[derive(Clone, Debug)]
pub struct CatalogFetch {
    pub catalog: Catalog,
    pub source: CatalogSource,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UpdateManifest {
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub changelog: String,
    /// Megabytes.
    #[serde(default)]
    pub file_size: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Downloading,
    Verifying,
    Extracting,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => f.write_str("queued"),
            TaskState::Downloading => f.write_str("downloading"),
            TaskState::Verifying => f.write_str("verifying"),
            TaskState::Extracting => f.write_str("extracting"),
            TaskState::Completed => f.write_str("completed"),
            TaskState::Failed(reason) => write!(f, "failed ({})", reason),
            TaskState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadTask {
    pub id: String,
    pub entry: CatalogEntry,
    pub source_url: String,
    pub state: TaskState,
    pub progress: u8,
    /// Index of the pool worker running the task, once dispatched.
    pub worker: Option<usize>,
}

impl DownloadTask {
    pub fn new(entry: CatalogEntry, source_url: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entry,
            source_url,
            state: TaskState::Queued,
            progress: 0,
            worker: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.entry.name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DownloadEvent {
    Queued {
        title: String,
        version: String,
    },
    StateChanged {
        title: String,
        state: TaskState,
    },
    Progress {
        title: String,
        percent: u8,
    },
    Finished {
        title: String,
        version: String,
        state: TaskState,
        message: Option<String>,
    },
    /// Installed state changed; consumers should rescan.
    RefreshRequested,
}
