use std::path::{Path, PathBuf};

pub const PORTABLE_MARKER: &str = "portable.config.json";

pub fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join(PORTABLE_MARKER).exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(Path::new(trimmed))
}

/// Root of all launcher state: `PINTUXX_ROOT_DIR`, then a portable install
/// next to the executable, then the working directory.
pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("PINTUXX_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_data_dir(root: &Path) -> PathBuf {
    let config = root.join("config");
    ensure_dir(&config).unwrap_or_else(|| root.to_path_buf())
}

pub fn resolve_install_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("PINTUXX_INSTALL_DIR") {
        return dir;
    }
    let fallback = root.join("apps");
    ensure_dir(&fallback).unwrap_or(fallback)
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("PINTUXX_LOG_DIR") {
        return dir;
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(found) = ensure_dir(&dir.join("logs")) {
                return found;
            }
        }
    }

    PathBuf::from("logs")
}

/// Replaces characters that cannot appear in a directory name.
pub fn sanitize_folder_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => ch,
        })
        .collect::<String>()
        .trim()
        .trim_end_matches('.')
        .to_string()
}
