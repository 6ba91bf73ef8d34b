use std::cmp::Ordering;

use crate::errors::{LauncherError, Result};

const COMPONENT_SEPARATOR: char = '.';

/// Parses every dot-separated component of `version` as an unsigned integer.
pub fn parse_components(version: &str) -> Result<Vec<u64>> {
    version
        .trim()
        .split(COMPONENT_SEPARATOR)
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| LauncherError::VersionParse(version.to_string()))
        })
        .collect()
}

/// Like [`parse_components`], but a malformed component counts as 0.
pub fn lenient_components(version: &str) -> Vec<u64> {
    version
        .trim()
        .split(COMPONENT_SEPARATOR)
        .map(|part| match part.trim().parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    "{}; component '{}' treated as 0",
                    LauncherError::VersionParse(version.to_string()),
                    part
                );
                0
            }
        })
        .collect()
}

/// Component-wise numeric comparison; a missing trailing component is 0.
/// Returns -1, 0 or 1.
pub fn compare_versions(left: &str, right: &str) -> i32 {
    let left = lenient_components(left);
    let right = lenient_components(right);
    let width = left.len().max(right.len());

    for index in 0..width {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Less => return -1,
            Ordering::Greater => return 1,
            Ordering::Equal => {}
        }
    }
    0
}

pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(current, candidate) < 0
}
