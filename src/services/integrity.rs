use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::errors::{LauncherError, Result};

const BLOCK_SIZE: usize = 64 * 1024;

/// Streams whole files through MD5 in fixed-size blocks and gates on the
/// expected hex digest.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn digest_file(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0_u8; BLOCK_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            context.consume(&buffer[..read]);
        }
        Ok(format!("{:x}", context.compute()))
    }

    /// Fails with `ChecksumMismatch` unless the file's digest equals
    /// `expected` (compared case-insensitively, surrounding whitespace ignored).
    pub fn verify_file(&self, path: &Path, expected: &str) -> Result<()> {
        let expected = normalize_checksum(expected);
        if expected.is_empty() {
            return Err(LauncherError::ChecksumMismatch {
                expected,
                actual: "<no checksum declared>".to_string(),
            });
        }
        let actual = self.digest_file(path)?;
        if actual != expected {
            return Err(LauncherError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    pub async fn verify_file_async(&self, path: &Path, expected: &str) -> Result<()> {
        let verifier = *self;
        let path: PathBuf = path.to_path_buf();
        let expected = expected.to_string();
        tokio::task::spawn_blocking(move || verifier.verify_file(&path, &expected))
            .await
            .map_err(|err| LauncherError::Config(format!("verification task failed: {err}")))?
    }
}

pub fn normalize_checksum(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
