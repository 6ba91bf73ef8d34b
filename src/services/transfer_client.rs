use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::errors::{LauncherError, Result};

/// Status reported by [`TransferClient::get`] when the request never produced
/// an HTTP response.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    /// Verify hostname and certificate chain.
    Verified,
    /// Skip certificate and hostname verification.
    Relaxed,
}

impl TlsMode {
    pub fn from_verify(verify: bool) -> Self {
        if verify {
            TlsMode::Verified
        } else {
            TlsMode::Relaxed
        }
    }
}

/// Cooperative stop signal, checked between body chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferControl {
    Running,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct TransferResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransferResponse {
    pub fn transport_failure() -> Self {
        Self {
            status: TRANSPORT_FAILURE_STATUS,
            body: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes present in the destination file, including any resumed prefix.
    pub written: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|total| *total > 0)?;
        Some(((self.written.min(total) * 100) / total) as u8)
    }
}

/// One-request-per-call HTTP client bound to a base location.
#[derive(Clone)]
pub struct TransferClient {
    client: reqwest::Client,
    base_url: String,
    tls_mode: TlsMode,
}

impl TransferClient {
    pub fn new(
        base_url: &str,
        tls_mode: TlsMode,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pintuxx-launcher/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(tls_mode == TlsMode::Relaxed)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tls_mode,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    /// Absolute `http(s)://` references are used verbatim; anything else is
    /// joined onto the base.
    pub fn resolve_url(&self, path: &str) -> String {
        let trimmed = path.trim();
        if is_absolute_url(trimmed) {
            return trimmed.to_string();
        }
        let relative = trimmed.trim_start_matches('/');
        if relative.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, relative)
    }

    /// Issues one GET and buffers the whole body. Transport faults are logged
    /// and collapsed into [`TransferResponse::transport_failure`].
    pub async fn get(&self, path: &str, headers: HeaderMap) -> TransferResponse {
        let url = self.resolve_url(path);
        let response = match self.client.get(&url).headers(headers).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!("request error url={} error={}", url, err);
                return TransferResponse::transport_failure();
            }
        };
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => TransferResponse {
                status,
                body: body.to_vec(),
            },
            Err(err) => {
                tracing::error!("response body error url={} status={} error={}", url, status, err);
                TransferResponse::transport_failure()
            }
        }
    }

    /// Streams `path` into `dest`, resuming from the current size of `dest`
    /// when it already exists. A 200 reply truncates and rewrites the file,
    /// a 206 reply appends; any other status fails the attempt. Returns the
    /// final size of `dest`.
    pub async fn download_to<F>(
        &self,
        path: &str,
        dest: &Path,
        control: &watch::Receiver<TransferControl>,
        mut on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(TransferProgress),
    {
        let url = self.resolve_url(path);
        let offset = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let mut request = self.client.get(&url);
        if offset > 0 {
            tracing::info!("resuming download url={} offset={}", url, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;
        let status = response.status();

        let (mut file, mut written) = match status {
            StatusCode::OK => {
                if offset > 0 {
                    tracing::info!("server ignored range, restarting url={}", url);
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(dest)
                    .await?;
                (file, 0)
            }
            StatusCode::PARTIAL_CONTENT => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dest)
                    .await?;
                (file, offset)
            }
            other => {
                return Err(LauncherError::Http(format!(
                    "HTTP {} for {}",
                    other.as_u16(),
                    url
                )));
            }
        };

        let total = response.content_length().map(|len| len + written);
        on_progress(TransferProgress { written, total });

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if *control.borrow() == TransferControl::Cancelled {
                file.flush().await?;
                return Err(LauncherError::Cancelled);
            }
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
            on_progress(TransferProgress { written, total });
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn is_absolute_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
