//! Download transport: the handler trait the orchestrator consumes, an HTTP
//! implementation, a local-directory implementation (file mirrors and tests),
//! and the bounded-retry wrapper that fronts them.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::PatchError;

pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(5);
/// Cumulative bytes downloaded across failed attempts after which retries stop
/// even if the attempt count limit has not been hit; bounds worst-case cost on
/// a flaky connection.
pub const DEFAULT_RETRY_BYTES_CAP: u64 = 30_000_000;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Progress callback: (bytes received, total bytes expected; 0 if unknown).
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// Fetches bytes from URLs. Implementations are free to interpret the URL
/// scheme however they like; the orchestrator only ever round-trips URLs taken
/// from the manifest.
pub trait DownloadHandler: Send {
    fn download_text(&self, url: &str) -> Result<String, PatchError>;

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<(), PatchError>;

    /// Availability probe: does the URL exist, and what size does the server
    /// report (0 if unknown)?
    fn exists_at(&self, url: &str) -> Result<(bool, u64), PatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceLevel {
    None,
    /// Update is unavailable but the currently installed version may launch.
    CanLaunch,
    /// The whole application should abort.
    Abort,
}

/// HTTP transport backed by a blocking reqwest client.
pub struct HttpDownloadHandler {
    client: reqwest::blocking::Client,
    probe_timeout: Duration,
}

impl HttpDownloadHandler {
    pub fn new() -> Result<HttpDownloadHandler, PatchError> {
        Self::with_probe_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(probe_timeout: Duration) -> Result<HttpDownloadHandler, PatchError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PatchError::Internal(format!("http client: {e}")))?;
        Ok(HttpDownloadHandler {
            client,
            probe_timeout,
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, PatchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| download_error(url, e))?;
        if !response.status().is_success() {
            return Err(PatchError::Download {
                url: url.to_owned(),
                detail: format!("HTTP status {}", response.status()),
            });
        }
        Ok(response)
    }
}

fn download_error(url: &str, e: impl std::fmt::Display) -> PatchError {
    PatchError::Download {
        url: url.to_owned(),
        detail: e.to_string(),
    }
}

impl DownloadHandler for HttpDownloadHandler {
    fn download_text(&self, url: &str) -> Result<String, PatchError> {
        self.get(url)?.text().map_err(|e| download_error(url, e))
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<(), PatchError> {
        let mut response = self.get(url)?;
        let total = response.content_length().unwrap_or(expected_size);

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::io::BufWriter::new(std::fs::File::create(dest)?);

        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0u64;
        loop {
            cancel.check()?;
            let n = response
                .read(&mut buf)
                .map_err(|e| download_error(url, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            received += n as u64;
            progress(received, total);
        }
        out.flush()?;
        Ok(())
    }

    fn exists_at(&self, url: &str) -> Result<(bool, u64), PatchError> {
        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .map_err(|e| download_error(url, e))?;
        if !response.status().is_success() {
            return Ok((false, 0));
        }
        Ok((true, response.content_length().unwrap_or(0)))
    }
}

/// Serves URLs out of a local directory: absolute URLs are used verbatim
/// (minus a `file://` prefix), anything else resolves relative to `root`.
pub struct DirDownloadHandler {
    root: PathBuf,
}

impl DirDownloadHandler {
    pub fn new(root: impl Into<PathBuf>) -> DirDownloadHandler {
        DirDownloadHandler { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let url = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(url);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl DownloadHandler for DirDownloadHandler {
    fn download_text(&self, url: &str) -> Result<String, PatchError> {
        let path = self.resolve(url);
        std::fs::read_to_string(&path).map_err(|e| download_error(url, e))
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Path,
        _expected_size: u64,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<(), PatchError> {
        cancel.check()?;
        let path = self.resolve(url);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let copied = std::fs::copy(&path, dest).map_err(|e| download_error(url, e))?;
        progress(copied, copied);
        Ok(())
    }

    fn exists_at(&self, url: &str) -> Result<(bool, u64), PatchError> {
        match std::fs::metadata(self.resolve(url)) {
            Ok(meta) if meta.is_file() => Ok((true, meta.len())),
            _ => Ok((false, 0)),
        }
    }
}

/// Bounded-retry wrapper around an arbitrary handler: a fixed attempt count,
/// a fixed cooldown between attempts, and a cumulative-bytes cap across failed
/// attempts.
pub struct RetryingDownloader {
    handler: Box<dyn DownloadHandler>,
    pub retry_limit: u32,
    pub cooldown: Duration,
    pub retry_bytes_cap: u64,
}

impl RetryingDownloader {
    pub fn new(handler: Box<dyn DownloadHandler>) -> RetryingDownloader {
        RetryingDownloader {
            handler,
            retry_limit: DEFAULT_RETRY_LIMIT,
            cooldown: DEFAULT_RETRY_COOLDOWN,
            retry_bytes_cap: DEFAULT_RETRY_BYTES_CAP,
        }
    }

    pub fn download_text(&self, url: &str, cancel: &CancelToken) -> Result<String, PatchError> {
        let mut last_err = None;
        for attempt in 0..self.retry_limit.max(1) {
            cancel.check()?;
            match self.handler.download_text(url) {
                Ok(text) => return Ok(text),
                Err(PatchError::Cancelled) => return Err(PatchError::Cancelled),
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "text download failed");
                    last_err = Some(e);
                    self.sleep_unless_last(attempt, cancel);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| download_error(url, "no attempts made")))
    }

    pub fn download_file(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<(), PatchError> {
        let mut last_err = None;
        let mut wasted_bytes = 0u64;

        for attempt in 0..self.retry_limit.max(1) {
            if wasted_bytes >= self.retry_bytes_cap {
                break;
            }
            cancel.check()?;

            let mut received_this_attempt = 0u64;
            let mut on_progress = |received: u64, total: u64| {
                received_this_attempt = received;
                progress(received, total);
            };

            match self
                .handler
                .download_to(url, dest, expected_size, &mut on_progress, cancel)
            {
                Ok(()) => return Ok(()),
                Err(PatchError::Cancelled) => return Err(PatchError::Cancelled),
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "file download failed");
                    wasted_bytes += received_this_attempt;
                    last_err = Some(e);
                    self.sleep_unless_last(attempt, cancel);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| download_error(url, "no attempts made")))
    }

    pub fn exists_at(&self, url: &str) -> Result<(bool, u64), PatchError> {
        self.handler.exists_at(url)
    }

    /// Maintenance probe: first char '1' means under maintenance, second char
    /// '1' escalates to "abort the whole app". Unreachable probe URLs are
    /// treated as no maintenance.
    pub fn check_maintenance(&self, url: &str, cancel: &CancelToken) -> MaintenanceLevel {
        if url.is_empty() || cancel.is_cancelled() {
            return MaintenanceLevel::None;
        }
        let text = match self.handler.download_text(url) {
            Ok(text) => text,
            Err(_) => return MaintenanceLevel::None,
        };
        let mut chars = text.chars();
        if chars.next() != Some('1') {
            return MaintenanceLevel::None;
        }
        if chars.next() == Some('1') {
            MaintenanceLevel::Abort
        } else {
            MaintenanceLevel::CanLaunch
        }
    }

    fn sleep_unless_last(&self, attempt: u32, cancel: &CancelToken) {
        if attempt + 1 < self.retry_limit && !cancel.is_cancelled() {
            std::thread::sleep(self.cooldown);
        }
    }
}
