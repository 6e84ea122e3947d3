//! Checksum-gated uploads with progress reporting.
//!
//! The local file is hashed with SHA-256 and compared with `sha256sum` run on
//! the remote side. Anything short of an exact match (missing file, failed or
//! garbled checksum output) means the file is uploaded.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::io::executor::{CommandOptions, RemoteExecutor};
use crate::io::shell;

pub const DEFAULT_FINISHING_INTERVAL: Duration = Duration::from_millis(250);

const HASH_BUFFER_BYTES: usize = 64 * 1024;
const STOP_POLL: Duration = Duration::from_millis(20);

/// Receives transfer progress.
pub trait TransferObserver: Send + Sync {
    /// Bytes sent so far; never called with `sent == total`.
    fn progress(&self, label: &str, sent: u64, total: u64);

    /// All bytes are out but the upload has not returned yet.
    fn finishing(&self, label: &str);

    fn finished(&self, label: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub host: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Shown next to the progress display.
    pub label: String,
}

impl TransferJob {
    /// Job labelled with the local file name.
    pub fn new(host: &str, local_path: &Path, remote_path: &str) -> Self {
        let label = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_path.display().to_string());
        Self {
            host: host.to_string(),
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            label,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    pub uploaded: bool,
}

pub struct TransferManager<'a> {
    executor: &'a RemoteExecutor<'a>,
    observer: Arc<dyn TransferObserver>,
    finishing_interval: Duration,
}

impl<'a> TransferManager<'a> {
    pub fn new(executor: &'a RemoteExecutor<'a>, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            executor,
            observer,
            finishing_interval: DEFAULT_FINISHING_INTERVAL,
        }
    }

    pub fn with_finishing_interval(mut self, interval: Duration) -> Self {
        self.finishing_interval = interval;
        self
    }

    /// Upload unless the remote copy already has the local file's digest.
    #[instrument(skip_all, fields(host = %job.host, remote_path = %job.remote_path))]
    pub fn upload_if_needed(&self, job: &TransferJob) -> Result<UploadOutcome> {
        let local = file_sha256(&job.local_path)?;
        match self.remote_checksum(&job.host, &job.remote_path) {
            Some(remote) if remote == local => {
                info!(checksum = %local, "remote copy is current, skipping upload");
                self.executor
                    .sink()
                    .message(&format!("{} already present on {}", job.label, job.host));
                Ok(UploadOutcome { uploaded: false })
            }
            remote => {
                debug!(local = %local, remote = ?remote, "checksum mismatch");
                self.upload(job)?;
                Ok(UploadOutcome { uploaded: true })
            }
        }
    }

    /// Upload unconditionally.
    ///
    /// The final `sent == total` tick starts the finishing indicator instead
    /// of reporting 100%; only the transport call returning completes the
    /// upload.
    #[instrument(skip_all, fields(host = %job.host, remote_path = %job.remote_path))]
    pub fn upload(&self, job: &TransferJob) -> Result<()> {
        let mut indicator: Option<FinishingIndicator> = None;
        let result = self.executor.put(
            &job.host,
            &job.local_path,
            &job.remote_path,
            &mut |sent, total| {
                if sent >= total {
                    if indicator.is_none() {
                        indicator = Some(FinishingIndicator::start(
                            Arc::clone(&self.observer),
                            job.label.clone(),
                            self.finishing_interval,
                        ));
                    }
                } else {
                    self.observer.progress(&job.label, sent, total);
                }
            },
        );
        if let Some(indicator) = indicator {
            indicator.stop();
        }

        result.with_context(|| format!("upload {} to {}", job.label, job.host))?;
        self.observer.finished(&job.label);
        Ok(())
    }

    /// SHA-256 of `path` on `host`, or `None` when it cannot be determined.
    pub fn remote_checksum(&self, host: &str, path: &str) -> Option<String> {
        let opts = CommandOptions {
            quiet: true,
            ..Default::default()
        };
        let command = format!("sha256sum {}", shell::quote(path));
        match self.executor.run(host, &command, &opts) {
            Ok(result) if result.success() => parse_checksum_output(&result.stdout_lines),
            Ok(result) => {
                debug!(host, path, termination = %result.termination(), "remote checksum failed");
                None
            }
            Err(err) => {
                debug!(host, path, err = %err, "remote checksum unavailable");
                None
            }
        }
    }
}

/// Lower-case hex SHA-256 of a local file.
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest from `sha256sum` output: first token of the first line, 64 hex digits.
pub fn parse_checksum_output(lines: &[String]) -> Option<String> {
    let token = lines.first()?.split_whitespace().next()?;
    let token = token.strip_prefix('\\').unwrap_or(token);
    (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}

/// Background "still finishing" ticker owned by one upload.
pub struct FinishingIndicator {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FinishingIndicator {
    /// Signal `finishing` now, then once per `interval` until stopped.
    pub fn start(observer: Arc<dyn TransferObserver>, label: String, interval: Duration) -> Self {
        observer.finishing(&label);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut next = Instant::now() + interval;
            while flag.load(Ordering::Acquire) {
                let now = Instant::now();
                if now >= next {
                    observer.finishing(&label);
                    next = now + interval;
                }
                thread::sleep(STOP_POLL.min(next.saturating_duration_since(now)));
            }
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("finishing indicator thread panicked");
            }
        }
    }
}

impl Drop for FinishingIndicator {
    fn drop(&mut self) {
        self.halt();
    }
}
