//! Contract for the asynchronous HTTP fetcher, plus the concrete
//! `reqwest`-backed implementation used outside of tests.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{PullError, PullResult};

/// A temp file produced by a completed fetch. Ownership is exactly-once:
/// whoever receives it is responsible for calling `delete` once its
/// contents have been consumed (or on any error path).
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn delete(self) -> PullResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Asynchronous byte-range downloader contract. One concurrency cap and
/// one byte counter shared across every in-flight request.
pub trait Fetcher: Send + Sync + 'static {
    fn request_uri(
        &self,
        uri: String,
        cancel: CancellationToken,
    ) -> impl Future<Output = PullResult<TempFile>> + Send;

    /// Cumulative bytes transferred across every completed request.
    fn bytes_transferred(&self) -> u64;

    /// Current outstanding-request state as a short human string, for the
    /// status-line renderer.
    fn state_summary(&self) -> String;
}

const MAX_RETRIES: u32 = 3;
const RETRY_DELAYS_MS: &[u64] = &[500, 2000, 5000];

/// `reqwest`-backed fetcher: downloads each URI to a unique temp file
/// under `spool_dir`, bounded by an internal semaphore.
pub struct HttpFetcher {
    client: reqwest::Client,
    spool_dir: PathBuf,
    semaphore: Arc<tokio::sync::Semaphore>,
    bytes_transferred: AtomicU64,
    next_temp_id: AtomicU64,
    in_flight: AtomicU64,
}

impl HttpFetcher {
    pub fn new(spool_dir: PathBuf, max_concurrent: usize) -> PullResult<Self> {
        std::fs::create_dir_all(&spool_dir)?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("pullctl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(max_concurrent)
            .build()
            .map_err(|e| PullError::Network {
                uri: "<client-build>".into(),
                source: e,
            })?;
        Ok(Self {
            client,
            spool_dir,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
            bytes_transferred: AtomicU64::new(0),
            next_temp_id: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        })
    }

    fn next_temp_path(&self) -> PathBuf {
        let id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
        self.spool_dir.join(format!("fetch-{id:016x}.tmp"))
    }

    /// Retries transient failures with the same backoff schedule as the
    /// bundled retriable download helper this fetcher was generalized
    /// from; a cancellation always short-circuits the schedule.
    async fn request_uri_with_retry(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> PullResult<TempFile> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_DELAYS_MS[(attempt - 1) as usize];
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PullError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }
            match self.request_uri_inner(uri, cancel).await {
                Ok(temp) => return Ok(temp),
                Err(PullError::Cancelled) => return Err(PullError::Cancelled),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("MAX_RETRIES > 0"))
    }

    async fn request_uri_inner(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> PullResult<TempFile> {
        let send = self.client.get(uri).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            r = send => r.map_err(|e| PullError::Network { uri: uri.to_string(), source: e })?,
        };
        let resp = resp.error_for_status().map_err(|e| PullError::Network {
            uri: uri.to_string(),
            source: e,
        })?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            b = resp.bytes() => b.map_err(|e| PullError::Network { uri: uri.to_string(), source: e })?,
        };

        let temp_path = self.next_temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        self.bytes_transferred
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(TempFile::new(temp_path))
    }
}

impl Fetcher for HttpFetcher {
    async fn request_uri(&self, uri: String, cancel: CancellationToken) -> PullResult<TempFile> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PullError::Cancelled)?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.request_uri_with_retry(&uri, &cancel).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    fn state_summary(&self) -> String {
        format!(
            "{} in-flight, {} bytes transferred",
            self.in_flight.load(Ordering::Relaxed),
            self.bytes_transferred()
        )
    }
}
