use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    backend::port::{BackendError, ChatBackend, FetchedObject},
    domain::{FileHandle, MessageId},
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between uploads into the channel (channel flood control).
    pub upload_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            upload_min_interval: Duration::from_secs(3), // ~20 posts/min
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// ChatBackend decorator that spaces out uploads.
///
/// This is a best-effort defense against channel flood limits. It never retries; a
/// throttled call simply waits for its slot. Fetches pass straight through.
pub struct ThrottledBackend {
    inner: Arc<dyn ChatBackend>,
    uploads: Mutex<IntervalLimiter>,
}

impl ThrottledBackend {
    pub fn new(inner: Arc<dyn ChatBackend>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            uploads: Mutex::new(IntervalLimiter::new(cfg.upload_min_interval)),
        }
    }

    async fn throttle_upload(&self) {
        let wait = { self.uploads.lock().await.reserve() };
        if wait > Duration::from_millis(0) {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "throttling upload");
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl ChatBackend for ThrottledBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn upload(
        &self,
        filename: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        max_bytes: u64,
    ) -> Result<FileHandle, BackendError> {
        self.throttle_upload().await;
        self.inner.upload(filename, reader, max_bytes).await
    }

    async fn fetch(&self, id: MessageId) -> Result<FetchedObject, BackendError> {
        self.inner.fetch(id).await
    }
}
