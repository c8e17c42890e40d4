//! Batched upload of buffered samples to the server.
//!
//! One task drains the buffer on a fixed interval. A failed upload puts the
//! whole batch back at the front of the buffer, so nothing is lost across
//! outages; the buffer's own cap bounds memory if the outage drags on.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::UploadBuffer;
use server_api::{ServerClient, TimeseriesValuesEntry};

/// Tracks when an upload last succeeded; read by the watchdog.
pub struct UploadTracker {
    last_success: Mutex<Instant>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self {
            last_success: Mutex::new(Instant::now()),
        }
    }

    pub fn mark_success(&self) {
        *self.last_success.lock().unwrap() = Instant::now();
    }

    pub fn since_last_success(&self) -> Duration {
        self.last_success.lock().unwrap().elapsed()
    }

    /// Pretend the last success happened `by` ago.
    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        *self.last_success.lock().unwrap() = Instant::now() - by;
    }
}

impl Default for UploadTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the buffer and upload everything in one request. Returns the
/// number of samples delivered.
///
/// A transport or server error merges the batch back; per-stream failures
/// reported in an otherwise successful response are logged and dropped,
/// since resending them would fail the same way.
pub async fn drain_once(
    client: &ServerClient,
    buffer: &UploadBuffer,
    tracker: &UploadTracker,
) -> usize {
    let batch = buffer.take_all();
    if batch.is_empty() {
        return 0;
    }
    let mut sample_count = 0;
    let entries: Vec<TimeseriesValuesEntry> = batch
        .iter()
        .map(|((device_id, series), values)| {
            sample_count += values.len();
            TimeseriesValuesEntry {
                device_id: *device_id,
                timeseries_name: series.clone(),
                values: values.iter().cloned().collect(),
            }
        })
        .collect();

    match client.post_timeseries_values(&entries).await {
        Ok(response) => {
            tracker.mark_success();
            for failure in &response.failures {
                warn!(
                    device = failure.device_id,
                    series = %failure.timeseries_name,
                    "server rejected values for stream"
                );
            }
            debug!(samples = sample_count, streams = entries.len(), "upload complete");
            sample_count
        }
        Err(e) => {
            warn!(samples = sample_count, error = %e, "upload failed; batch retained");
            buffer.merge_back(batch);
            0
        }
    }
}

/// Perpetual upload loop on `send_interval`. On shutdown the caller runs a
/// final `drain_once` itself after the pollers stop.
pub async fn sync_loop(
    client: Arc<ServerClient>,
    buffer: Arc<UploadBuffer>,
    tracker: Arc<UploadTracker>,
    send_interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval = ?send_interval, "upload task started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(send_interval) => {}
        }
        drain_once(&client, &buffer, &tracker).await;
    }
    debug!("upload task stopped");
}

/// Retry an operation until it succeeds, waiting `backoff` between attempts.
/// Used for startup steps that must complete before the gateway can run.
pub async fn retry_forever<T, E, F, Fut>(what: &str, backoff: Duration, mut op: F) -> T
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) => {
                warn!(step = what, error = %e, backoff = ?backoff, "startup step failed; retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
