//! Shared last-value state and the pending-upload buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::device::{DeviceId, TimeseriesKey};
use server_api::TimeseriesValue;

/// Most recent value observed for each stream.
///
/// Written only by polling tasks, read by automations and the watchdog.
/// Last-writer-wins; there is no ordering guarantee across keys.
#[derive(Default)]
pub struct LastValueTable {
    values: Mutex<HashMap<TimeseriesKey, f64>>,
}

impl LastValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: DeviceId, series: &str) -> Option<f64> {
        self.values
            .lock()
            .unwrap()
            .get(&(device_id, series.to_string()))
            .copied()
    }

    pub fn update(&self, values: &HashMap<TimeseriesKey, f64>) {
        let mut table = self.values.lock().unwrap();
        for (key, value) in values {
            table.insert(key.clone(), *value);
        }
    }

    /// Test/diagnostic helper for a single stream.
    pub fn set(&self, device_id: DeviceId, series: &str, value: f64) {
        self.values
            .lock()
            .unwrap()
            .insert((device_id, series.to_string()), value);
    }
}

/// Fixed-precision rendering; values travel as strings to avoid
/// floating-point drift on the wire.
pub fn format_value(value: f64, decimal_places: i32) -> String {
    format!("{:.*}", decimal_places.max(0) as usize, value)
}

const DEFAULT_DECIMAL_PLACES: i32 = 2;

/// One batch as drained from the buffer: ordered samples per stream.
pub type SampleBatch = HashMap<TimeseriesKey, VecDeque<TimeseriesValue>>;

struct BufferInner {
    samples: SampleBatch,
    total: usize,
}

/// Samples awaiting server acknowledgment.
///
/// Append-only from poll results; drained atomically by the sync loop so
/// pollers keep accumulating into a fresh map during network I/O. A failed
/// send merges its batch back in front of anything that arrived meanwhile.
/// Bounded by a total-sample cap: once exceeded, the oldest samples are
/// dropped, signalling unrecoverable backlog instead of growing without
/// bound.
pub struct UploadBuffer {
    inner: Mutex<BufferInner>,
    max_samples: usize,
    decimal_places: HashMap<TimeseriesKey, i32>,
}

impl UploadBuffer {
    pub fn new(max_samples: usize, decimal_places: HashMap<TimeseriesKey, i32>) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                samples: HashMap::new(),
                total: 0,
            }),
            max_samples,
            decimal_places,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one poll result, timestamped locally since batches are not
    /// sent immediately. Values are rounded to their stream's definition.
    pub fn append(&self, values: &HashMap<TimeseriesKey, f64>, timestamp: DateTime<Utc>) {
        let timestamp = timestamp.to_rfc3339();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for (key, value) in values {
            let places = self
                .decimal_places
                .get(key)
                .copied()
                .unwrap_or(DEFAULT_DECIMAL_PLACES);
            inner
                .samples
                .entry(key.clone())
                .or_default()
                .push_back(TimeseriesValue {
                    timestamp: timestamp.clone(),
                    value: format_value(*value, places),
                });
            inner.total += 1;
        }
        enforce_cap(inner, self.max_samples);
    }

    /// Atomically take everything pending, leaving an empty buffer behind.
    pub fn take_all(&self) -> SampleBatch {
        let mut inner = self.inner.lock().unwrap();
        inner.total = 0;
        std::mem::take(&mut inner.samples)
    }

    /// Return a failed batch. The batch predates anything buffered since
    /// the drain, so its samples go in front; the cap is re-applied.
    pub fn merge_back(&self, batch: SampleBatch) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for (key, mut returned) in batch {
            let entry = inner.samples.entry(key).or_default();
            returned.append(entry);
            *entry = returned;
        }
        inner.total = inner.samples.values().map(VecDeque::len).sum();
        enforce_cap(inner, self.max_samples);
    }
}

/// Drop oldest samples (by timestamp across all streams) until under cap.
fn enforce_cap(inner: &mut BufferInner, max_samples: usize) {
    while inner.total > max_samples {
        let oldest_key = inner
            .samples
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|s| (key.clone(), s.timestamp.clone())))
            .min_by(|a, b| a.1.cmp(&b.1))
            .map(|(key, _)| key);
        let Some(key) = oldest_key else { break };
        if let Some(queue) = inner.samples.get_mut(&key) {
            queue.pop_front();
            inner.total -= 1;
            if queue.is_empty() {
                inner.samples.remove(&key);
            }
        }
    }
}
