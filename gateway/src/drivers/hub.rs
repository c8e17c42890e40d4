//! Simulated hub: owns push-only child sensors and accumulates their
//! readings between polls.
//!
//! This is the shape of the listener-based hubs (LoRa gateways, syslog
//! receivers): data for child devices arrives on the hub's own service, the
//! scheduler polls the hub, and the hub hands over whatever accumulated.
//! The listener task captures its own hub state directly rather than going
//! through a process-wide singleton, and it only starts once composition is
//! complete, so the child list is stable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceHandle, DeviceId, Hub, PollError, TimeseriesKey};
use server_api::{DeviceConfig, TimeseriesDefinition};

const SIM_PUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct SimHub {
    inner: Arc<HubInner>,
    local_sim: bool,
}

struct HubInner {
    id: DeviceId,
    name: String,
    children: Mutex<Vec<Arc<DeviceHandle>>>,
    pending: Mutex<HashMap<TimeseriesKey, f64>>,
    tick: AtomicU64,
}

pub(super) fn build_hub(config: &DeviceConfig, local_sim: bool) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(SimHub::new(config, local_sim)))
}

impl SimHub {
    pub fn new(config: &DeviceConfig, local_sim: bool) -> Self {
        Self {
            inner: Arc::new(HubInner {
                id: config.id,
                name: config.name.clone(),
                children: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                tick: AtomicU64::new(0),
            }),
            local_sim: local_sim || config.local_sim(),
        }
    }

    /// Record a reading that arrived on the hub's listener for one of its
    /// children. Readings for unknown devices are dropped with a log line.
    pub fn push_reading(&self, device_id: DeviceId, series: &str, value: f64) {
        self.inner.push_reading(device_id, series, value);
    }

    pub fn child_count(&self) -> usize {
        self.inner.children.lock().unwrap().len()
    }
}

impl HubInner {
    fn push_reading(&self, device_id: DeviceId, series: &str, value: f64) {
        let children = self.children.lock().unwrap();
        let Some(child) = children.iter().find(|c| c.id == device_id) else {
            warn!(hub = %self.name, device_id, "reading from unknown child device");
            return;
        };
        child.touch();
        self.pending
            .lock()
            .unwrap()
            .insert((device_id, series.to_string()), value);
    }

    /// Generate one round of readings for every child series (simulation
    /// stand-in for the vendor listener).
    fn generate(&self) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let wobble = (tick % 7) as f64 * 0.1;
        let definitions: Vec<TimeseriesDefinition> = {
            let children = self.children.lock().unwrap();
            children
                .iter()
                .flat_map(|child| child.driver.timeseries_definitions())
                .collect()
        };
        for def in definitions {
            let base = (def.device_id % 10) as f64 + 20.0;
            self.push_reading(def.device_id, &def.timeseries_name, base + wobble);
        }
    }
}

#[async_trait]
impl Device for SimHub {
    /// Hand over everything accumulated since the last poll.
    async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
        let mut pending = self.inner.pending.lock().unwrap();
        Ok(std::mem::take(&mut *pending))
    }

    async fn reconnect(&self) {}

    /// Children supply their own definitions; the hub has no series of its own.
    fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
        Vec::new()
    }

    /// Cadence for draining accumulated child readings, not a hardware poll.
    fn default_polling_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }

    /// No update expectation for the hub itself; the children carry it.
    fn expected_update_interval(&self) -> Option<Duration> {
        None
    }

    fn as_hub(&self) -> Option<&dyn Hub> {
        Some(self)
    }
}

impl Hub for SimHub {
    fn add_child(&self, child: Arc<DeviceHandle>) {
        if child.parent_id != Some(self.inner.id) {
            warn!(
                hub = %self.inner.name,
                hub_id = self.inner.id,
                child = %child.name,
                parent_id = ?child.parent_id,
                "refusing child whose parent id does not match this hub"
            );
            return;
        }
        debug!(hub = %self.inner.name, child = %child.name, "child attached");
        self.inner.children.lock().unwrap().push(child);
    }

    fn composition_complete(&self, cancel: CancellationToken) {
        if !self.local_sim {
            // The hardware-backed listener would bind here. Nothing to
            // start for the simulated hub outside local-sim mode.
            return;
        }
        let inner = self.inner.clone();
        info!(hub = %inner.name, "starting simulated reading source");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SIM_PUSH_INTERVAL) => inner.generate(),
                }
            }
        });
    }
}

/// A push-only child sensor: its readings arrive through the owning hub's
/// listener, so it is never polled directly.
pub struct PushSensor {
    id: DeviceId,
    series: Vec<String>,
}

pub(super) fn build_sensor(config: &DeviceConfig, _local_sim: bool) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(PushSensor::new(config)))
}

impl PushSensor {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            id: config.id,
            series: vec!["temperature".to_string(), "humidity".to_string()],
        }
    }
}

#[async_trait]
impl Device for PushSensor {
    /// Never scheduled; data flows through the hub.
    async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
        Ok(HashMap::new())
    }

    async fn reconnect(&self) {}

    fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
        self.series
            .iter()
            .map(|series| TimeseriesDefinition {
                device_id: self.id,
                timeseries_name: series.clone(),
                data_type: "Numeric".to_string(),
                decimal_places: 2,
            })
            .collect()
    }

    /// These sensors report infrequently; give them a generous window.
    fn expected_update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(30 * 60))
    }
}
