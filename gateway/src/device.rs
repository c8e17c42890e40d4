//! Device and hub capability contracts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use server_api::{DeviceConfig, TimeseriesDefinition};

pub type DeviceId = i64;

/// Identifies one logical measurement stream: `(device id, series name)`.
///
/// The device id is not necessarily the id of the device being polled; a hub
/// reports streams keyed by its children's ids.
pub type TimeseriesKey = (DeviceId, String);

/// Default watchdog expectation when a driver does not override it.
pub const DEFAULT_EXPECTED_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("malformed reading: {0}")]
    Malformed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capability contract every driver implements.
///
/// Drivers are black boxes over a hardware protocol; the runtime only ever
/// polls them, asks them to reconnect, and queries their stream definitions.
#[async_trait]
pub trait Device: Send + Sync {
    /// Read the hardware and return the latest values. A failure is logged
    /// by the scheduler and treated as zero samples for the cycle.
    async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError>;

    /// Re-establish the hardware connection. Called by the watchdog when the
    /// device goes stale; must be idempotent and safe to call at any time.
    async fn reconnect(&self);

    /// Streams this device reports. Queried once, after composition is
    /// complete, so hubs can enumerate definitions across their children.
    fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition>;

    /// Polling cadence when the descriptor does not override it. `None`
    /// means the device is never polled directly (push-only).
    fn default_polling_interval(&self) -> Option<Duration> {
        None
    }

    /// How long the watchdog waits before declaring the device stale.
    /// `None` disables the check (hubs, whose children carry the cadence).
    fn expected_update_interval(&self) -> Option<Duration> {
        Some(DEFAULT_EXPECTED_UPDATE_INTERVAL)
    }

    /// Drive an actuator output. Only relays implement this.
    async fn set_state(&self, _state: i64) -> anyhow::Result<()> {
        Err(anyhow!("device does not support state control"))
    }

    /// The hub capability, for devices that own children.
    fn as_hub(&self) -> Option<&dyn Hub> {
        None
    }
}

/// Capability superset for devices that own child devices.
pub trait Hub: Send + Sync {
    /// Attach a child. A child whose `parent_id` does not match this hub's
    /// id is rejected with a log line, not a panic.
    fn add_child(&self, child: Arc<DeviceHandle>);

    /// Invoked once, after every child is attached, so the hub can start
    /// its own listener against a stable object graph.
    fn composition_complete(&self, cancel: CancellationToken);
}

/// A composed device: descriptor identity, the driver, and the shared
/// last-update instant written by the owning poll task (or a hub listener)
/// and read by the watchdog.
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: String,
    pub facility_id: i64,
    pub parent_id: Option<DeviceId>,
    pub polling_interval: Option<Duration>,
    pub expected_update_interval: Option<Duration>,
    pub verbosity: u8,
    pub driver: Arc<dyn Device>,
    last_update: Mutex<Instant>,
}

impl DeviceHandle {
    /// Builds the handle from a descriptor, taking driver defaults for the
    /// intervals and applying the descriptor's polling override if present.
    pub fn new(config: &DeviceConfig, driver: Arc<dyn Device>) -> Self {
        let polling_interval = config
            .polling_interval_override()
            .map(Duration::from_secs_f64)
            .or_else(|| driver.default_polling_interval());
        Self {
            id: config.id,
            name: config.name.clone(),
            facility_id: config.facility_id,
            parent_id: config.parent_id,
            polling_interval,
            expected_update_interval: driver.expected_update_interval(),
            verbosity: config.verbosity,
            driver,
            // Unknown at startup; assume fresh so the watchdog grants a full
            // interval before the first reconnect.
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Record that fresh data arrived for this device.
    pub fn touch(&self) {
        *self.last_update.lock().unwrap() = Instant::now();
    }

    pub fn since_last_update(&self) -> Duration {
        self.last_update.lock().unwrap().elapsed()
    }

    /// Stale when data is expected on a cadence and none has arrived within it.
    pub fn is_stale(&self) -> bool {
        match self.expected_update_interval {
            Some(expected) => self.since_last_update() > expected,
            None => false,
        }
    }
}
