//! Simulated relay: the in-memory equivalent of a single-channel web relay.
//!
//! Reports its output state on the `relay-1` series and accepts `set_state`
//! from control automations. The hardware-backed driver this stands in for
//! reads and writes the relay over its HTTP state endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::device::{Device, DeviceId, PollError, TimeseriesKey};
use server_api::{DeviceConfig, TimeseriesDefinition};

const SERIES: &str = "relay-1";

pub struct SimRelay {
    id: DeviceId,
    name: String,
    state: AtomicI64,
}

pub(super) fn build(config: &DeviceConfig, _local_sim: bool) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(SimRelay::new(config)))
}

impl SimRelay {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            state: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> i64 {
        self.state.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Device for SimRelay {
    async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
        Ok(HashMap::from([(
            (self.id, SERIES.to_string()),
            self.state() as f64,
        )]))
    }

    async fn reconnect(&self) {}

    fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
        vec![TimeseriesDefinition {
            device_id: self.id,
            timeseries_name: SERIES.to_string(),
            data_type: "Numeric".to_string(),
            decimal_places: 0,
        }]
    }

    fn default_polling_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    async fn set_state(&self, state: i64) -> Result<()> {
        info!(relay = %self.name, state, "relay output set");
        self.state.store(state, Ordering::Relaxed);
        Ok(())
    }
}
