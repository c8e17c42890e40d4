//! Mock sensor: reports two numeric series from descriptor settings.
//!
//! Useful on a bench with no hardware attached; the base values come from
//! the descriptor's `settings` and get a small deterministic wobble so the
//! series are visibly alive downstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::device::{Device, DeviceId, PollError, TimeseriesKey};
use server_api::{DeviceConfig, TimeseriesDefinition};

const SERIES: [&str; 2] = ["value_a", "value_b"];

pub struct MockSensor {
    id: DeviceId,
    base_a: f64,
    base_b: f64,
    tick: AtomicU64,
}

pub(super) fn build(config: &DeviceConfig, _local_sim: bool) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(MockSensor::new(config)))
}

impl MockSensor {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            id: config.id,
            base_a: config.numeric_setting("value_a").unwrap_or(1.0),
            base_b: config.numeric_setting("value_b").unwrap_or(2.0),
            tick: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Device for MockSensor {
    async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let wobble = (tick % 5) as f64 * 0.01;
        Ok(HashMap::from([
            ((self.id, SERIES[0].to_string()), self.base_a + wobble),
            ((self.id, SERIES[1].to_string()), self.base_b + wobble),
        ]))
    }

    async fn reconnect(&self) {}

    fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
        SERIES
            .iter()
            .map(|series| TimeseriesDefinition {
                device_id: self.id,
                timeseries_name: (*series).to_string(),
                data_type: "Numeric".to_string(),
                decimal_places: 2,
            })
            .collect()
    }

    fn default_polling_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }
}
