//! Bundled drivers and the driver selection table.
//!
//! Real hardware protocol decoders live behind the [`Device`] contract and
//! are out of scope here; the bundled set is the simulation/bench drivers
//! used for commissioning and tests.

use std::sync::Arc;

use anyhow::Result;

use crate::device::Device;
use server_api::DeviceConfig;

mod hub;
mod mock;
mod relay;

pub use hub::{PushSensor, SimHub};
pub use mock::MockSensor;
pub use relay::SimRelay;

type Factory = fn(&DeviceConfig, bool) -> Result<Arc<dyn Device>>;

/// One row of the selection table. A `None` field matches anything.
pub struct DriverRule {
    pub kind: Option<&'static str>,
    pub make: Option<&'static str>,
    pub model: Option<&'static str>,
    pub protocol: Option<&'static str>,
    build: Factory,
}

impl DriverRule {
    fn matches(&self, config: &DeviceConfig) -> bool {
        fn field(expected: Option<&str>, actual: Option<&str>) -> bool {
            match expected {
                Some(expected) => actual == Some(expected),
                None => true,
            }
        }
        field(self.kind, Some(config.kind.as_str()))
            && field(self.make, config.make.as_deref())
            && field(self.model, config.model.as_deref())
            && field(self.protocol, config.protocol.as_deref())
    }
}

/// Driver selection table, evaluated top to bottom; the first matching rule
/// wins. Specific rules precede catch-alls, so keep new entries ordered.
pub const DRIVER_RULES: &[DriverRule] = &[
    DriverRule {
        kind: Some("sensor"),
        make: Some("Mock"),
        model: None,
        protocol: None,
        build: mock::build,
    },
    DriverRule {
        kind: Some("relay"),
        make: None,
        model: None,
        protocol: None,
        build: relay::build,
    },
    DriverRule {
        kind: Some("sensor"),
        make: Some("Sim"),
        model: None,
        protocol: None,
        build: hub::build_sensor,
    },
    DriverRule {
        kind: Some("hub"),
        make: None,
        model: None,
        protocol: None,
        build: hub::build_hub,
    },
];

/// Instantiate a driver for the descriptor, or `None` when no rule matches
/// (the composition builder reports and skips it).
pub fn build_driver(config: &DeviceConfig, local_sim: bool) -> Option<Result<Arc<dyn Device>>> {
    DRIVER_RULES
        .iter()
        .find(|rule| rule.matches(config))
        .map(|rule| (rule.build)(config, local_sim))
}
