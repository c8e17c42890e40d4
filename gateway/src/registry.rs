//! Device registry and composition builder.
//!
//! Builds the device graph from descriptors in three passes: instantiate
//! drivers, attach children to hubs, then fire the composition-complete
//! hook so hubs can start their listeners against a stable graph.
//! Configuration problems are reported and the affected entity omitted;
//! they never abort startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, DeviceId, TimeseriesKey};
use crate::drivers;
use server_api::{DeviceConfig, TimeseriesDefinition};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<DeviceHandle>>,
    by_id: HashMap<DeviceId, Arc<DeviceHandle>>,
}

impl DeviceRegistry {
    /// Compose the full device graph. `local_sim` overrides every driver
    /// into simulation; `cancel` is handed to hub listeners so they stop
    /// with the rest of the runtime.
    pub fn build(
        configs: &[DeviceConfig],
        local_sim: bool,
        cancel: &CancellationToken,
    ) -> Self {
        let mut registry = Self::default();
        info!(descriptors = configs.len(), "composing devices");

        // Pass 1: instantiate drivers. Sibling order is irrelevant.
        for config in configs {
            if !config.enabled() {
                info!(device = %config.name, kind = %config.kind, "device disabled; skipping");
                continue;
            }
            let sim = local_sim || config.local_sim();
            let Some(built) = drivers::build_driver(config, sim) else {
                warn!(
                    device = %config.name,
                    kind = %config.kind,
                    make = config.make.as_deref().unwrap_or(""),
                    model = config.model.as_deref().unwrap_or(""),
                    "device not recognized; skipping"
                );
                continue;
            };
            let driver = match built {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(device = %config.name, error = %e, "driver construction failed; skipping");
                    continue;
                }
            };
            if registry.by_id.contains_key(&config.id) {
                warn!(device = %config.name, id = config.id, "duplicate device id; skipping");
                continue;
            }
            let handle = Arc::new(DeviceHandle::new(config, driver));
            if let Some(interval) = handle.polling_interval {
                debug!(device = %handle.name, interval = ?interval, "device registered");
            }
            registry.by_id.insert(handle.id, handle.clone());
            registry.devices.push(handle);
        }

        // Pass 2: attach children to their hubs. A missing hub or a parent
        // without the hub capability leaves the child unattached; it still
        // polls independently if it has its own interval.
        for handle in &registry.devices {
            let Some(parent_id) = handle.parent_id else {
                continue;
            };
            match registry.by_id.get(&parent_id) {
                Some(parent) => match parent.driver.as_hub() {
                    Some(hub) => hub.add_child(handle.clone()),
                    None => warn!(
                        device = %handle.name,
                        parent_id,
                        "parent device is not a hub; child left unattached"
                    ),
                },
                None => warn!(
                    device = %handle.name,
                    parent_id,
                    "no device with the parent id exists; child left unattached"
                ),
            }
        }

        // Pass 3: all attachments done; hubs may start listeners now.
        for handle in &registry.devices {
            if let Some(hub) = handle.driver.as_hub() {
                hub.composition_complete(cancel.clone());
            }
        }

        info!(devices = registry.devices.len(), "composition complete");
        registry
    }

    /// Assemble a registry from already-built handles. Used by tests that
    /// need hand-crafted drivers; production code goes through [`build`].
    ///
    /// [`build`]: DeviceRegistry::build
    pub fn with_devices(devices: Vec<Arc<DeviceHandle>>) -> Self {
        let by_id = devices
            .iter()
            .map(|handle| (handle.id, handle.clone()))
            .collect();
        Self { devices, by_id }
    }

    pub fn find(&self, id: DeviceId) -> Option<Arc<DeviceHandle>> {
        self.by_id.get(&id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceHandle>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Definitions across every device, hubs included. Collected once, only
    /// after composition, so hubs can enumerate children if they need to.
    pub fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
        self.devices
            .iter()
            .flat_map(|handle| handle.driver.timeseries_definitions())
            .collect()
    }

    /// Per-stream decimal places for the upload buffer's rounding.
    pub fn decimal_places(&self) -> HashMap<TimeseriesKey, i32> {
        self.timeseries_definitions()
            .into_iter()
            .map(|def| {
                (
                    (def.device_id, def.timeseries_name),
                    def.decimal_places,
                )
            })
            .collect()
    }
}
