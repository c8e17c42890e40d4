//! Polling scheduler: one independent task per pollable device.
//!
//! Each task loops poll → record → sleep, with the interval measured from
//! the end of the poll so a slow device never overlaps with itself. A poll
//! failure is logged against the device and yields zero samples for the
//! cycle; it never stops the loop or touches any other device.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::DeviceHandle;
use crate::registry::DeviceRegistry;
use crate::store::{LastValueTable, UploadBuffer};

pub async fn polling_loop(
    handle: Arc<DeviceHandle>,
    values: Arc<LastValueTable>,
    buffer: Arc<UploadBuffer>,
    cancel: CancellationToken,
) {
    let Some(interval) = handle.polling_interval else {
        return;
    };
    debug!(device = %handle.name, id = handle.id, interval = ?interval, "polling task started");
    loop {
        match handle.driver.poll().await {
            Ok(polled) if !polled.is_empty() => {
                values.update(&polled);
                buffer.append(&polled, Utc::now());
                handle.touch();
                debug!(device = %handle.name, count = polled.len(), "poll complete");
            }
            Ok(_) => {
                // Nothing accumulated this cycle (common for hubs).
            }
            Err(e) => {
                warn!(device = %handle.name, id = handle.id, error = %e, "poll failed");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(device = %handle.name, "polling task stopped");
}

/// Launch a polling task for every device that has an interval. Push-only
/// devices are registered but never scheduled. Returns the task handles.
pub fn spawn_polling_tasks(
    registry: &DeviceRegistry,
    values: &Arc<LastValueTable>,
    buffer: &Arc<UploadBuffer>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for handle in registry.iter() {
        if handle.polling_interval.is_none() {
            continue;
        }
        tasks.push(tokio::spawn(polling_loop(
            handle.clone(),
            values.clone(),
            buffer.clone(),
            cancel.clone(),
        )));
    }
    tasks
}
