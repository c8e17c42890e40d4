//! Health watchdog: device staleness and upload-pipeline health.
//!
//! After an initial grace period the watchdog sweeps every 30 seconds. A
//! device whose data is overdue gets a throttled alert and a reconnect
//! request to its driver; when data resumes, the alert label is cleared so
//! the next outage alerts immediately. The upload pipeline itself is
//! watched the same way under a single per-facility label.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alerts::AlertSink;
use crate::registry::DeviceRegistry;
use crate::sync::UploadTracker;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Extra slack on top of the send interval before the first sweep, so a
/// slow first upload cycle does not alert.
const GRACE_SLACK: Duration = Duration::from_secs(30);

/// Label for upload-health alerts; one per facility.
const UPLOAD_HEALTH_LABEL: &str = "send_to_server";

pub struct Watchdog {
    registry: Arc<DeviceRegistry>,
    tracker: Arc<UploadTracker>,
    alerts: Arc<dyn AlertSink>,
    send_interval: Duration,
    /// Facility receiving upload-health alerts (the first configured one).
    primary_facility: i64,
}

impl Watchdog {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        tracker: Arc<UploadTracker>,
        alerts: Arc<dyn AlertSink>,
        send_interval: Duration,
        primary_facility: i64,
    ) -> Self {
        Self {
            registry,
            tracker,
            alerts,
            send_interval,
            primary_facility,
        }
    }

    /// Uploads are unhealthy after three missed cycles.
    fn upload_overdue(&self) -> bool {
        self.tracker.since_last_success() > self.send_interval * 3 + GRACE_SLACK
    }

    async fn sweep(&self) {
        for handle in self.registry.iter() {
            if handle.expected_update_interval.is_none() {
                continue;
            }
            let label = format!("{} watchdog", handle.id);
            if handle.is_stale() {
                info!(
                    device = %handle.name,
                    id = handle.id,
                    overdue = ?handle.since_last_update(),
                    "device data overdue; requesting reconnect"
                );
                self.alerts
                    .send(
                        handle.facility_id,
                        &label,
                        &format!("no recent update for device {}", handle.name),
                        &format!("no recent update for device {}", handle.name),
                        true,
                    )
                    .await;
                handle.driver.reconnect().await;
            } else {
                self.alerts.clear(handle.facility_id, &label).await;
            }
        }

        if self.upload_overdue() {
            self.alerts
                .send(
                    self.primary_facility,
                    UPLOAD_HEALTH_LABEL,
                    "gateway is unable to upload data",
                    &format!(
                        "no successful upload for {:?}",
                        self.tracker.since_last_success()
                    ),
                    true,
                )
                .await;
        } else {
            self.alerts
                .clear(self.primary_facility, UPLOAD_HEALTH_LABEL)
                .await;
        }
    }

    /// Perpetual watchdog loop: grace period, then periodic sweeps.
    pub async fn run(self, cancel: CancellationToken) {
        let grace = self.send_interval + GRACE_SLACK;
        debug!(grace = ?grace, "watchdog started");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
        loop {
            self.sweep().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
        }
        debug!("watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::alerts::FakeAlertSink;
    use crate::device::{Device, DeviceHandle, PollError, TimeseriesKey};
    use server_api::{DeviceConfig, TimeseriesDefinition};

    /// Always reports a tiny expected interval so it goes stale immediately.
    struct StaleSensor {
        reconnects: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Device for StaleSensor {
        async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
            Ok(HashMap::new())
        }
        async fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
            Vec::new()
        }
        fn expected_update_interval(&self) -> Option<Duration> {
            Some(Duration::ZERO)
        }
    }

    fn watchdog_with(driver: Arc<dyn Device>, alerts: Arc<FakeAlertSink>) -> Watchdog {
        let cfg: DeviceConfig = serde_json::from_value(serde_json::json!({
            "id": 7, "name": "cold room", "type": "sensor", "facilityId": 84
        }))
        .unwrap();
        let handle = Arc::new(DeviceHandle::new(&cfg, driver));
        let registry = Arc::new(DeviceRegistry::with_devices(vec![handle]));
        Watchdog::new(
            registry,
            Arc::new(UploadTracker::new()),
            alerts,
            Duration::from_secs(120),
            84,
        )
    }

    #[tokio::test]
    async fn stale_device_alerts_and_reconnects() {
        let reconnects = Arc::new(AtomicU32::new(0));
        let alerts = Arc::new(FakeAlertSink::new());
        let watchdog = watchdog_with(
            Arc::new(StaleSensor {
                reconnects: reconnects.clone(),
            }),
            alerts.clone(),
        );

        watchdog.sweep().await;
        assert_eq!(alerts.labels(), vec!["7 watchdog".to_string()]);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        // Still stale on the next sweep: reconnect retried, alert throttled.
        watchdog.sweep().await;
        assert_eq!(alerts.sent_count(), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    /// Data always fresh; never alerts, and clears any prior record.
    struct FreshSensor;

    #[async_trait]
    impl Device for FreshSensor {
        async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
            Ok(HashMap::new())
        }
        async fn reconnect(&self) {}
        fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
            Vec::new()
        }
        fn expected_update_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(3600))
        }
    }

    #[tokio::test]
    async fn healthy_device_clears_its_label() {
        let alerts = Arc::new(FakeAlertSink::new());
        let watchdog = watchdog_with(Arc::new(FreshSensor), alerts.clone());

        // Simulate an earlier stale episode, then a healthy sweep.
        alerts.send(84, "7 watchdog", "s", "b", true).await;
        watchdog.sweep().await;

        // The label was cleared: a new stale episode would alert again
        // without waiting out the cooldown.
        alerts.send(84, "7 watchdog", "s", "b", true).await;
        assert_eq!(alerts.sent_count(), 2);
    }

    #[tokio::test]
    async fn push_only_devices_without_expectation_are_ignored() {
        struct NoExpectation;
        #[async_trait]
        impl Device for NoExpectation {
            async fn poll(&self) -> Result<HashMap<TimeseriesKey, f64>, PollError> {
                Ok(HashMap::new())
            }
            async fn reconnect(&self) {}
            fn timeseries_definitions(&self) -> Vec<TimeseriesDefinition> {
                Vec::new()
            }
            fn expected_update_interval(&self) -> Option<Duration> {
                None
            }
        }
        let alerts = Arc::new(FakeAlertSink::new());
        let watchdog = watchdog_with(Arc::new(NoExpectation), alerts.clone());
        watchdog.sweep().await;
        assert_eq!(alerts.sent_count(), 0);
    }

    #[tokio::test]
    async fn upload_outage_alerts_on_primary_facility() {
        let alerts = Arc::new(FakeAlertSink::new());
        let registry = Arc::new(DeviceRegistry::with_devices(Vec::new()));
        let tracker = Arc::new(UploadTracker::new());
        // Zero send interval makes three missed cycles equal the slack
        // window alone.
        let watchdog = Watchdog::new(
            registry,
            tracker.clone(),
            alerts.clone(),
            Duration::ZERO,
            84,
        );
        tracker.backdate(Duration::from_secs(60));

        watchdog.sweep().await;
        assert_eq!(alerts.labels(), vec![UPLOAD_HEALTH_LABEL.to_string()]);

        tracker.mark_success();
        watchdog.sweep().await;
        // Healthy again: label cleared, a later outage alerts immediately.
        assert_eq!(alerts.sent_count(), 1);
    }
}
