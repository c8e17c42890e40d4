//! Alert delivery with duplicate suppression.
//!
//! Alerts are labelled per `(facility, label)`; a label that alerted within
//! the cooldown window is suppressed until the condition clears. Monitors
//! that alert on transitions pass `throttle = false` and bypass the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use server_api::ServerClient;

pub const ALERT_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Records when each `(facility, label)` last alerted.
pub struct AlertThrottle {
    sent: Mutex<HashMap<(i64, String), Instant>>,
    cooldown: Duration,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::with_cooldown(ALERT_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            sent: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// True when no alert for this label was sent within the cooldown.
    pub fn should_send(&self, facility_id: i64, label: &str) -> bool {
        let sent = self.sent.lock().unwrap();
        match sent.get(&(facility_id, label.to_string())) {
            Some(last) => last.elapsed() >= self.cooldown,
            None => true,
        }
    }

    /// Record a successful send.
    pub fn record(&self, facility_id: i64, label: &str) {
        self.sent
            .lock()
            .unwrap()
            .insert((facility_id, label.to_string()), Instant::now());
    }

    /// Forget the label so the next qualifying condition alerts immediately.
    /// Called when the underlying condition returns to normal.
    pub fn clear(&self, facility_id: i64, label: &str) {
        self.sent
            .lock()
            .unwrap()
            .remove(&(facility_id, label.to_string()));
    }
}

impl Default for AlertThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery seam: the production sink posts to the server, the fake records
/// calls for tests and local simulation.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Send an alert unless the label is inside its cooldown window
    /// (`throttle = true`). Delivery failures are logged, never propagated;
    /// an undelivered throttled alert is not recorded, so it retries on the
    /// next evaluation.
    async fn send(&self, facility_id: i64, label: &str, subject: &str, body: &str, throttle: bool);

    /// Clear a label's cooldown record.
    async fn clear(&self, facility_id: i64, label: &str);
}

pub struct ServerAlertSink {
    client: Arc<ServerClient>,
    throttle: AlertThrottle,
}

impl ServerAlertSink {
    pub fn new(client: Arc<ServerClient>) -> Self {
        Self {
            client,
            throttle: AlertThrottle::new(),
        }
    }

    pub fn with_throttle(client: Arc<ServerClient>, throttle: AlertThrottle) -> Self {
        Self { client, throttle }
    }
}

#[async_trait]
impl AlertSink for ServerAlertSink {
    async fn send(&self, facility_id: i64, label: &str, subject: &str, body: &str, throttle: bool) {
        if throttle && !self.throttle.should_send(facility_id, label) {
            debug!(facility = facility_id, label, "alert suppressed by cooldown");
            return;
        }
        info!(facility = facility_id, label, subject, "sending alert");
        match self.client.send_alert(facility_id, subject, body).await {
            Ok(()) => {
                if throttle {
                    self.throttle.record(facility_id, label);
                }
            }
            Err(e) => {
                warn!(facility = facility_id, label, error = %e, "alert delivery failed");
            }
        }
    }

    async fn clear(&self, facility_id: i64, label: &str) {
        self.throttle.clear(facility_id, label);
    }
}

/// In-memory sink that records calls; used by tests and local simulation.
#[derive(Default)]
pub struct FakeAlertSink {
    throttle: AlertThrottle,
    pub sent: Mutex<Vec<SentAlert>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAlert {
    pub facility_id: i64,
    pub label: String,
    pub subject: String,
}

impl FakeAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|a| a.label.clone()).collect()
    }
}

#[async_trait]
impl AlertSink for FakeAlertSink {
    async fn send(&self, facility_id: i64, label: &str, subject: &str, body: &str, throttle: bool) {
        if throttle && !self.throttle.should_send(facility_id, label) {
            return;
        }
        info!(facility = facility_id, label, subject, body, "alert (local)");
        self.sent.lock().unwrap().push(SentAlert {
            facility_id,
            label: label.to_string(),
            subject: subject.to_string(),
        });
        if throttle {
            self.throttle.record(facility_id, label);
        }
    }

    async fn clear(&self, facility_id: i64, label: &str) {
        self.throttle.clear(facility_id, label);
    }
}
