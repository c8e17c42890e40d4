//! Automation engine: standing rules evaluated against the latest values.
//!
//! Every automation is a small state machine keyed on its previous
//! observation, so it reacts to *transitions* rather than levels: a sensor
//! that stays in alarm sends one alert on entry, not one per cycle.
//! Automations never touch hardware directly: they read the shared
//! last-value table and, for control rules, actuate through the registry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::registry::DeviceRegistry;
use crate::store::LastValueTable;
use server_api::AutomationConfig;

/// Cadence for every evaluation loop.
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AutomationConfigError {
    #[error("automation type not found: {0}")]
    UnknownType(String),
    #[error("automation {name}: missing required field {field}")]
    MissingField { name: String, field: &'static str },
}

/// A configured automation instance with its edge-detection state.
pub enum Automation {
    AlarmMonitor(AlarmMonitor),
    EventMonitor(EventMonitor),
    SensorBounds(SensorBoundsAlert),
    GeneratorControl(GeneratorControl),
}

impl Automation {
    /// Build from a descriptor. Unknown types and missing fields are
    /// configuration errors: reported by the caller, instance omitted.
    pub fn from_config(config: &AutomationConfig) -> Result<Self, AutomationConfigError> {
        let missing = |field| AutomationConfigError::MissingField {
            name: config.name.clone(),
            field,
        };
        match config.kind.as_str() {
            "AlarmMonitor" => Ok(Self::AlarmMonitor(AlarmMonitor {
                base: MonitorBase::from_config(config),
                prev_state: 0.0,
            })),
            "EventMonitor" => Ok(Self::EventMonitor(EventMonitor {
                base: MonitorBase::from_config(config),
                prev_state: 0.0,
            })),
            "SensorBoundsAlert" => Ok(Self::SensorBounds(SensorBoundsAlert {
                base: MonitorBase::from_config(config),
                lower: config.lower_threshold,
                upper: config.upper_threshold,
                prev_value: None,
            })),
            "GeneratorControl" => {
                let settings = config.settings.as_ref().ok_or_else(|| missing("settings"))?;
                Ok(Self::GeneratorControl(GeneratorControl {
                    base: MonitorBase::from_config(config),
                    lower: config.lower_threshold.ok_or_else(|| missing("lowerThreshold"))?,
                    upper: config.upper_threshold.ok_or_else(|| missing("upperThreshold"))?,
                    control_device_id: settings.control_device_id,
                    control_series: settings.control_timeseries_name.clone(),
                    test_output_state: settings.test_output_state,
                }))
            }
            other => Err(AutomationConfigError::UnknownType(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn facility_id(&self) -> i64 {
        self.base().facility_id
    }

    fn base(&self) -> &MonitorBase {
        match self {
            Self::AlarmMonitor(a) => &a.base,
            Self::EventMonitor(a) => &a.base,
            Self::SensorBounds(a) => &a.base,
            Self::GeneratorControl(a) => &a.base,
        }
    }

    /// One evaluation cycle. A missing input (no value observed yet for the
    /// monitored stream) is not an error; the automation simply waits.
    pub async fn evaluate(
        &mut self,
        values: &LastValueTable,
        registry: &DeviceRegistry,
        alerts: &dyn AlertSink,
    ) -> anyhow::Result<()> {
        match self {
            Self::AlarmMonitor(a) => a.evaluate(values, alerts).await,
            Self::EventMonitor(a) => a.evaluate(values, alerts).await,
            Self::SensorBounds(a) => a.evaluate(values, alerts).await,
            Self::GeneratorControl(a) => a.evaluate(values, registry).await,
        }
    }
}

/// Fields common to every variant.
struct MonitorBase {
    facility_id: i64,
    name: String,
    device_id: i64,
    series: String,
    verbosity: u8,
}

impl MonitorBase {
    fn from_config(config: &AutomationConfig) -> Self {
        Self {
            facility_id: config.facility_id,
            name: config.name.clone(),
            device_id: config.device_id,
            series: config.timeseries_name.clone(),
            verbosity: config.verbosity,
        }
    }
}

/// Alerts once on each transition into a nonzero state.
pub struct AlarmMonitor {
    base: MonitorBase,
    // Zero initially so a device already in alarm at startup alerts.
    prev_state: f64,
}

impl AlarmMonitor {
    async fn evaluate(&mut self, values: &LastValueTable, alerts: &dyn AlertSink) -> anyhow::Result<()> {
        let Some(state) = values.get(self.base.device_id, &self.base.series) else {
            return Ok(());
        };
        if state != 0.0 && self.prev_state == 0.0 {
            let message = self.base.name.clone();
            alerts
                .send(self.base.facility_id, &message, &message, &message, false)
                .await;
        }
        self.prev_state = state;
        Ok(())
    }
}

/// Alerts on every change of the monitored value, not only alarm entry.
pub struct EventMonitor {
    base: MonitorBase,
    prev_state: f64,
}

impl EventMonitor {
    async fn evaluate(&mut self, values: &LastValueTable, alerts: &dyn AlertSink) -> anyhow::Result<()> {
        let Some(state) = values.get(self.base.device_id, &self.base.series) else {
            return Ok(());
        };
        if state != self.prev_state {
            let message = self.base.name.clone();
            alerts
                .send(self.base.facility_id, &message, &message, &message, false)
                .await;
        }
        self.prev_state = state;
        Ok(())
    }
}

/// Alerts when the value crosses outside an optional lower/upper bound.
///
/// Repeat alerts while the value stays beyond a threshold are suppressed by
/// comparing against the previous *value*, not a flag, so re-crossing
/// re-alerts.
pub struct SensorBoundsAlert {
    base: MonitorBase,
    lower: Option<f64>,
    upper: Option<f64>,
    prev_value: Option<f64>,
}

impl SensorBoundsAlert {
    async fn evaluate(&mut self, values: &LastValueTable, alerts: &dyn AlertSink) -> anyhow::Result<()> {
        let Some(value) = values.get(self.base.device_id, &self.base.series) else {
            return Ok(());
        };
        if self.base.verbosity >= 2 {
            debug!(automation = %self.base.name, value, "bounds check");
        }
        if let Some(lower) = self.lower {
            let was_at_or_above = self.prev_value.map_or(true, |prev| prev >= lower);
            if value < lower && was_at_or_above {
                let message = format!(
                    "{} ({:.2}) below lower threshold ({:.2})",
                    self.base.name, value, lower
                );
                let label = format!("{} too low", self.base.device_id);
                alerts
                    .send(self.base.facility_id, &label, &message, &message, true)
                    .await;
            }
        }
        if let Some(upper) = self.upper {
            let was_at_or_below = self.prev_value.map_or(true, |prev| prev <= upper);
            if value > upper && was_at_or_below {
                let message = format!(
                    "{} ({:.2}) above upper threshold ({:.2})",
                    self.base.name, value, upper
                );
                let label = format!("{} too high", self.base.device_id);
                alerts
                    .send(self.base.facility_id, &label, &message, &message, true)
                    .await;
            }
        }
        self.prev_value = Some(value);
        Ok(())
    }
}

/// Hysteresis control: starts the generator relay when the battery's state
/// of charge drops below the lower threshold and stops it once charged past
/// the upper one.
pub struct GeneratorControl {
    base: MonitorBase,
    lower: f64,
    upper: f64,
    control_device_id: i64,
    control_series: String,
    /// Forces the relay to this state whenever it differs; commissioning aid
    /// that bypasses the threshold logic entirely.
    test_output_state: Option<i64>,
}

impl GeneratorControl {
    async fn evaluate(&mut self, values: &LastValueTable, registry: &DeviceRegistry) -> anyhow::Result<()> {
        let soc = values.get(self.base.device_id, &self.base.series);
        let relay_state = values.get(self.control_device_id, &self.control_series);
        if self.base.verbosity >= 1 {
            debug!(automation = %self.base.name, soc = ?soc, relay = ?relay_state, "control check");
        }

        if let (Some(test_state), Some(relay)) = (self.test_output_state, relay_state) {
            if test_state != relay as i64 {
                info!(automation = %self.base.name, state = test_state, "test override; forcing relay");
                self.set_relay(registry, test_state).await?;
            }
        }

        let (Some(soc), Some(relay_state)) = (soc, relay_state) else {
            return Ok(());
        };
        let relay_state = relay_state as i64;
        if soc < self.lower && relay_state == 0 {
            info!(
                automation = %self.base.name,
                soc, threshold = self.lower,
                "state of charge below lower threshold; starting generator"
            );
            self.set_relay(registry, 1).await?;
        }
        if soc > self.upper && relay_state == 1 {
            info!(
                automation = %self.base.name,
                soc, threshold = self.upper,
                "state of charge above upper threshold; stopping generator"
            );
            self.set_relay(registry, 0).await?;
        }
        Ok(())
    }

    async fn set_relay(&self, registry: &DeviceRegistry, state: i64) -> anyhow::Result<()> {
        let Some(device) = registry.find(self.control_device_id) else {
            anyhow::bail!(
                "control device {} not found in registry",
                self.control_device_id
            );
        };
        device.driver.set_state(state).await
    }
}

/// Perpetual evaluation loop for one automation. Failures are logged with
/// the automation's identity and never stop the loop.
pub async fn automation_loop(
    mut automation: Automation,
    values: Arc<LastValueTable>,
    registry: Arc<DeviceRegistry>,
    alerts: Arc<dyn AlertSink>,
    cancel: CancellationToken,
) {
    debug!(automation = %automation.name(), "evaluation task started");
    loop {
        if let Err(e) = automation.evaluate(&values, &registry, alerts.as_ref()).await {
            warn!(
                automation = %automation.name(),
                facility = automation.facility_id(),
                error = %e,
                "automation evaluation failed"
            );
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(EVALUATION_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::FakeAlertSink;
    use server_api::DeviceConfig;

    fn automation(json: serde_json::Value) -> Automation {
        let config: AutomationConfig = serde_json::from_value(json).unwrap();
        Automation::from_config(&config).unwrap()
    }

    fn empty_registry() -> DeviceRegistry {
        DeviceRegistry::build(&[], true, &CancellationToken::new())
    }

    async fn run(
        automation: &mut Automation,
        values: &LastValueTable,
        registry: &DeviceRegistry,
        alerts: &FakeAlertSink,
        series_value: f64,
    ) {
        values.set(3, "input", series_value);
        automation.evaluate(values, registry, alerts).await.unwrap();
    }

    #[tokio::test]
    async fn alarm_monitor_alerts_once_per_transition() {
        let mut alarm = automation(serde_json::json!({
            "facilityId": 84, "name": "Freezer Alarm", "type": "AlarmMonitor",
            "deviceId": 3, "timeseriesName": "input"
        }));
        let values = LastValueTable::new();
        let registry = empty_registry();
        let alerts = FakeAlertSink::new();

        for state in [0.0, 1.0, 1.0, 1.0] {
            run(&mut alarm, &values, &registry, &alerts, state).await;
        }
        assert_eq!(alerts.sent_count(), 1, "one alert on entry, none while held");

        // Back to normal and into alarm again: a second alert.
        for state in [0.0, 1.0] {
            run(&mut alarm, &values, &registry, &alerts, state).await;
        }
        assert_eq!(alerts.sent_count(), 2);
    }

    #[tokio::test]
    async fn alarm_monitor_waits_for_first_reading() {
        let mut alarm = automation(serde_json::json!({
            "facilityId": 84, "name": "Alarm", "type": "AlarmMonitor",
            "deviceId": 3, "timeseriesName": "input"
        }));
        let values = LastValueTable::new();
        let alerts = FakeAlertSink::new();
        // No value recorded yet: evaluation is a no-op.
        alarm.evaluate(&values, &empty_registry(), &alerts).await.unwrap();
        assert_eq!(alerts.sent_count(), 0);
    }

    #[tokio::test]
    async fn event_monitor_alerts_on_every_change() {
        let mut monitor = automation(serde_json::json!({
            "facilityId": 84, "name": "Door", "type": "EventMonitor",
            "deviceId": 3, "timeseriesName": "input"
        }));
        let values = LastValueTable::new();
        let registry = empty_registry();
        let alerts = FakeAlertSink::new();

        for state in [2.0, 2.0, 3.0, 0.0] {
            run(&mut monitor, &values, &registry, &alerts, state).await;
        }
        // 0→2, 2→3 and 3→0 each alert; the repeat does not.
        assert_eq!(alerts.sent_count(), 3);
    }

    #[tokio::test]
    async fn bounds_alert_fires_once_per_crossing() {
        let mut bounds = automation(serde_json::json!({
            "facilityId": 84, "name": "Soil Moisture", "type": "SensorBoundsAlert",
            "deviceId": 3, "timeseriesName": "input",
            "lowerThreshold": 10.0, "upperThreshold": 90.0
        }));
        let values = LastValueTable::new();
        let registry = empty_registry();
        let alerts = FakeAlertSink::new();

        for value in [12.0, 9.0, 8.0, 11.0] {
            run(&mut bounds, &values, &registry, &alerts, value).await;
        }
        // Exactly one "too low" (on the 9), no "too high".
        assert_eq!(alerts.labels(), vec!["3 too low".to_string()]);
    }

    #[tokio::test]
    async fn bounds_alert_recrossing_realerts_after_clear() {
        let mut bounds = automation(serde_json::json!({
            "facilityId": 84, "name": "Temp", "type": "SensorBoundsAlert",
            "deviceId": 3, "timeseriesName": "input", "upperThreshold": 30.0
        }));
        let values = LastValueTable::new();
        let registry = empty_registry();
        let alerts = FakeAlertSink::new();

        for value in [25.0, 31.0, 32.0, 29.0, 31.0] {
            run(&mut bounds, &values, &registry, &alerts, value).await;
            // The condition clearing clears the throttle record, as the
            // watchdog does for its own labels.
            if value <= 30.0 {
                alerts.clear(84, "3 too high").await;
            }
        }
        assert_eq!(alerts.sent_count(), 2, "re-crossing alerts again");
    }

    fn generator_setup() -> (Automation, LastValueTable, DeviceRegistry) {
        let control = automation(serde_json::json!({
            "facilityId": 84, "name": "Generator", "type": "GeneratorControl",
            "deviceId": 3, "timeseriesName": "input",
            "lowerThreshold": 20.0, "upperThreshold": 80.0,
            "settings": {"controlDeviceId": 9, "controlTimeseriesName": "relay-1"}
        }));
        let values = LastValueTable::new();
        let configs: Vec<DeviceConfig> = serde_json::from_value(serde_json::json!([
            {"id": 9, "name": "relay", "type": "relay", "facilityId": 84}
        ]))
        .unwrap();
        let registry = DeviceRegistry::build(&configs, true, &CancellationToken::new());
        (control, values, registry)
    }

    async fn relay_state(registry: &DeviceRegistry) -> f64 {
        let handle = registry.find(9).unwrap();
        let polled = handle.driver.poll().await.unwrap();
        polled[&(9, "relay-1".to_string())]
    }

    #[tokio::test]
    async fn generator_starts_when_charge_low_and_relay_off() {
        let (mut control, values, registry) = generator_setup();
        values.set(3, "input", 15.0);
        values.set(9, "relay-1", 0.0);
        control
            .evaluate(&values, &registry, &FakeAlertSink::new())
            .await
            .unwrap();
        assert_eq!(relay_state(&registry).await, 1.0);
    }

    #[tokio::test]
    async fn generator_stops_when_charged_and_relay_on() {
        let (mut control, values, registry) = generator_setup();
        registry.find(9).unwrap().driver.set_state(1).await.unwrap();
        values.set(3, "input", 85.0);
        values.set(9, "relay-1", 1.0);
        control
            .evaluate(&values, &registry, &FakeAlertSink::new())
            .await
            .unwrap();
        assert_eq!(relay_state(&registry).await, 0.0);
    }

    #[tokio::test]
    async fn generator_idle_in_hysteresis_band() {
        let (mut control, values, registry) = generator_setup();
        let alerts = FakeAlertSink::new();
        for relay in [0.0, 1.0] {
            registry
                .find(9)
                .unwrap()
                .driver
                .set_state(relay as i64)
                .await
                .unwrap();
            values.set(3, "input", 50.0);
            values.set(9, "relay-1", relay);
            control.evaluate(&values, &registry, &alerts).await.unwrap();
            assert_eq!(relay_state(&registry).await, relay, "no actuation at 50%");
        }
    }

    #[tokio::test]
    async fn generator_test_override_forces_relay() {
        let control_cfg: AutomationConfig = serde_json::from_value(serde_json::json!({
            "facilityId": 84, "name": "Generator", "type": "GeneratorControl",
            "deviceId": 3, "timeseriesName": "input",
            "lowerThreshold": 20.0, "upperThreshold": 80.0,
            "settings": {
                "controlDeviceId": 9,
                "controlTimeseriesName": "relay-1",
                "testOutputState": 1
            }
        }))
        .unwrap();
        let mut control = Automation::from_config(&control_cfg).unwrap();
        let values = LastValueTable::new();
        let configs: Vec<DeviceConfig> = serde_json::from_value(serde_json::json!([
            {"id": 9, "name": "relay", "type": "relay", "facilityId": 84}
        ]))
        .unwrap();
        let registry = DeviceRegistry::build(&configs, true, &CancellationToken::new());

        // Charge is mid-band; only the override should drive the relay.
        values.set(3, "input", 50.0);
        values.set(9, "relay-1", 0.0);
        control
            .evaluate(&values, &registry, &FakeAlertSink::new())
            .await
            .unwrap();
        assert_eq!(relay_state(&registry).await, 1.0);
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let config: AutomationConfig = serde_json::from_value(serde_json::json!({
            "facilityId": 84, "name": "X", "type": "Sprinkler",
            "deviceId": 3, "timeseriesName": "input"
        }))
        .unwrap();
        assert!(matches!(
            Automation::from_config(&config),
            Err(AutomationConfigError::UnknownType(_))
        ));
    }

    #[test]
    fn generator_without_thresholds_is_a_config_error() {
        let config: AutomationConfig = serde_json::from_value(serde_json::json!({
            "facilityId": 84, "name": "G", "type": "GeneratorControl",
            "deviceId": 3, "timeseriesName": "input",
            "settings": {"controlDeviceId": 9, "controlTimeseriesName": "relay-1"}
        }))
        .unwrap();
        assert!(matches!(
            Automation::from_config(&config),
            Err(AutomationConfigError::MissingField { .. })
        ));
    }
}
