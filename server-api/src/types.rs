//! Wire models shared between the gateway and the backend API.
//!
//! Device and automation descriptors are the same shape whether they come
//! from the server (`GET facilities/{id}/devices`, `GET automations`) or
//! from a local site-configuration file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------ //
//  Descriptors                                                        //
// ------------------------------------------------------------------ //

/// A device descriptor as stored on the server.
///
/// `settings` is a free-form object interpreted by the driver; a few keys
/// (`enabled`, `pollingInterval`, `local_sim`) are interpreted by the
/// composition builder itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Server-assigned id; 0 for a device that has not been created yet.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub facility_id: i64,
    /// Id of the hub that owns this device, if any.
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

impl DeviceConfig {
    fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.as_ref()?.get(key)
    }

    /// Disabled devices are skipped entirely at composition time.
    pub fn enabled(&self) -> bool {
        self.setting("enabled").and_then(|v| v.as_bool()).unwrap_or(true)
    }

    /// Per-device override of the driver's default polling interval, seconds.
    pub fn polling_interval_override(&self) -> Option<f64> {
        self.setting("pollingInterval").and_then(|v| v.as_f64())
    }

    /// Per-device local-simulation flag (the process-wide flag overrides).
    pub fn local_sim(&self) -> bool {
        self.setting("local_sim").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Numeric setting lookup for drivers.
    pub fn numeric_setting(&self, key: &str) -> Option<f64> {
        self.setting(key).and_then(|v| v.as_f64())
    }
}

/// An automation descriptor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub facility_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Device whose timeseries this automation monitors.
    #[serde(default)]
    pub device_id: i64,
    #[serde(default)]
    pub timeseries_name: String,
    #[serde(default)]
    pub lower_threshold: Option<f64>,
    #[serde(default)]
    pub upper_threshold: Option<f64>,
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub settings: Option<AutomationSettings>,
}

/// Control-automation settings (generator control).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSettings {
    pub control_device_id: i64,
    pub control_timeseries_name: String,
    /// Forces the relay to this state while set; commissioning aid.
    #[serde(default)]
    pub test_output_state: Option<i64>,
}

// ------------------------------------------------------------------ //
//  Timeseries payloads                                                //
// ------------------------------------------------------------------ //

/// One timeseries definition, registered once after composition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesDefinition {
    pub device_id: i64,
    pub timeseries_name: String,
    /// `"Numeric"` or `"Text"`.
    #[serde(rename = "type")]
    pub data_type: String,
    pub decimal_places: i32,
}

/// A single buffered sample. Values travel as fixed-precision strings to
/// avoid floating-point drift on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeseriesValue {
    /// RFC 3339 UTC timestamp recorded locally at poll time.
    pub timestamp: String,
    pub value: String,
}

/// All pending samples for one `(device, series)` stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesValuesEntry {
    pub device_id: i64,
    pub timeseries_name: String,
    pub values: Vec<TimeseriesValue>,
}

/// Server verdict on a values upload. `status == "error"` carries the list
/// of streams it could not record; the rest were accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ValuesResponse {
    pub status: String,
    #[serde(default)]
    pub failures: Vec<ValuesFailure>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFailure {
    pub device_id: i64,
    pub timeseries_name: String,
}

// ------------------------------------------------------------------ //
//  Envelopes                                                          //
// ------------------------------------------------------------------ //

#[derive(Debug, Deserialize)]
pub(crate) struct DevicesEnvelope {
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AutomationsEnvelope {
    pub automations: Vec<AutomationConfig>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedEnvelope {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct TimeseriesCreateRequest<'a> {
    pub timeseries: &'a [TimeseriesDefinition],
}

#[derive(Debug, Serialize)]
pub(crate) struct TimeseriesValuesRequest<'a> {
    pub timeseries: &'a [TimeseriesValuesEntry],
}

#[derive(Debug, Serialize)]
pub(crate) struct AlertRequest<'a> {
    pub subject: &'a str,
    pub body: &'a str,
}

/// Token endpoint response (refresh-token grant). Other fields such as
/// `expires_in` are present but unused; expiry is detected via 401 instead.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// Form body for the refresh-token grant.
pub(crate) fn refresh_grant_form<'a>(
    client_id: &'a str,
    refresh_token: &'a str,
) -> HashMap<&'static str, &'a str> {
    let mut form = HashMap::with_capacity(3);
    form.insert("client_id", client_id);
    form.insert("grant_type", "refresh_token");
    form.insert("refresh_token", refresh_token);
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_defaults() {
        let cfg: DeviceConfig = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "Cold Room Sensor",
            "type": "sensor",
            "make": "Mock",
            "facilityId": 84
        }))
        .unwrap();
        assert_eq!(cfg.id, 7);
        assert_eq!(cfg.kind, "sensor");
        assert_eq!(cfg.facility_id, 84);
        assert!(cfg.enabled());
        assert!(cfg.parent_id.is_none());
        assert!(cfg.polling_interval_override().is_none());
    }

    #[test]
    fn device_config_settings_are_interpreted() {
        let cfg: DeviceConfig = serde_json::from_value(serde_json::json!({
            "id": 8,
            "name": "Disabled",
            "type": "sensor",
            "settings": {"enabled": false, "pollingInterval": 15.0, "local_sim": true}
        }))
        .unwrap();
        assert!(!cfg.enabled());
        assert_eq!(cfg.polling_interval_override(), Some(15.0));
        assert!(cfg.local_sim());
    }

    #[test]
    fn automation_config_parses_control_settings() {
        let cfg: AutomationConfig = serde_json::from_value(serde_json::json!({
            "facilityId": 84,
            "name": "Generator",
            "type": "GeneratorControl",
            "deviceId": 3,
            "timeseriesName": "state-of-charge",
            "lowerThreshold": 20.0,
            "upperThreshold": 80.0,
            "settings": {
                "controlDeviceId": 9,
                "controlTimeseriesName": "relay-1"
            }
        }))
        .unwrap();
        let settings = cfg.settings.unwrap();
        assert_eq!(settings.control_device_id, 9);
        assert_eq!(settings.control_timeseries_name, "relay-1");
        assert!(settings.test_output_state.is_none());
    }

    #[test]
    fn values_response_failures_default_empty() {
        let resp: ValuesResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(resp.status, "ok");
        assert!(resp.failures.is_empty());
    }
}
