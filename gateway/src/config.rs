//! Gateway configuration: environment settings and the site layout.
//!
//! Settings come from the environment (a `.env` file is honored). The site
//! layout (devices and automations) normally comes from the server per
//! facility; a local JSON file can override it for bench work and tests.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::sync::retry_forever;
use server_api::{AutomationConfig, DeviceConfig, ServerClient};

const DEFAULT_SEND_INTERVAL_SECS: u64 = 120;
const DEFAULT_MAX_VALUES_TO_SEND: usize = 1000;

/// Backoff between attempts when fetching the site layout from the server.
const SITE_FETCH_BACKOFF: Duration = Duration::from_secs(120);

/// Environment-derived settings, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Facilities this gateway manages, in priority order. The first one
    /// receives gateway-level alerts.
    pub facilities: Vec<i64>,
    pub server: Option<String>,
    pub access_token_request_url: Option<String>,
    pub api_client_id: Option<String>,
    pub offline_refresh_token: Option<String>,
    pub send_interval: Duration,
    /// Upload buffer cap, in samples across all streams.
    pub max_values_to_send: usize,
    /// Path to a local site file replacing the server-provided layout.
    pub site_file: Option<String>,
    /// Run fully offline with simulated drivers and a local alert sink.
    pub local_sim: bool,
    pub diagnostic_mode: bool,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self> {
        let facilities = match std::env::var("FACILITIES").ok() {
            Some(raw) => parse_facilities(&raw)?,
            None => Vec::new(),
        };
        let send_interval = match std::env::var("SEND_INTERVAL").ok() {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("SEND_INTERVAL is not a number of seconds: {raw}"))?,
            ),
            None => Duration::from_secs(DEFAULT_SEND_INTERVAL_SECS),
        };
        let max_values_to_send = match std::env::var("MAX_VALUES_TO_SEND").ok() {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("MAX_VALUES_TO_SEND is not a count: {raw}"))?,
            None => DEFAULT_MAX_VALUES_TO_SEND,
        };

        let settings = Self {
            facilities,
            server: std::env::var("SERVER").ok(),
            access_token_request_url: std::env::var("ACCESS_TOKEN_REQUEST_URL").ok(),
            api_client_id: std::env::var("API_CLIENT_ID").ok(),
            offline_refresh_token: std::env::var("OFFLINE_REFRESH_TOKEN").ok(),
            send_interval,
            max_values_to_send,
            site_file: std::env::var("LOCAL_SITE_FILE_OVERRIDE").ok(),
            local_sim: env_flag("LOCAL_SIM"),
            diagnostic_mode: env_flag("DIAGNOSTIC_MODE"),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The connected mode needs the server coordinates and credentials; the
    /// simulated mode with a local site file needs neither.
    fn validate(&self) -> Result<()> {
        if self.local_sim && self.site_file.is_some() {
            return Ok(());
        }
        for (name, value) in [
            ("SERVER", &self.server),
            ("ACCESS_TOKEN_REQUEST_URL", &self.access_token_request_url),
            ("API_CLIENT_ID", &self.api_client_id),
            ("OFFLINE_REFRESH_TOKEN", &self.offline_refresh_token),
        ] {
            if value.is_none() {
                anyhow::bail!("required environment variable {name} is not set");
            }
        }
        if self.facilities.is_empty() {
            anyhow::bail!("FACILITIES must list at least one facility id");
        }
        Ok(())
    }

    /// Facility that receives gateway-level alerts.
    pub fn primary_facility(&self) -> i64 {
        self.facilities.first().copied().unwrap_or(0)
    }
}

fn parse_facilities(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .with_context(|| format!("FACILITIES contains a non-numeric id: {part}"))
        })
        .collect()
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    )
}

/// The full site layout the gateway manages.
#[derive(Debug, Default, Deserialize)]
pub struct SiteConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub automations: Vec<AutomationConfig>,
}

/// Load the site layout from a local JSON file.
pub fn load_site_file(path: impl AsRef<Path>) -> Result<SiteConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read site file {}", path.display()))?;
    let site: SiteConfig = serde_json::from_str(&raw)
        .with_context(|| format!("site file {} is not valid", path.display()))?;
    info!(
        path = %path.display(),
        devices = site.devices.len(),
        automations = site.automations.len(),
        "site layout loaded from file"
    );
    Ok(site)
}

/// Fetch the site layout for every configured facility. Retries each fetch
/// indefinitely: without the layout the gateway has nothing to run, and a
/// restart loop would not do better than waiting here.
pub async fn load_site_from_server(client: &ServerClient, facilities: &[i64]) -> SiteConfig {
    let mut site = SiteConfig::default();
    for &facility_id in facilities {
        let devices = retry_forever("fetch facility devices", SITE_FETCH_BACKOFF, || {
            client.facility_devices(facility_id)
        })
        .await;
        let automations = retry_forever("fetch facility automations", SITE_FETCH_BACKOFF, || {
            client.facility_automations(facility_id)
        })
        .await;
        info!(
            facility = facility_id,
            devices = devices.len(),
            automations = automations.len(),
            "site layout loaded from server"
        );
        site.devices.extend(devices);
        site.automations.extend(automations);
    }
    if site.devices.is_empty() {
        warn!("site layout contains no devices");
    }
    site
}
