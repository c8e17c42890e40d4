//! Typed endpoint calls with transparent 401 recovery.

use std::sync::Arc;

use reqwest::{header::AUTHORIZATION, Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::TokenManager;
use crate::types::{
    AlertRequest, AutomationConfig, AutomationsEnvelope, CreatedEnvelope, DeviceConfig,
    DevicesEnvelope, TimeseriesCreateRequest, TimeseriesDefinition, TimeseriesValuesEntry,
    TimeseriesValuesRequest, ValuesResponse,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ServerClient {
    http: reqwest::Client,
    base: String,
    auth: Arc<TokenManager>,
}

impl ServerClient {
    pub fn new(base: impl Into<String>, auth: Arc<TokenManager>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base.trim_end_matches('/'), path)
    }

    /// Send a request with the current bearer token. A 401 response renews
    /// the token and replays the same request; any other non-success status
    /// is an error for the caller to handle (usually: retry next cycle).
    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path);
        let mut token = self.auth.bearer().await;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(AUTHORIZATION, &token);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                debug!(%url, "access token rejected; renewing");
                token = self.auth.renew(&token).await;
                continue;
            }
            if !resp.status().is_success() {
                return Err(ApiError::Status {
                    status: resp.status(),
                    url,
                });
            }
            return Ok(resp);
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        self.send::<()>(Method::GET, path, None).await
    }

    // -------------------------------------------------------------- //
    //  Devices & automations                                          //
    // -------------------------------------------------------------- //

    /// All device descriptors registered for one facility.
    pub async fn facility_devices(&self, facility_id: i64) -> Result<Vec<DeviceConfig>, ApiError> {
        let resp = self
            .get(&format!("facilities/{facility_id}/devices"))
            .await?;
        let envelope: DevicesEnvelope = resp.json().await?;
        Ok(envelope.devices)
    }

    /// All automation descriptors for one facility, with the facility id
    /// stamped onto each (the server omits it from the per-facility query).
    pub async fn facility_automations(
        &self,
        facility_id: i64,
    ) -> Result<Vec<AutomationConfig>, ApiError> {
        let resp = self
            .get(&format!("automations?facilityId={facility_id}"))
            .await?;
        let envelope: AutomationsEnvelope = resp.json().await?;
        let mut automations = envelope.automations;
        for automation in &mut automations {
            automation.facility_id = facility_id;
        }
        Ok(automations)
    }

    /// Register a new device; returns the server-assigned id.
    pub async fn create_device(&self, config: &DeviceConfig) -> Result<i64, ApiError> {
        let payload = strip_id(config)?;
        let resp = self.send(Method::POST, "devices", Some(&payload)).await?;
        let created: CreatedEnvelope = resp.json().await?;
        Ok(created.id)
    }

    /// Update an existing device definition. The id travels in the URL.
    pub async fn update_device(&self, config: &DeviceConfig) -> Result<(), ApiError> {
        let payload = strip_id(config)?;
        self.send(
            Method::PUT,
            &format!("devices/{}", config.id),
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    /// Register a new automation; returns the server-assigned id.
    pub async fn create_automation(&self, config: &AutomationConfig) -> Result<i64, ApiError> {
        let payload = strip_id(config)?;
        let resp = self
            .send(Method::POST, "automations", Some(&payload))
            .await?;
        let created: CreatedEnvelope = resp.json().await?;
        Ok(created.id)
    }

    /// Update an existing automation definition.
    pub async fn update_automation(&self, config: &AutomationConfig) -> Result<(), ApiError> {
        let payload = strip_id(config)?;
        self.send(
            Method::PUT,
            &format!("automations/{}", config.id),
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------- //
    //  Timeseries                                                     //
    // -------------------------------------------------------------- //

    /// Register the full set of timeseries definitions, collected once
    /// after device composition is finalized.
    pub async fn create_timeseries(
        &self,
        definitions: &[TimeseriesDefinition],
    ) -> Result<(), ApiError> {
        let payload = TimeseriesCreateRequest {
            timeseries: definitions,
        };
        self.send(Method::POST, "timeseries/create", Some(&payload))
            .await?;
        Ok(())
    }

    /// Upload one batch of buffered samples.
    pub async fn post_timeseries_values(
        &self,
        entries: &[TimeseriesValuesEntry],
    ) -> Result<ValuesResponse, ApiError> {
        let payload = TimeseriesValuesRequest {
            timeseries: entries,
        };
        let resp = self
            .send(Method::POST, "timeseries/values", Some(&payload))
            .await?;
        Ok(resp.json().await?)
    }

    // -------------------------------------------------------------- //
    //  Alerts                                                         //
    // -------------------------------------------------------------- //

    /// Send a facility alert (email/notification fan-out happens server-side).
    pub async fn send_alert(
        &self,
        facility_id: i64,
        subject: &str,
        body: &str,
    ) -> Result<(), ApiError> {
        let payload = AlertRequest { subject, body };
        self.send(
            Method::POST,
            &format!("facilities/{facility_id}/alert/send"),
            Some(&payload),
        )
        .await?;
        Ok(())
    }
}

/// Serialize a descriptor without its `id` field for create/update bodies.
fn strip_id<T: Serialize>(config: &T) -> Result<serde_json::Value, serde_json::Error> {
    let mut value = serde_json::to_value(config)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("id");
    }
    Ok(value)
}
