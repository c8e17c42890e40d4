//! Client library for the monitoring backend's HTTP API.
//!
//! The gateway authenticates with an offline refresh token exchanged for a
//! short-lived bearer token. Every request goes through a retry wrapper that
//! transparently renews the token on a 401 and replays the request, so
//! callers never see an auth failure.

pub mod auth;
pub mod client;
pub mod types;

pub use auth::TokenManager;
pub use client::{ApiError, ServerClient};
pub use types::{
    AutomationConfig, AutomationSettings, DeviceConfig, TimeseriesDefinition, TimeseriesValue,
    TimeseriesValuesEntry, ValuesResponse,
};
