//! Gateway daemon — polls local devices and uploads their data.
//!
//! Composes the device graph from the server-provided (or local) site
//! layout, then runs the long-lived tasks: one poll loop per device, one
//! evaluation loop per automation, the batched uploader, and the health
//! watchdog. Ctrl-C cancels everything and flushes the buffer once more
//! before exit.
//!
//! # Configuration
//! Settings come from the environment; a `.env` file is honored.
//!
//! | Env var                    | Default  |
//! |----------------------------|----------|
//! | `FACILITIES`               | required |
//! | `SERVER`                   | required |
//! | `ACCESS_TOKEN_REQUEST_URL` | required |
//! | `API_CLIENT_ID`            | required |
//! | `OFFLINE_REFRESH_TOKEN`    | required |
//! | `SEND_INTERVAL`            | `120`    |
//! | `MAX_VALUES_TO_SEND`       | `1000`   |
//! | `LOCAL_SITE_FILE_OVERRIDE` | unset    |
//! | `LOCAL_SIM`                | `false`  |
//! | `DIAGNOSTIC_MODE`          | `false`  |
//!
//! With `LOCAL_SIM=1` and a site file, the server variables are not needed:
//! drivers run simulated and alerts stay local.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gateway::alerts::{AlertSink, FakeAlertSink, ServerAlertSink};
use gateway::automation::{automation_loop, Automation};
use gateway::config::{self, GatewaySettings};
use gateway::registry::DeviceRegistry;
use gateway::scheduler;
use gateway::store::{LastValueTable, UploadBuffer};
use gateway::sync::{self, retry_forever, UploadTracker};
use gateway::watchdog::Watchdog;
use server_api::{ServerClient, TokenManager};

/// Backoff for startup steps that must succeed (timeseries registration).
const STARTUP_RETRY_BACKOFF: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = GatewaySettings::from_env()?;

    let default_level = if settings.diagnostic_mode {
        "gateway=debug"
    } else {
        "gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .json()
        .init();

    info!(
        facilities = ?settings.facilities,
        local_sim = settings.local_sim,
        "gateway starting"
    );

    let cancel = CancellationToken::new();

    // Connected mode: authenticate eagerly so a bad credential fails loudly
    // at startup rather than on the first upload.
    let client = match &settings.server {
        Some(server) => {
            let auth = Arc::new(TokenManager::new(
                settings
                    .access_token_request_url
                    .clone()
                    .context("ACCESS_TOKEN_REQUEST_URL is not set")?,
                settings
                    .api_client_id
                    .clone()
                    .context("API_CLIENT_ID is not set")?,
                settings
                    .offline_refresh_token
                    .clone()
                    .context("OFFLINE_REFRESH_TOKEN is not set")?,
            ));
            auth.bearer().await;
            info!(server = %server, "authenticated with server");
            Some(Arc::new(ServerClient::new(server.clone(), auth)))
        }
        None => None,
    };

    // Site layout: the local file wins when present.
    let site = match &settings.site_file {
        Some(path) => config::load_site_file(path)?,
        None => {
            let client = client
                .as_ref()
                .context("no site file and no server configured")?;
            config::load_site_from_server(client, &settings.facilities).await
        }
    };

    let registry = Arc::new(DeviceRegistry::build(
        &site.devices,
        settings.local_sim,
        &cancel,
    ));
    let values = Arc::new(LastValueTable::new());
    let buffer = Arc::new(UploadBuffer::new(
        settings.max_values_to_send,
        registry.decimal_places(),
    ));

    // Register the timeseries set before any upload refers to it.
    if let Some(client) = &client {
        let definitions = registry.timeseries_definitions();
        retry_forever("register timeseries", STARTUP_RETRY_BACKOFF, || {
            client.create_timeseries(&definitions)
        })
        .await;
        info!(count = definitions.len(), "timeseries registered");
    }

    let alerts: Arc<dyn AlertSink> = match &client {
        Some(client) => Arc::new(ServerAlertSink::new(client.clone())),
        None => Arc::new(FakeAlertSink::new()),
    };

    let mut tasks: Vec<JoinHandle<()>> =
        scheduler::spawn_polling_tasks(&registry, &values, &buffer, &cancel);

    for automation_config in &site.automations {
        match Automation::from_config(automation_config) {
            Ok(automation) => {
                tasks.push(tokio::spawn(automation_loop(
                    automation,
                    values.clone(),
                    registry.clone(),
                    alerts.clone(),
                    cancel.clone(),
                )));
            }
            Err(e) => {
                warn!(
                    automation = %automation_config.name,
                    error = %e,
                    "automation skipped"
                );
            }
        }
    }

    let tracker = Arc::new(UploadTracker::new());
    if let Some(client) = &client {
        tasks.push(tokio::spawn(sync::sync_loop(
            client.clone(),
            buffer.clone(),
            tracker.clone(),
            settings.send_interval,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(
            Watchdog::new(
                registry.clone(),
                tracker.clone(),
                alerts.clone(),
                settings.send_interval,
                settings.primary_facility(),
            )
            .run(cancel.clone()),
        ));
    }

    info!(
        devices = registry.len(),
        automations = site.automations.len(),
        tasks = tasks.len(),
        "gateway running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task ended abnormally");
        }
    }

    // Pollers are stopped; flush whatever they left behind.
    if let Some(client) = &client {
        let delivered = sync::drain_once(client, &buffer, &tracker).await;
        info!(samples = delivered, "final flush complete");
    }
    info!("gateway stopped");
    Ok(())
}
