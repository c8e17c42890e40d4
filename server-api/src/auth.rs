//! Access-token manager.
//!
//! Holds the current bearer credential for the whole process. A refresh is
//! requested on startup and whenever a request comes back 401. Without a
//! token nothing else can talk to the server, so a failed refresh retries
//! indefinitely with a fixed backoff rather than propagating an error.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{refresh_grant_form, TokenResponse};

const DEFAULT_REFRESH_BACKOFF: Duration = Duration::from_secs(120);

pub struct TokenManager {
    http: reqwest::Client,
    request_url: String,
    client_id: String,
    refresh_token: String,
    backoff: Duration,
    /// `"{token_type} {access_token}"`, ready for the Authorization header.
    /// Guarded so concurrent 401s trigger a single refresh.
    current: Mutex<Option<String>>,
}

impl TokenManager {
    pub fn new(request_url: String, client_id: String, refresh_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            request_url,
            client_id,
            refresh_token,
            backoff: DEFAULT_REFRESH_BACKOFF,
            current: Mutex::new(None),
        }
    }

    /// Shorten the retry backoff (tests).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current header value, refreshing first if no token is held yet.
    pub async fn bearer(&self) -> String {
        let mut guard = self.current.lock().await;
        if guard.is_none() {
            *guard = Some(self.refresh().await);
        }
        guard.clone().unwrap_or_default()
    }

    /// Discard a rejected credential and obtain a new one.
    ///
    /// `stale` is the header value the caller was using; if another task
    /// already replaced it, the fresh token is returned without a second
    /// round-trip to the token endpoint.
    pub async fn renew(&self, stale: &str) -> String {
        let mut guard = self.current.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing != stale {
                debug!("token already renewed by another task");
                return existing.clone();
            }
        }
        let fresh = self.refresh().await;
        *guard = Some(fresh.clone());
        fresh
    }

    /// One refresh-token grant, retried forever on failure.
    async fn refresh(&self) -> String {
        let form = refresh_grant_form(&self.client_id, &self.refresh_token);
        loop {
            let result = async {
                let resp = self
                    .http
                    .post(&self.request_url)
                    .form(&form)
                    .send()
                    .await?
                    .error_for_status()?;
                resp.json::<TokenResponse>().await
            }
            .await;

            match result {
                Ok(token) => {
                    debug!("access token refreshed");
                    return format!("{} {}", token.token_type, token.access_token);
                }
                Err(e) => {
                    warn!(url = %self.request_url, error = %e, "token refresh failed; retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
