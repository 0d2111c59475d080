use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::store::error::StoreError;

/// Refresh immediately once this little lifetime remains.
const MIN_REFRESH_LEAD: i64 = 1;
/// Pause before re-trying after a failed refresh.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential stored")]
    Missing,

    #[error("malformed JWT")]
    MalformedJwt,

    #[error("credential refresh failed: {0}")]
    Refresh(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the JWT credential lives between runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_jwt(&self) -> Result<Option<String>, StoreError>;
    async fn save_jwt(&self, jwt: &str) -> Result<(), StoreError>;
}

/// The directory service's refresh endpoint.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_jwt(&self, jwt: &str) -> Result<String, anyhow::Error>;
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

/// Expiry (epoch seconds) from the JWT payload, without verifying the
/// signature; verification is the server's business.
pub fn jwt_expiration(jwt: &str) -> Result<i64, CredentialError> {
    let payload = jwt.split('.').nth(1).ok_or(CredentialError::MalformedJwt)?;
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| CredentialError::MalformedJwt)?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|_| CredentialError::MalformedJwt)?;
    Ok(claims.exp)
}

/// Half-life schedule: refresh now when the remaining lifetime is under
/// [`MIN_REFRESH_LEAD`], otherwise sleep half of what is left and look
/// again.
pub fn refresh_delay(expiration: i64, now: i64) -> Duration {
    let remaining = expiration - now;
    if remaining < MIN_REFRESH_LEAD {
        Duration::ZERO
    } else {
        Duration::from_secs((remaining / 2) as u64)
    }
}

/// Keeps the stored JWT fresh for as long as the client runs.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn CredentialRefresher>,
    shutdown: Notify,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            store,
            refresher,
            shutdown: Notify::new(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn next_delay(&self) -> Result<Duration, CredentialError> {
        let jwt = self
            .store
            .load_jwt()
            .await?
            .ok_or(CredentialError::Missing)?;
        Ok(refresh_delay(jwt_expiration(&jwt)?, Utc::now().timestamp()))
    }

    /// Refresh the stored credential once. Validates the replacement
    /// before persisting it.
    pub async fn refresh_once(&self) -> Result<(), CredentialError> {
        let jwt = self
            .store
            .load_jwt()
            .await?
            .ok_or(CredentialError::Missing)?;
        info!(target: "Credentials", "refreshing API credential");
        let fresh = self
            .refresher
            .refresh_jwt(&jwt)
            .await
            .map_err(CredentialError::Refresh)?;
        jwt_expiration(&fresh)?;
        self.store.save_jwt(&fresh).await?;
        Ok(())
    }

    /// The maintenance loop. Spawn as a background task; exits on
    /// [`shutdown`](Self::shutdown).
    pub async fn maintain_loop(self: Arc<Self>) {
        let mut backoff: Option<Duration> = None;
        loop {
            let delay = match backoff.take() {
                Some(delay) => delay,
                None => match self.next_delay().await {
                    Ok(delay) => delay,
                    Err(e) => {
                        warn!(target: "Credentials", "cannot schedule refresh: {e}");
                        RETRY_INTERVAL
                    }
                },
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(target: "Credentials", "refresh failed: {e}");
                        backoff = Some(RETRY_INTERVAL);
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!(target: "Credentials", "shutdown signaled, exiting refresh loop");
                    return;
                }
            }
        }
    }
}
