// MIT License - Copyright (c) 2026 Peter Wright

use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::event::{ActionReceiver, CameraAction};
use crate::imou::{CameraCloud, Credential};

/// Bounded exponential backoff for transient cloud failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed backoff (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try, given how many attempts have failed.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(self.multiplier.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter > 0.0 {
            delay + delay.mul_f64(rand::rng().random_range(0.0..=self.jitter))
        } else {
            delay
        }
    }
}

/// What happened to one camera during an action.
#[derive(Debug)]
pub enum CameraStatus {
    Applied,
    Skipped(&'static str),
    Failed(BridgeError),
}

#[derive(Debug)]
pub struct CameraResult {
    pub device_id: String,
    pub name: String,
    pub status: CameraStatus,
}

/// Per-camera outcome of one dispatched action. Partial failure is
/// normal: each camera is reported on its own.
#[derive(Debug)]
pub struct DispatchReport {
    pub action: CameraAction,
    pub results: Vec<CameraResult>,
}

impl DispatchReport {
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, CameraStatus::Failed(_)))
            .count()
    }
}

/// Applies camera actions against the cloud, one at a time.
///
/// The dispatcher is the sole owner of the [`Credential`]: a token is
/// fetched lazily, reused until its expiry, and refreshed exactly once
/// when the cloud rejects it mid-call. Transient failures back off per
/// [`RetryPolicy`]; anything else fails that camera immediately.
pub struct Dispatcher<C: CameraCloud> {
    cloud: Arc<C>,
    credential: Option<Credential>,
    retry: RetryPolicy,
}

impl<C: CameraCloud> Dispatcher<C> {
    pub fn new(cloud: Arc<C>, retry: RetryPolicy) -> Self {
        Self {
            cloud,
            credential: None,
            retry,
        }
    }

    /// Consume actions until the channel closes, preserving arrival order.
    pub async fn run(mut self, mut actions: ActionReceiver) {
        while let Some(action) = actions.recv().await {
            match self.apply(action).await {
                Ok(report) => {
                    let failures = report.failures();
                    if failures > 0 {
                        warn!(action = %action, failures, "action applied with per-camera failures");
                    }
                }
                Err(e) => {
                    // Nothing was applied; the next action starts over from
                    // the device list.
                    error!(action = %action, error = %e, "dispatch failed");
                }
            }
        }
        debug!("action channel closed, dispatcher stopping");
    }

    /// Apply one action to every registered camera.
    pub async fn apply(&mut self, action: CameraAction) -> Result<DispatchReport> {
        let enabled = action.switch_on();
        let devices = self
            .with_retry("deviceBaseList", |cloud: Arc<C>, token: String| async move {
                cloud.list_devices(&token).await
            })
            .await?;

        if devices.is_empty() {
            warn!(action = %action, "no cameras registered under the account");
            return Ok(DispatchReport { action, results: Vec::new() });
        }

        let mut results = Vec::with_capacity(devices.len());
        for device in &devices {
            let status = if !device.online {
                info!(device = %device.device_id, name = %device.name, "device offline, skipping");
                CameraStatus::Skipped("offline")
            } else if !device.supports_privacy {
                debug!(device = %device.device_id, name = %device.name, "device lacks privacy switch, skipping");
                CameraStatus::Skipped("no privacy switch")
            } else {
                match self
                    .with_retry("setDeviceCameraStatus", |cloud: Arc<C>, token: String| async move {
                        cloud.set_privacy(&token, device, enabled).await
                    })
                    .await
                {
                    Ok(()) => {
                        info!(
                            device = %device.device_id,
                            name = %device.name,
                            privacy = if enabled { "ON" } else { "OFF" },
                            "privacy mode set"
                        );
                        CameraStatus::Applied
                    }
                    Err(e) => {
                        error!(
                            device = %device.device_id,
                            name = %device.name,
                            action = %action,
                            error = %e,
                            "privacy mode change failed"
                        );
                        CameraStatus::Failed(e)
                    }
                }
            };
            results.push(CameraResult {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
                status,
            });
        }

        Ok(DispatchReport { action, results })
    }

    /// Log the current privacy state of every camera. Used at startup as
    /// a best-effort reachability check.
    pub async fn probe(&mut self) -> Result<()> {
        let devices = self
            .with_retry("deviceBaseList", |cloud: Arc<C>, token: String| async move {
                cloud.list_devices(&token).await
            })
            .await?;

        if devices.is_empty() {
            warn!("no cameras registered under the account");
            return Ok(());
        }

        for device in &devices {
            if !device.online {
                info!(device = %device.device_id, name = %device.name, "device offline");
                continue;
            }
            let token = self.token().await?;
            match self.cloud.privacy_state(&token, device).await {
                Ok(on) => info!(
                    device = %device.device_id,
                    name = %device.name,
                    privacy = if on { "ON" } else { "OFF" },
                    "camera state"
                ),
                Err(e) => warn!(
                    device = %device.device_id,
                    name = %device.name,
                    error = %e,
                    "cannot read camera state"
                ),
            }
        }
        Ok(())
    }

    /// Run one cloud call with backoff on transient failures and a single
    /// token refresh on credential rejection.
    async fn with_retry<T, F, Fut>(&mut self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<C>, String) -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut token = self.token().await?;
        let mut failed_attempts: u32 = 0;
        let mut refreshed = false;

        loop {
            match op(self.cloud.clone(), token.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && failed_attempts + 1 < self.retry.max_attempts => {
                    failed_attempts += 1;
                    let delay = self.retry.delay_for(failed_attempts);
                    warn!(
                        call = what,
                        attempt = failed_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(BridgeError::Credential { details }) if !refreshed => {
                    info!(call = what, details = %details, "token rejected, refreshing");
                    self.credential = None;
                    token = self.refresh_token().await?;
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The cached token, fetching a fresh one when absent or expired.
    async fn token(&mut self) -> Result<String> {
        if let Some(credential) = &self.credential
            && !credential.is_expired()
        {
            return Ok(credential.access_token.clone());
        }
        self.refresh_token().await
    }

    /// Fetch a new token, allowing the fetch itself one immediate retry.
    async fn refresh_token(&mut self) -> Result<String> {
        let credential = match self.cloud.fetch_token().await {
            Ok(credential) => credential,
            Err(first) => {
                warn!(error = %first, "token fetch failed, retrying once");
                self.cloud.fetch_token().await?
            }
        };
        debug!("access token refreshed");
        let token = credential.access_token.clone();
        self.credential = Some(credential);
        Ok(token)
    }
}
