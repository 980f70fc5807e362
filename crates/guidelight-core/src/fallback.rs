// ── Fallback sync ──
//
// HTTP polling of the authoritative emergency state, active only while
// the push channel is down. One-shot activate/deactivate requests are
// refused while the push channel is healthy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use guidelight_api::{ConnectionStatus, EmergencyState, HttpClient};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Called with the freshly fetched state whenever it differs from the
/// previous poll.
pub type StateCallback = Arc<dyn Fn(&EmergencyState) + Send + Sync>;

/// Polling client for degraded push transport. Cheaply cloneable.
#[derive(Clone)]
pub struct FallbackSync {
    inner: Arc<FallbackInner>,
}

struct FallbackInner {
    http: HttpClient,
    interval: Duration,
    status: watch::Receiver<ConnectionStatus>,
    /// Last state seen by a poll; forgotten whenever the socket is up.
    last: Mutex<Option<EmergencyState>>,
    polling: Mutex<Option<CancellationToken>>,
}

impl FallbackSync {
    pub fn new(http: HttpClient, interval: Duration, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            inner: Arc::new(FallbackInner {
                http,
                interval,
                status,
                last: Mutex::new(None),
                polling: Mutex::new(None),
            }),
        }
    }

    /// Start the poll loop, replacing any running one. The first poll
    /// happens immediately.
    pub fn start_polling<F>(&self, on_state_change: F)
    where
        F: Fn(&EmergencyState) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.inner.polling().replace(cancel.clone()) {
            previous.cancel();
        }
        *self.inner.last() = None;

        info!(interval_secs = self.inner.interval.as_secs_f64(), "fallback polling started");
        tokio::spawn(poll_task(
            Arc::clone(&self.inner),
            Arc::new(on_state_change),
            cancel,
        ));
    }

    pub fn stop_polling(&self) {
        if let Some(cancel) = self.inner.polling().take() {
            cancel.cancel();
            debug!("fallback polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling().is_some()
    }

    /// Fetch once; `Some` when the state differs from the previous poll.
    pub async fn poll_once(&self) -> Result<Option<EmergencyState>, CoreError> {
        self.inner.poll_once().await
    }

    /// Read the state without touching change detection.
    pub async fn fetch(&self) -> Result<EmergencyState, CoreError> {
        Ok(self.inner.http.emergency_state().await?)
    }

    pub async fn activate_emergency(&self, zone_name: &str, wind_direction: &str) -> Result<(), CoreError> {
        self.inner.refuse_if_connected("activate")?;
        self.inner
            .http
            .activate_emergency(zone_name, wind_direction)
            .await?;
        info!(zone = zone_name, wind = wind_direction, "emergency activated over fallback");
        Ok(())
    }

    pub async fn deactivate_emergency(&self) -> Result<(), CoreError> {
        self.inner.refuse_if_connected("deactivate")?;
        self.inner.http.deactivate_emergency().await?;
        info!("emergency deactivation requested over fallback");
        Ok(())
    }
}

impl FallbackInner {
    async fn poll_once(&self) -> Result<Option<EmergencyState>, CoreError> {
        let state = self.http.emergency_state().await?;
        let mut last = self.last();
        if last.as_ref() == Some(&state) {
            return Ok(None);
        }
        *last = Some(state.clone());
        Ok(Some(state))
    }

    fn refuse_if_connected(&self, operation: &'static str) -> Result<(), CoreError> {
        if self.status.borrow().is_connected {
            return Err(CoreError::PushChannelHealthy { operation });
        }
        Ok(())
    }

    fn last(&self) -> MutexGuard<'_, Option<EmergencyState>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn polling(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.polling.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn poll_task(inner: Arc<FallbackInner>, on_change: StateCallback, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now(), inner.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if inner.status.borrow().is_connected {
                    // Push owns the state; compare afresh after the next drop.
                    *inner.last() = None;
                    continue;
                }
                match inner.poll_once().await {
                    Ok(Some(state)) => {
                        debug!(active = state.is_activated, zone = ?state.zone_name, "fallback poll saw a change");
                        on_change(&state);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "fallback poll failed"),
                }
            }
        }
    }
}
