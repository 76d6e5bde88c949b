//! Reconnection controller: owns the control channel's lifetime on the
//! client side.
//!
//! Backoff is `min(base × 2^(n−1), cap)` for 1-indexed attempt `n`, plus a
//! uniform jitter in `[0, 0.3 × delay]`.  The attempt counter resets the
//! moment an open succeeds (not on the registration ack).  Shutdown cancels
//! a pending timer or closes a live session; only one run may be active at a
//! time.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ConfigStore, ConnectionStatus, now_timestamp};
use crate::session::{SessionConfig, SessionEnd, TunnelSession};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const JITTER_FRACTION: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Give up (process exits non-zero) once this many consecutive attempts
    /// have failed; None retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay for 1-indexed attempt `n`, before jitter: non-decreasing in `n`
    /// and bounded by `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full delay including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_FRACTION));
        base + jitter
    }
}

/// How a controller run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ControllerEnd {
    /// Shutdown signal; clean exit.
    Shutdown,
    /// `max_attempts` consecutive failures; caller exits non-zero.
    GaveUp,
    /// Another run is already active; this call did nothing.
    AlreadyRunning,
}

pub struct ReconnectController {
    policy: BackoffPolicy,
    attempts: Arc<AtomicU32>,
    active: Arc<AtomicBool>,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: Arc::new(AtomicU32::new(0)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connect, run the session, and reconnect on loss until shutdown or
    /// the attempt budget runs out.  Re-entrant calls are a no-op.
    pub async fn run(
        &self,
        cfg: &SessionConfig,
        store: &ConfigStore,
        mut shutdown: watch::Receiver<bool>,
    ) -> ControllerEnd {
        if self.active.swap(true, Ordering::SeqCst) {
            return ControllerEnd::AlreadyRunning;
        }
        let end = self.run_inner(cfg, store, &mut shutdown).await;
        self.active.store(false, Ordering::SeqCst);
        end
    }

    async fn run_inner(
        &self,
        cfg: &SessionConfig,
        store: &ConfigStore,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControllerEnd {
        loop {
            match TunnelSession::connect(cfg).await {
                Ok(session) => {
                    // A successful open resets the backoff schedule.
                    self.attempts.store(0, Ordering::SeqCst);
                    if let Err(e) = store.write_status(&ConnectionStatus {
                        connected: true,
                        connected_at: now_timestamp(),
                        port: cfg.local_port,
                        domain: cfg.domain.clone(),
                    }) {
                        warn!(error = %e, "failed to write status file");
                    }
                    info!(domain = %cfg.domain, port = cfg.local_port, "tunnel connected");

                    let end = session.run(cfg.local_port, shutdown.clone()).await;
                    if let Err(e) = store.clear_status() {
                        warn!(error = %e, "failed to remove status file");
                    }
                    match end {
                        Ok(SessionEnd::ShutdownRequested) => return ControllerEnd::Shutdown,
                        Ok(SessionEnd::Disconnected) => {
                            warn!("control channel lost");
                        }
                        Err(e) => {
                            warn!(error = %e, "session error");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open control channel");
                }
            }

            if *shutdown.borrow() {
                return ControllerEnd::Shutdown;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(max) = self.policy.max_attempts {
                if attempt > max {
                    error!(attempts = attempt, "giving up on reconnect");
                    return ControllerEnd::GaveUp;
                }
            }

            let delay = self.policy.delay_for(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        return ControllerEnd::Shutdown;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.base_delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for(100), Duration::from_secs(60));
    }

    #[test]
    fn base_delay_is_monotonic() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = policy.base_delay_for(attempt);
            assert!(delay >= previous, "attempt {} regressed", attempt);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=8 {
            let base = policy.base_delay_for(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= base);
                assert!(delay <= base + base.mul_f64(JITTER_FRACTION));
            }
        }
    }
}
