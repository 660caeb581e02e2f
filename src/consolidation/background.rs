//! Periodic consolidation while the server runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Consolidator;
use crate::config::ConsolidationConfig;
use crate::error::LoreError;

const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    /// First delay after a failed run; doubles per consecutive failure, capped at `interval`.
    pub failure_backoff: Duration,
    /// The loop stops after this many failed runs in a row. Zero never stops.
    pub max_consecutive_failures: u32,
}

impl From<&ConsolidationConfig> for LoopSettings {
    fn from(config: &ConsolidationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_minutes.max(1) * 60),
            failure_backoff: FAILURE_BACKOFF,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// A running background loop.
pub struct BackgroundLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundLoop {
    /// Start the loop. It runs once immediately, then every `interval`, until
    /// stopped or too many runs fail in a row.
    pub fn spawn(consolidator: Arc<Consolidator>, settings: LoopSettings) -> Self {
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(run_loop(consolidator, settings, shutdown));
        Self { stop, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait up to `grace` for an in-flight run to finish.
    ///
    /// Returns `false` if the grace period ran out and the task was aborted.
    /// Store transactions never span an await point, so aborting cannot leave
    /// one half-applied.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.stop.send(true);
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "consolidation run still in flight after grace period, aborting"
                );
                handle.abort();
                false
            }
        }
    }
}

async fn run_loop(
    consolidator: Arc<Consolidator>,
    settings: LoopSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match consolidator.run().await {
            Ok(_) => {
                failures = 0;
                settings.interval
            }
            Err(e) if matches!(e.downcast_ref::<LoreError>(), Some(LoreError::RunInProgress)) => {
                tracing::debug!("consolidation already running, skipping scheduled run");
                settings.interval
            }
            Err(e) => {
                failures += 1;
                tracing::error!(error = %e, failures, "consolidation run failed");
                if settings.max_consecutive_failures > 0
                    && failures >= settings.max_consecutive_failures
                {
                    tracing::error!(
                        failures,
                        "too many consecutive consolidation failures, stopping background loop"
                    );
                    break;
                }
                backoff(settings.failure_backoff, failures).min(settings.interval)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("background consolidation stopped");
}

fn backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(1u32 << failures.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 1), Duration::from_secs(30));
        assert_eq!(backoff(base, 2), Duration::from_secs(60));
        assert_eq!(backoff(base, 4), Duration::from_secs(240));
    }

    #[test]
    fn settings_from_config() {
        let config = ConsolidationConfig {
            interval_minutes: 5,
            max_consecutive_failures: 2,
            ..ConsolidationConfig::default()
        };
        let settings = LoopSettings::from(&config);
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert_eq!(settings.max_consecutive_failures, 2);
    }
}
