//! Background tasks: the periodic pay-in sweep and the specification refresh.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::payin_service::PayInService;
use super::specs::SpecificationResolver;

/// Background worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Time between two pay-in sweeps
    pub sweep_interval: Duration,
    /// Time between two specification reloads
    pub spec_refresh_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(60),
            spec_refresh_interval: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env::var("ENABLE_BACKGROUND_WORKER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enabled),
            sweep_interval: parse_interval(
                env::var("PAYIN_SWEEP_INTERVAL_SECS").ok().as_deref(),
                defaults.sweep_interval,
            ),
            spec_refresh_interval: parse_interval(
                env::var("SPEC_REFRESH_INTERVAL_SECS").ok().as_deref(),
                defaults.spec_refresh_interval,
            ),
        }
    }
}

/// Whole seconds, at least one. `tokio::time::interval` panics on zero.
fn parse_interval(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Runs `process_pay_ins` on a fixed interval
pub struct PayInWorker {
    service: Arc<PayInService>,
    interval: Duration,
}

impl PayInWorker {
    #[must_use]
    pub fn new(service: Arc<PayInService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Pay-in worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Pay-in worker shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.service.process_pay_ins().await {
                        error!(error = %e, "Pay-in sweep failed");
                    }
                }
            }
        }
    }
}

/// Reloads the specification snapshot on a fixed interval, starting immediately
pub struct SpecRefreshWorker {
    resolver: Arc<SpecificationResolver>,
    interval: Duration,
}

impl SpecRefreshWorker {
    #[must_use]
    pub fn new(resolver: Arc<SpecificationResolver>, interval: Duration) -> Self {
        Self { resolver, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Specification refresh started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Specification refresh shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.resolver.refresh().await {
                        error!(error = %e, "Specification refresh failed, keeping previous rules");
                    }
                }
            }
        }
    }
}

/// Spawn the pay-in worker. Send `true` on the returned channel to stop it.
pub fn spawn_payin_worker(
    service: Arc<PayInService>,
    config: &WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = PayInWorker::new(service, config.sweep_interval);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    (handle, shutdown_tx)
}

/// Spawn the specification refresh. Send `true` on the returned channel to stop it.
pub fn spawn_spec_refresh(
    resolver: Arc<SpecificationResolver>,
    config: &WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SpecRefreshWorker::new(resolver, config.spec_refresh_interval);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::specs::SpecificationDefaults;
    use crate::domain::{TransactionDirection, TransactionSpecification};
    use crate::test_utils::MockSpecificationRepository;
    use rust_decimal::Decimal;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.spec_refresh_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_or_garbage_interval_falls_back() {
        let default = Duration::from_secs(60);
        assert_eq!(parse_interval(Some("0"), default), default);
        assert_eq!(parse_interval(Some("-5"), default), default);
        assert_eq!(parse_interval(Some("soon"), default), default);
        assert_eq!(parse_interval(None, default), default);
        assert_eq!(parse_interval(Some(" 15 "), default), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_spec_refresh_loads_on_start_and_stops() {
        let repo = Arc::new(MockSpecificationRepository::with_specs(vec![
            TransactionSpecification {
                id: 1,
                system: "Bitcoin".to_string(),
                asset: None,
                direction: None,
                min_fee: Decimal::ONE,
                min_volume: Decimal::TEN,
            },
        ]));
        let resolver = Arc::new(SpecificationResolver::new(
            repo,
            SpecificationDefaults::default(),
        ));

        let (handle, shutdown_tx) =
            spawn_spec_refresh(Arc::clone(&resolver), &WorkerConfig::default());

        for _ in 0..50 {
            if !resolver.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            resolver.resolve("Bitcoin", "BTC", TransactionDirection::In).min_fee,
            Decimal::ONE
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
