//! Offline-server revalidation.
//!
//! With the default `on_demand` policy nothing runs in the background: an
//! offline server is retried when someone invokes it or calls
//! [`ToolInvoker::revalidate_offline`]. The `periodic` policy adds a task
//! that does the latter on a fixed interval until the invoker shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::ToolInvoker;
use crate::config::HealthCheckMode;

/// Start the background monitor if the invoker's policy asks for one.
pub fn start_health_policy(invoker: &Arc<ToolInvoker>) -> Option<JoinHandle<()>> {
    let health = invoker.health_config();
    match health.mode {
        HealthCheckMode::OnDemand => None,
        HealthCheckMode::Periodic => Some(spawn_health_monitor(Arc::clone(invoker), health.interval())),
    }
}

/// Run `revalidate_offline` every `interval` until shutdown.
pub fn spawn_health_monitor(invoker: Arc<ToolInvoker>, interval: Duration) -> JoinHandle<()> {
    let mut stop = invoker.stop_signal();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *stop.borrow() {
                break;
            }

            let recovered = invoker.revalidate_offline().await;
            if !recovered.is_empty() {
                tracing::info!(servers = ?recovered, "offline servers back online");
            }
        }
        tracing::info!("health monitor stopped");
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::discovery::DiscoveryScanner;
    use super::super::transport::TransportSettings;
    use super::*;
    use crate::config::HostConfig;

    #[tokio::test]
    async fn test_on_demand_starts_nothing() {
        let invoker = Arc::new(ToolInvoker::from_config(&HostConfig::default()));
        assert!(start_health_policy(&invoker).is_none());
    }

    #[tokio::test]
    async fn test_periodic_policy_spawns_monitor() {
        let mut config = HostConfig::default();
        config.sources = Some(vec![]);
        config.health_check.mode = HealthCheckMode::Periodic;
        config.health_check.interval_secs = 1;
        let invoker = Arc::new(ToolInvoker::from_config(&config));

        let handle = start_health_policy(&invoker).unwrap();
        invoker.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let invoker = Arc::new(ToolInvoker::new(
            DiscoveryScanner::new(vec![]),
            TransportSettings::default(),
        ));
        let handle = spawn_health_monitor(Arc::clone(&invoker), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!handle.is_finished());

        invoker.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
