//! Collector lifecycle: construct monitors, schedule the periodic jobs,
//! and shut everything down cooperatively.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clients::fl_server::FlServerClient;
use crate::clients::policy_engine::PolicyEngineClient;
use crate::clients::sdn::SdnControllerClient;
use crate::flow::FlowManager;
use crate::models::Config;
use crate::monitors::event::EventMonitor;
use crate::monitors::fl::FlMonitor;
use crate::monitors::network::NetworkMonitor;
use crate::monitors::policy::PolicyMonitor;
use crate::storage::MetricsStorage;

pub struct Collector {
    pub config: Arc<Config>,
    pub storage: Arc<MetricsStorage>,
    pub fl_client: FlServerClient,
    pub policy_client: Arc<PolicyEngineClient>,
    pub policy_monitor: Option<Arc<PolicyMonitor>>,
    pub fl_monitor: Option<Arc<FlMonitor>>,
    pub network_monitor: Option<Arc<NetworkMonitor>>,
    pub event_monitor: Option<Arc<EventMonitor>>,
    pub flow_manager: Option<Arc<FlowManager>>,
}

impl Collector {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        info!("Initializing Collector...");
        info!("Policy Engine URL set to: {}", config.policy_engine_url);
        info!("FL Server URL set to: {}", config.fl_server_url);

        let storage = Arc::new(MetricsStorage::new(
            &config.metrics_output_dir,
            config.metrics_max_age_days,
            config.events_max_age_days,
            config.cleanup_interval_hours,
        )?);

        let fl_client =
            FlServerClient::new(&config.fl_server_url).context("Failed to build FL client")?;
        let policy_client = PolicyEngineClient::new(&config.policy_engine_url)?;

        let policy_monitor = if config.policy_monitor_enabled {
            let monitor = PolicyMonitor::new(&config.policy_engine_url, storage.clone())?;
            info!("Policy monitor initialized");
            Some(Arc::new(monitor))
        } else {
            None
        };

        let fl_monitor = if config.fl_monitor_enabled {
            let monitor = FlMonitor::new(
                fl_client.clone(),
                storage.clone(),
                config.fl_interval_sec,
                &config.training_mode,
            );
            info!(
                "FL monitor initialized with {}s interval for {} mode",
                config.fl_interval_sec, config.training_mode
            );
            Some(monitor)
        } else {
            None
        };

        let network_monitor = if config.network_monitor_enabled {
            let sdn = SdnControllerClient::new(&config.sdn_controller_url)?;
            info!(
                "Network monitor initialized with SDN Controller at {}",
                config.sdn_controller_url
            );
            Some(Arc::new(NetworkMonitor::new(storage.clone(), sdn)))
        } else {
            None
        };

        let event_monitor = if config.event_monitor_enabled {
            let sdn = SdnControllerClient::new(&config.sdn_controller_url)?;
            let monitor = EventMonitor::new(
                storage.clone(),
                fl_client.clone(),
                &config.policy_engine_url,
                sdn,
                network_monitor.clone(),
                (
                    config.fl_interval_sec,
                    config.policy_interval_sec,
                    config.network_interval_sec,
                ),
            )?;
            Some(Arc::new(monitor))
        } else {
            None
        };

        let flow_manager = if config.flow_manager_enabled {
            let sdn = SdnControllerClient::new(&config.sdn_controller_url)?;
            Some(FlowManager::new(sdn, config.clone(), policy_client.clone()))
        } else {
            None
        };

        info!("All enabled monitors initialized");
        Ok(Self {
            config,
            storage,
            fl_client,
            policy_client,
            policy_monitor,
            fl_monitor,
            network_monitor,
            event_monitor,
            flow_manager,
        })
    }

    /// Startup gate against the Policy Engine. An explicit deny blocks only
    /// in strict mode; a dead engine never blocks startup.
    pub async fn check_policy(&self) -> bool {
        if !self.config.check_policy_enabled {
            info!("Policy checks disabled. Proceeding with collection.");
            return true;
        }
        self.policy_client
            .check_collection_allowed(self.config.strict_policy_mode)
            .await
    }

    /// Spawn every periodic job and long-lived worker.
    pub fn spawn_jobs(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(monitor) = &self.fl_monitor {
            // FL collection is event-driven; the monitor owns its worker.
            handles.push(tokio::spawn(monitor.clone().run(shutdown.clone())));
            info!("FL event-based monitoring started");
        }

        if let Some(monitor) = &self.policy_monitor {
            handles.push(tokio::spawn(policy_metrics_polling(
                monitor.clone(),
                self.storage.clone(),
                self.config.policy_interval_sec,
                shutdown.clone(),
            )));
            info!(
                "Policy metrics collection scheduled every {} seconds",
                self.config.policy_interval_sec
            );
        }

        if let Some(monitor) = &self.network_monitor {
            handles.push(tokio::spawn(network_metrics_polling(
                monitor.clone(),
                self.config.network_interval_sec,
                shutdown.clone(),
            )));
            info!(
                "Network metrics collection scheduled every {} seconds",
                self.config.network_interval_sec
            );
        }

        if let Some(monitor) = &self.event_monitor {
            handles.push(tokio::spawn(event_collection_polling(
                monitor.clone(),
                self.config.event_interval_sec,
                shutdown.clone(),
            )));
            info!(
                "Event collection scheduled every {} seconds",
                self.config.event_interval_sec
            );
        }

        if let Some(flow_manager) = &self.flow_manager {
            handles.push(tokio::spawn(flow_manager.clone().run(shutdown.clone())));
            handles.push(tokio::spawn(
                self.policy_client
                    .clone()
                    .run_refresher(self.config.policy_interval_sec, shutdown.clone()),
            ));
            info!("Flow manager and policy refresher started");
        }

        info!("Scheduler setup completed with event-based FL monitoring");
        handles
    }
}

async fn policy_metrics_polling(
    monitor: Arc<PolicyMonitor>,
    storage: Arc<MetricsStorage>,
    interval_sec: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_sec.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if monitor.collect_metrics().await {
                    debug!("Policy metrics collection completed");
                } else {
                    // Error-state metric preserves observability while the
                    // engine is down.
                    error!("Error collecting policy metrics");
                    storage.store_metric("policy_engine", &json!({
                        "status": "error",
                        "timestamp": Utc::now().timestamp(),
                        "error": "policy engine metrics collection failed",
                    }));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Policy metrics polling stopping");
                    break;
                }
            }
        }
    }
}

async fn network_metrics_polling(
    monitor: Arc<NetworkMonitor>,
    interval_sec: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_sec.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A disconnected controller already stores a degraded-state
                // network metric; surface it in the scheduler log too.
                let metrics = monitor.collect_metrics().await;
                if metrics.get("status").and_then(|s| s.as_str()) == Some("error") {
                    error!("Network metrics collection reported a disconnected SDN controller");
                } else {
                    debug!("Network metrics collection completed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Network metrics polling stopping");
                    break;
                }
            }
        }
    }
}

async fn event_collection_polling(
    monitor: Arc<EventMonitor>,
    interval_sec: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_sec.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Per-source failures already produce POLL_TARGET_FAILURE
                // self-events; nothing extra to record here.
                monitor.collect_all().await;
                debug!("Event collection completed");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Event collection polling stopping");
                    break;
                }
            }
        }
    }
}
