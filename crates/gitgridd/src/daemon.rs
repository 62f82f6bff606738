//! Component assembly and the daemon run loop.
//!
//! In this mode, the daemon:
//! 1. Opens the redb state store under `storage.data_dir`
//! 2. Builds the routing engine, queue, and capacity manager
//! 3. Starts the background loops that are enabled
//! 4. Serves the REST API until Ctrl-C

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gitgrid_api::{ApiState, AuthConfig, build_router};
use gitgrid_capacity::{Autoscaler, Backfill, Provisioner, Rebalancer, RepositoryEvents};
use gitgrid_core::GitgridConfig;
use gitgrid_metrics::{NoopMetrics, ReplicationCounters, ReplicationMetrics, TrafficTracker};
use gitgrid_notify::{NoopNotifier, Notifier, WebhookNotifier};
use gitgrid_queue::{
    DeadLetterReprocessor, Enqueuer, GitMirrorExecutor, PriorityPolicy, ReplicationWorker,
    StaleTaskReconciler, TaskProcessor,
};
use gitgrid_routing::{NodeRegistry, RoutingEngine, RoutingSettings, policy_for};
use gitgrid_state::{StateStore, epoch_millis};

use crate::periodic::{PeriodicHandle, PeriodicTask};

const DB_FILE: &str = "gitgrid.redb";

/// Every long-lived component, wired together.
pub struct Components {
    pub config: GitgridConfig,
    pub store: StateStore,
    pub traffic: TrafficTracker,
    pub counters: Arc<ReplicationCounters>,
    pub engine: Arc<RoutingEngine>,
    pub registry: Arc<NodeRegistry>,
    pub enqueuer: Arc<Enqueuer>,
    pub worker: Arc<ReplicationWorker>,
    pub dead_letters: Arc<DeadLetterReprocessor>,
    pub reconciler: Option<Arc<StaleTaskReconciler>>,
    pub rebalancer: Arc<Rebalancer>,
    pub autoscaler: Arc<Autoscaler>,
    pub provisioner: Arc<Provisioner>,
    pub backfill: Arc<Backfill>,
    pub events: Arc<RepositoryEvents>,
}

impl Components {
    pub fn assemble(config: GitgridConfig, store: StateStore) -> anyhow::Result<Self> {
        let traffic = TrafficTracker::new();
        let counters = Arc::new(ReplicationCounters::new());
        let metrics: Arc<dyn ReplicationMetrics> = if config.replication.enabled {
            counters.clone()
        } else {
            Arc::new(NoopMetrics)
        };

        let notifier: Arc<dyn Notifier> = if config.notify.webhook_url.trim().is_empty() {
            Arc::new(NoopNotifier)
        } else {
            Arc::new(WebhookNotifier::new(
                config.notify.webhook_url.trim(),
                Duration::from_millis(config.notify.timeout_ms),
            )?)
        };

        let engine = Arc::new(RoutingEngine::new(
            store.clone(),
            policy_for(config.routing.lag_mode),
            RoutingSettings::from_config(&config.routing),
            metrics.clone(),
            notifier.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            Duration::from_secs(config.registry.heartbeat_timeout_secs),
        ));

        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            traffic.clone(),
            PriorityPolicy::from_config(&config.priority),
            metrics.clone(),
        ));
        let executor = Arc::new(GitMirrorExecutor::new(store.clone(), &config.replication));
        let processor = Arc::new(TaskProcessor::new(
            store.clone(),
            executor,
            metrics.clone(),
            config.replication.max_attempts,
        ));
        let worker = Arc::new(ReplicationWorker::new(
            store.clone(),
            config.node.id.clone(),
            processor,
            metrics.clone(),
            config.replication.batch_size,
            config.replication.parallelism,
        ));
        let dead_letters = Arc::new(DeadLetterReprocessor::new(
            store.clone(),
            notifier.clone(),
            config.dead_letter.batch_size,
        ));
        let reconciler = config
            .replication
            .stale_running_after_secs
            .map(|secs| Arc::new(StaleTaskReconciler::new(store.clone(), Duration::from_secs(secs))));

        let capacity = &config.capacity;
        let rebalancer = Arc::new(Rebalancer::new(
            store.clone(),
            engine.clone(),
            enqueuer.clone(),
            capacity.rebalance.clone(),
            config.routing.lag_mode,
            capacity.enabled,
        ));
        let autoscaler = Arc::new(Autoscaler::new(
            store.clone(),
            traffic.clone(),
            enqueuer.clone(),
            capacity.autoscale.clone(),
            capacity.enabled,
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            registry.clone(),
            enqueuer.clone(),
            capacity.provision.seed_nodes.clone(),
            capacity.enabled,
        ));
        let backfill = Arc::new(Backfill::new(store.clone()));
        let events = Arc::new(RepositoryEvents::new(
            store.clone(),
            enqueuer.clone(),
            provisioner.clone(),
        ));

        Ok(Self {
            config,
            store,
            traffic,
            counters,
            engine,
            registry,
            enqueuer,
            worker,
            dead_letters,
            reconciler,
            rebalancer,
            autoscaler,
            provisioner,
            backfill,
            events,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            traffic: self.traffic.clone(),
            counters: self.counters.clone(),
            events: self.events.clone(),
            backfill: self.backfill.clone(),
            dead_letters: self.dead_letters.clone(),
            auth: AuthConfig {
                admin_key: self.config.api.admin_key.trim().to_string(),
                route_secret: self.config.api.route_secret.trim().to_string(),
            },
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.api_state())
    }

    /// Start every enabled background loop.
    pub fn spawn_loops(&self, shutdown: &watch::Receiver<bool>) -> Vec<PeriodicHandle> {
        let config = &self.config;
        let mut handles = Vec::new();

        if config.replication.enabled {
            let worker = self.worker.clone();
            handles.push(
                PeriodicTask::new("replication-worker", secs(config.replication.poll_interval_secs))
                    .spawn(shutdown.clone(), move || {
                        let worker = worker.clone();
                        async move {
                            worker.poll_once().await?;
                            Ok(())
                        }
                    }),
            );

            let dead_letters = self.dead_letters.clone();
            handles.push(
                PeriodicTask::new("dead-letter-reprocess", secs(config.dead_letter.reprocess_interval_secs))
                    .spawn(shutdown.clone(), move || {
                        let dead_letters = dead_letters.clone();
                        async move {
                            dead_letters.reprocess_batch(epoch_millis())?;
                            Ok(())
                        }
                    }),
            );

            if let Some(reconciler) = &self.reconciler {
                let reconciler = reconciler.clone();
                handles.push(
                    PeriodicTask::new("stale-task-reconciler", secs(config.replication.reconcile_interval_secs))
                        .spawn(shutdown.clone(), move || {
                            let reconciler = reconciler.clone();
                            async move {
                                reconciler.reconcile(epoch_millis())?;
                                Ok(())
                            }
                        }),
                );
            }
        } else {
            info!("replication disabled, worker loops not started");
        }

        let traffic = self.traffic.clone();
        handles.push(
            PeriodicTask::new("traffic-decay", secs(config.traffic.decay_interval_secs)).spawn(
                shutdown.clone(),
                move || {
                    let traffic = traffic.clone();
                    async move {
                        traffic.decay().await;
                        Ok(())
                    }
                },
            ),
        );

        let registry = self.registry.clone();
        let engine = self.engine.clone();
        handles.push(
            PeriodicTask::new("node-reaper", secs(config.registry.reap_interval_secs)).spawn(
                shutdown.clone(),
                move || {
                    let registry = registry.clone();
                    let engine = engine.clone();
                    async move {
                        for node_id in registry.reap_stale(epoch_millis())? {
                            engine.invalidate_node(&node_id).await;
                        }
                        Ok(())
                    }
                },
            ),
        );

        let capacity = &config.capacity;
        if !capacity.enabled {
            info!("capacity management disabled, capacity loops not started");
            return handles;
        }

        let rebalancer = self.rebalancer.clone();
        handles.push(
            PeriodicTask::new("rebalancer", secs(capacity.rebalance.interval_secs)).spawn(
                shutdown.clone(),
                move || {
                    let rebalancer = rebalancer.clone();
                    async move {
                        rebalancer.run_once(epoch_millis()).await?;
                        Ok(())
                    }
                },
            ),
        );

        let autoscaler = self.autoscaler.clone();
        handles.push(
            PeriodicTask::new("autoscaler", secs(capacity.autoscale.interval_secs)).spawn(
                shutdown.clone(),
                move || {
                    let autoscaler = autoscaler.clone();
                    async move {
                        autoscaler.run_once(epoch_millis()).await?;
                        Ok(())
                    }
                },
            ),
        );

        let provisioner = self.provisioner.clone();
        handles.push(
            PeriodicTask::new("provisioner", secs(capacity.provision.interval_secs)).spawn(
                shutdown.clone(),
                move || {
                    let provisioner = provisioner.clone();
                    async move {
                        provisioner.run_once(epoch_millis()).await?;
                        Ok(())
                    }
                },
            ),
        );

        if capacity.backfill.scheduled {
            let backfill = self.backfill.clone();
            handles.push(
                PeriodicTask::new("backfill", secs(capacity.backfill.interval_secs)).spawn(
                    shutdown.clone(),
                    move || {
                        let backfill = backfill.clone();
                        async move {
                            backfill.run(epoch_millis())?;
                            Ok(())
                        }
                    },
                ),
            );
        }

        handles
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: GitgridConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node.id, "GitGrid daemon starting");
    for warning in config.validate()? {
        warn!("{warning}");
    }

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let db_path = config.storage.data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let port = config.api.port;
    let command_timeout = Duration::from_secs(config.replication.command_timeout_secs);
    let components = Components::assemble(config, store)?;
    info!(
        routing = components.config.routing.enabled,
        replication = components.config.replication.enabled,
        capacity = components.config.capacity.enabled,
        "components assembled"
    );

    // ── Background loops ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = components.spawn_loops(&shutdown_rx);
    info!(loops = handles.len(), "background loops started");

    // ── REST API server ──────────────────────────────────────────
    let router = components.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // ── Clean up ─────────────────────────────────────────────────
    for handle in handles {
        handle.join().await;
    }
    if tokio::time::timeout(command_timeout, components.worker.wait_idle())
        .await
        .is_err()
    {
        warn!(in_flight = components.worker.in_flight(), "replication tasks still running at shutdown");
    }

    info!("GitGrid daemon stopped");
    Ok(())
}
