//! Periodic background work: health probing, rebalance checks and index
//! maintenance.
//!
//! Loops never mutate state directly, they go through the same components
//! callers use, so every change still lands as a published topology
//! snapshot.

use {
    crate::{
        error::ShardError,
        index::GlobalIndexCoordinator,
        query::executor::ShardAccess,
        rebalance::Rebalancer,
        router::ShardRouter,
        shard::{Shard, ShardId, ShardLoad, ShardStatus},
    },
    async_trait::async_trait,
    futures::future::join_all,
    parking_lot::Mutex,
    rapidhash::RapidHashMap,
    std::{sync::Arc, time::Duration},
    tokio::{sync::watch, task::JoinHandle},
    tracing::{debug, info, trace, warn},
};

/// Health-check transport.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Current load of a reachable shard.
    async fn probe(&self, shard: &Shard) -> Result<ShardLoad, ShardError>;
}

/// Result of one health round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: Vec<ShardId>,
    pub unreachable: Vec<ShardId>,
    /// Shards marked failed during this round.
    pub failed: Vec<ShardId>,
    /// Failed shards answering again, set back to active.
    pub recovered: Vec<ShardId>,
}

/// Probes every shard and turns the answers into load figures and status
/// changes.
///
/// A shard is marked `Failed` after `failure_threshold` consecutive failed
/// probes, and brought back to `Active` on its first successful one.
/// Shards in maintenance are left alone.
pub struct HealthMonitor {
    router: Arc<ShardRouter>,
    probe: Arc<dyn HealthProbe>,
    failure_threshold: u32,
    timeout: Duration,
    failures: Mutex<RapidHashMap<ShardId, u32>>,
}

impl HealthMonitor {
    pub fn new(router: Arc<ShardRouter>, probe: Arc<dyn HealthProbe>) -> Self {
        let failure_threshold = router.config().failure_threshold;
        let timeout = router.config().step_timeout();
        Self {
            router,
            probe,
            failure_threshold,
            timeout,
            failures: Mutex::new(RapidHashMap::default()),
        }
    }

    /// Consecutive failed probes of a shard.
    pub fn failures(&self, shard: &ShardId) -> u32 {
        self.failures.lock().get(shard).copied().unwrap_or(0)
    }

    /// Probes all shards concurrently and applies the outcome.
    pub async fn check(&self) -> HealthReport {
        let topology = self.router.topology().load();
        let shards: Vec<&Shard> = topology
            .registry
            .iter()
            .filter(|shard| shard.status != ShardStatus::Maintenance)
            .collect();

        let probes = shards.iter().map(|shard| async move {
            let outcome = match tokio::time::timeout(self.timeout, self.probe.probe(shard)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ShardError::Timeout(self.timeout)),
            };
            (*shard, outcome)
        });
        let outcomes = join_all(probes).await;

        let mut report = HealthReport::default();
        let mut loads = Vec::new();
        let mut changes = Vec::new();
        {
            let mut failures = self.failures.lock();
            for (shard, outcome) in outcomes {
                let id = shard.id().clone();
                match outcome {
                    Ok(load) => {
                        failures.remove(&id);
                        loads.push((id.clone(), load));
                        if shard.status == ShardStatus::Failed {
                            changes.push((id.clone(), ShardStatus::Active));
                            report.recovered.push(id.clone());
                        }
                        report.healthy.push(id);
                    }
                    Err(err) => {
                        let count = failures.entry(id.clone()).or_insert(0);
                        *count += 1;
                        warn!(shard_id = %id, failures = *count, error = %err, "Health probe failed");
                        if *count >= self.failure_threshold && shard.status != ShardStatus::Failed {
                            changes.push((id.clone(), ShardStatus::Failed));
                            report.failed.push(id.clone());
                        }
                        report.unreachable.push(id);
                    }
                }
            }
        }

        self.router.update_loads(&loads);
        for (id, status) in changes {
            // The shard may have been removed since the snapshot was taken.
            if let Err(err) = self.router.set_status(&id, status) {
                debug!(shard_id = %id, error = %err, "Skipping status change");
            }
        }
        trace!(
            healthy = report.healthy.len(),
            unreachable = report.unreachable.len(),
            "Health round completed"
        );
        report
    }
}

/// Handles of the running background loops.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Starts the health, rebalance and index loops.
    pub fn spawn(
        health: Arc<HealthMonitor>,
        rebalancer: Arc<Rebalancer>,
        indexes: Arc<GlobalIndexCoordinator>,
        access: Arc<dyn ShardAccess>,
    ) -> Self {
        let config = health.router.config().clone();
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            spawn_health_loop(health, config.health_interval(), rx.clone()),
            spawn_rebalance_loop(rebalancer, config.rebalance_interval(), rx.clone()),
            spawn_index_loop(indexes, access, config.index_stats_interval(), rx),
        ];
        info!("Background tasks started");
        Self { shutdown, handles }
    }

    /// Signals every loop to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                warn!(error = %err, "Background task panicked");
            }
        }
        info!("Background tasks stopped");
    }
}

/// Runs `round` every `period` until shutdown is signalled.
///
/// The first round runs one full period after start.
fn spawn_loop<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut round: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => round().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "Background loop stopped");
    })
}

/// Periodic health probing.
pub fn spawn_health_loop(
    health: Arc<HealthMonitor>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("health", period, shutdown, move || {
        let health = health.clone();
        async move {
            health.check().await;
        }
    })
}

/// Periodic imbalance check; plans and executes a rebalance when needed.
pub fn spawn_rebalance_loop(
    rebalancer: Arc<Rebalancer>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("rebalance", period, shutdown, move || {
        let rebalancer = rebalancer.clone();
        async move {
            if !rebalancer.should_rebalance() {
                trace!("Cluster balanced");
                return;
            }
            let plan = match rebalancer.initiate_rebalancing() {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(error = %err, "Failed to plan rebalancing");
                    return;
                }
            };
            match rebalancer.execute_plan(plan).await {
                Ok(report) => debug!(
                    plan_id = %plan,
                    completed = report.completed,
                    failed = report.failed,
                    "Rebalance round finished"
                ),
                Err(err) => warn!(plan_id = %plan, error = %err, "Rebalance round failed"),
            }
        }
    })
}

/// Periodic flush of asynchronous index updates and statistics refresh.
pub fn spawn_index_loop(
    indexes: Arc<GlobalIndexCoordinator>,
    access: Arc<dyn ShardAccess>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("index", period, shutdown, move || {
        let indexes = indexes.clone();
        let access = access.clone();
        async move {
            let applied = indexes.flush_pending(access.as_ref()).await;
            if applied > 0 {
                debug!(applied, "Asynchronous index updates applied");
            }
            indexes.refresh_stats();
        }
    })
}
