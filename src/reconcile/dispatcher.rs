//! Reconciliation Dispatcher
//!
//! Mutations enqueue a [`ResyncTask`] on a bounded queue and return
//! immediately. A fixed pool of workers drains the queue, finds every
//! load balancer that transitively references the changed entity, touches
//! it so the sync pipeline re-evaluates it, and recomputes its status.
//! A full queue never blocks the caller: the task is retried once after
//! the delay its error's [`ErrorAction`] names, then dropped with a warning.

use crate::config::DispatcherSettings;
use crate::error::{Error, ErrorAction, Result};
use crate::model::{EntityKind, LoadBalancer, Pool, RecordId};
use crate::reconcile::StatusAggregator;
use crate::store::Repositories;
use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Resync Tasks
// =============================================================================

/// A change that may require downstream load balancers to resync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncTask {
    LoadBalancerChanged { loadbalancer: RecordId },
    ListenerChanged { listener: RecordId },
    PoolChanged { pool: RecordId },
    /// Members are resolved through their owning pool, which survives deletes
    MemberChanged { pool: RecordId },
    HealthMonitorChanged { health_monitor: RecordId },
}

impl ResyncTask {
    pub fn kind(&self) -> EntityKind {
        match self {
            ResyncTask::LoadBalancerChanged { .. } => EntityKind::LoadBalancer,
            ResyncTask::ListenerChanged { .. } => EntityKind::Listener,
            ResyncTask::PoolChanged { .. } => EntityKind::Pool,
            ResyncTask::MemberChanged { .. } => EntityKind::Member,
            ResyncTask::HealthMonitorChanged { .. } => EntityKind::HealthMonitor,
        }
    }

    fn target(&self) -> RecordId {
        match self {
            ResyncTask::LoadBalancerChanged { loadbalancer } => *loadbalancer,
            ResyncTask::ListenerChanged { listener } => *listener,
            ResyncTask::PoolChanged { pool } => *pool,
            ResyncTask::MemberChanged { pool } => *pool,
            ResyncTask::HealthMonitorChanged { health_monitor } => *health_monitor,
        }
    }
}

// =============================================================================
// Dispatcher Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub enqueued: AtomicU64,
    pub deferred: AtomicU64,
    pub dropped: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub loadbalancers_touched: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            loadbalancers_touched: self.loadbalancers_touched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub enqueued: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub processed: u64,
    pub failed: u64,
    pub loadbalancers_touched: u64,
}

// =============================================================================
// Resync Dispatcher
// =============================================================================

pub struct ResyncDispatcher {
    settings: DispatcherSettings,
    repos: Repositories,
    aggregator: StatusAggregator,
    sender: mpsc::Sender<ResyncTask>,
    receiver: Arc<Mutex<mpsc::Receiver<ResyncTask>>>,
    stats: Arc<DispatcherStats>,
    shutdown: CancellationToken,
}

impl ResyncDispatcher {
    pub fn new(settings: DispatcherSettings, repos: Repositories, aggregator: StatusAggregator) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        Arc::new(Self {
            settings,
            repos,
            aggregator,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            stats: Arc::new(DispatcherStats::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting resync dispatcher with {} workers", self.settings.workers);
        (0..self.settings.workers.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.worker_loop(worker).await })
            })
            .collect()
    }

    /// Stop all workers; queued tasks are abandoned
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Enqueue a task without waiting. Failures are logged, never returned.
    pub fn dispatch(&self, task: ResyncTask) {
        let e = match self.try_dispatch(task) {
            Ok(()) => return,
            Err(e) => e,
        };
        let delay = match e.action() {
            ErrorAction::RequeueAfter(delay) => delay,
            _ => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Resync dispatch failed: {}", e);
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Resync dispatch failed outside a runtime: {}", e);
            return;
        };

        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        debug!("{}, retrying in {:?}", e, delay);
        let sender = self.sender.clone();
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = enqueue(&sender, &stats, task) {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Resync task dropped: {}", e);
            }
        });
    }

    /// Enqueue a task, reporting backpressure to the caller
    pub fn try_dispatch(&self, task: ResyncTask) -> Result<()> {
        enqueue(&self.sender, &self.stats, task)
    }

    async fn worker_loop(&self, worker: usize) {
        debug!("Resync worker {} started", worker);
        loop {
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                task = async { self.receiver.lock().await.recv().await } => task,
            };
            let task = match task {
                Some(task) => task,
                None => break,
            };

            match self.process_with_retry(task).await {
                Ok(touched) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                    debug!("Resync {:?} touched {} loadbalancers", task, touched);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Resync {:?} failed for {}/{}: {}", task, task.kind(), task.target(), e);
                }
            }
        }
        debug!("Resync worker {} stopped", worker);
    }

    async fn process_with_retry(&self, task: ResyncTask) -> Result<usize> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.settings.max_retry_elapsed()),
            ..Default::default()
        };
        backoff::future::retry(policy, move || async move {
            self.process(task).await.map_err(Error::into_backoff)
        })
        .await
    }

    /// Resync every load balancer affected by a task. Returns how many were touched.
    pub async fn process(&self, task: ResyncTask) -> Result<usize> {
        let affected = self.affected_loadbalancers(task).await?;
        let mut touched = 0;

        for lb_id in affected {
            let updated = self
                .repos
                .loadbalancers
                .modify(lb_id, Box::new(|lb: &mut LoadBalancer| lb.touch()))
                .await?;
            // Deleted concurrently
            if updated.is_none() {
                continue;
            }
            self.aggregator.recompute_loadbalancer_status(lb_id).await?;
            touched += 1;
        }

        self.stats
            .loadbalancers_touched
            .fetch_add(touched as u64, Ordering::Relaxed);
        Ok(touched)
    }

    async fn affected_loadbalancers(&self, task: ResyncTask) -> Result<Vec<RecordId>> {
        let lbs = match task {
            ResyncTask::LoadBalancerChanged { loadbalancer } => {
                return Ok(vec![loadbalancer]);
            }
            ResyncTask::ListenerChanged { listener } => {
                self.repos
                    .loadbalancers
                    .filter(&|lb: &LoadBalancer| lb.listener == Some(listener))
                    .await?
            }
            ResyncTask::PoolChanged { pool } | ResyncTask::MemberChanged { pool } => {
                self.repos
                    .loadbalancers
                    .filter(&|lb: &LoadBalancer| lb.pool == Some(pool))
                    .await?
            }
            ResyncTask::HealthMonitorChanged { health_monitor } => {
                let pools: Vec<RecordId> = self
                    .repos
                    .pools
                    .filter(&|p: &Pool| p.health_monitor == Some(health_monitor))
                    .await?
                    .into_iter()
                    .map(|p| p.id)
                    .collect();
                self.repos
                    .loadbalancers
                    .filter(&|lb: &LoadBalancer| lb.pool.map_or(false, |p| pools.contains(&p)))
                    .await?
            }
        };
        Ok(lbs.into_iter().map(|lb| lb.id).collect())
    }
}

fn enqueue(sender: &mpsc::Sender<ResyncTask>, stats: &DispatcherStats, task: ResyncTask) -> Result<()> {
    match sender.try_send(task) {
        Ok(()) => {
            stats.enqueued.fetch_add(1, Ordering::Relaxed);
            debug!("Enqueued resync task {:?}", task);
            Ok(())
        }
        Err(mpsc::error::TrySendError::Full(task)) => Err(Error::ResyncQueueFull {
            kind: task.kind(),
            id: task.target().to_string(),
        }),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::DispatcherClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthMonitor, Listener, Member, ProvisioningStatus, PublicId};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        repos: Repositories,
        lb: LoadBalancer,
        pool: RecordId,
        hm: RecordId,
        listener: RecordId,
    }

    async fn fixture() -> Fixture {
        let repos = Repositories::in_memory();
        let hm = repos
            .health_monitors
            .insert(HealthMonitor::new("hm".into(), "hm", "HTTP", 5, 3, 2))
            .await
            .unwrap();
        let mut pool = Pool::new("pool".into(), "pool", "ROUND_ROBIN", "HTTP");
        pool.health_monitor = Some(hm.id);
        let pool = repos.pools.insert(pool).await.unwrap();
        repos
            .members
            .insert(Member::new("m1".into(), pool.id, "10.0.1.1", 80))
            .await
            .unwrap();
        let listener = repos
            .listeners
            .insert(Listener::new("l".into(), "l", "HTTP", 80, 8080))
            .await
            .unwrap();
        let mut lb = LoadBalancer::new(PublicId::from("lb"), "lb", "10.0.0.5", "lbaas");
        lb.listener = Some(listener.id);
        lb.pool = Some(pool.id);
        let lb = repos.loadbalancers.insert(lb).await.unwrap();

        Fixture {
            repos,
            lb,
            pool: pool.id,
            hm: hm.id,
            listener: listener.id,
        }
    }

    fn dispatcher(repos: &Repositories, settings: DispatcherSettings) -> Arc<ResyncDispatcher> {
        ResyncDispatcher::new(settings, repos.clone(), StatusAggregator::new(repos.clone()))
    }

    #[tokio::test]
    async fn test_health_monitor_change_touches_loadbalancer() {
        let f = fixture().await;
        let d = dispatcher(&f.repos, DispatcherSettings::default());

        let touched = d
            .process(ResyncTask::HealthMonitorChanged { health_monitor: f.hm })
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let lb = f.repos.loadbalancers.get(f.lb.id).await.unwrap().unwrap();
        assert!(lb.updated_at > f.lb.updated_at);
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_unrelated_change_touches_nothing() {
        let f = fixture().await;
        let spare = f
            .repos
            .listeners
            .insert(Listener::new("spare".into(), "spare", "TCP", 22, 8022))
            .await
            .unwrap();
        let d = dispatcher(&f.repos, DispatcherSettings::default());

        assert_eq!(
            d.process(ResyncTask::ListenerChanged { listener: spare.id }).await.unwrap(),
            0
        );
        assert_eq!(
            d.process(ResyncTask::ListenerChanged { listener: f.listener }).await.unwrap(),
            1
        );
        assert_eq!(d.process(ResyncTask::MemberChanged { pool: f.pool }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_defers_then_drops_without_blocking() {
        let f = fixture().await;
        let settings = DispatcherSettings {
            workers: 1,
            queue_capacity: 1,
            ..Default::default()
        };
        // Workers not started, so only the test drains the queue
        let d = dispatcher(&f.repos, settings);

        d.try_dispatch(ResyncTask::PoolChanged { pool: f.pool }).unwrap();
        let err = d.try_dispatch(ResyncTask::PoolChanged { pool: f.pool }).unwrap_err();
        assert_matches!(err, Error::ResyncQueueFull { kind: EntityKind::Pool, .. });

        // Both deferred; after the delay only one fits
        d.dispatch(ResyncTask::ListenerChanged { listener: f.listener });
        d.dispatch(ResyncTask::HealthMonitorChanged { health_monitor: f.hm });
        assert_eq!(d.stats().deferred, 2);
        assert_eq!(d.stats().dropped, 0);

        let first = d.receiver.lock().await.recv().await;
        assert_eq!(first, Some(ResyncTask::PoolChanged { pool: f.pool }));

        let mut stats = d.stats();
        for _ in 0..300 {
            stats = d.stats();
            if stats.enqueued + stats.dropped == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_deferred_task_dropped_on_shutdown() {
        let f = fixture().await;
        let settings = DispatcherSettings {
            workers: 1,
            queue_capacity: 1,
            ..Default::default()
        };
        let d = dispatcher(&f.repos, settings);

        d.try_dispatch(ResyncTask::PoolChanged { pool: f.pool }).unwrap();
        d.dispatch(ResyncTask::PoolChanged { pool: f.pool });
        d.shutdown();

        for _ in 0..100 {
            if d.stats().dropped == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(d.stats().dropped, 1);
        assert_eq!(d.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let f = fixture().await;
        let d = dispatcher(&f.repos, DispatcherSettings::default());
        let handles = d.start();

        d.dispatch(ResyncTask::PoolChanged { pool: f.pool });

        let mut processed = 0;
        for _ in 0..100 {
            processed = d.stats().processed;
            if processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processed, 1);
        assert_eq!(d.stats().loadbalancers_touched, 1);

        d.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
