//! Drift Detector
//!
//! Periodically compares recorded load balancer state with what the
//! infrastructure reports and corrects the store. Each cycle runs VIP
//! reconciliation and then instance health reconciliation, sequentially.
//! Per-entity failures are logged and skipped.

use crate::config::DriftSettings;
use crate::domain::InfrastructureProviderRef;
use crate::error::{Error, Result};
use crate::model::{
    BackendState, Instance, LoadBalancer, ProvisioningStatus, StatusTag, STATUS_TAG_NAME,
};
use crate::store::Repositories;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Health Derivation
// =============================================================================

/// Derive a load balancer's provisioning status from its instance report
///
/// `tag` is `None` when the tag value is empty.
pub fn derive_instance_status(
    state: BackendState,
    tag: Option<&StatusTag>,
    staleness_threshold: chrono::Duration,
) -> Result<ProvisioningStatus> {
    let tag = match (state, tag) {
        (BackendState::Pending, _) => return Ok(ProvisioningStatus::PendingUpdate),
        (_, None) => return Ok(ProvisioningStatus::PendingUpdate),
        (_, Some(tag)) => tag,
    };

    let gap = tag.report_gap()?;
    let status = match state {
        BackendState::Provisioned => {
            if tag.is_uninitialized() {
                ProvisioningStatus::PendingUpdate
            } else if tag.diverges() && gap > staleness_threshold {
                ProvisioningStatus::Error
            } else {
                ProvisioningStatus::Active
            }
        }
        _ => {
            if gap < staleness_threshold {
                ProvisioningStatus::PendingUpdate
            } else {
                ProvisioningStatus::Error
            }
        }
    };
    Ok(status)
}

// =============================================================================
// Drift Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct DriftStats {
    pub cycles: AtomicU64,
    pub vips_corrected: AtomicU64,
    pub statuses_updated: AtomicU64,
    pub skipped: AtomicU64,
}

impl DriftStats {
    pub fn snapshot(&self) -> DriftStatsSnapshot {
        DriftStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            vips_corrected: self.vips_corrected.load(Ordering::Relaxed),
            statuses_updated: self.statuses_updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftStatsSnapshot {
    pub cycles: u64,
    pub vips_corrected: u64,
    pub statuses_updated: u64,
    pub skipped: u64,
}

/// Result of one detector cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub vips_checked: usize,
    pub vips_corrected: usize,
    pub instances_checked: usize,
    pub statuses_updated: usize,
    pub skipped: usize,
}

// =============================================================================
// Drift Detector
// =============================================================================

pub struct DriftDetector {
    settings: DriftSettings,
    repos: Repositories,
    infra: InfrastructureProviderRef,
    stats: DriftStats,
}

impl DriftDetector {
    pub fn new(settings: DriftSettings, repos: Repositories, infra: InfrastructureProviderRef) -> Arc<Self> {
        Arc::new(Self {
            settings,
            repos,
            infra,
            stats: DriftStats::default(),
        })
    }

    pub fn stats(&self) -> DriftStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run forever at the configured interval
    pub async fn run(self: Arc<Self>) {
        info!(
            "Drift detector running every {}s (staleness threshold {}s)",
            self.settings.interval_secs, self.settings.staleness_threshold_secs
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            debug!("Drift cycle complete: {:?}", report);
        }
    }

    /// One wake cycle: VIPs first, then instance health
    pub async fn run_cycle(&self) -> DriftReport {
        let mut report = DriftReport::default();
        self.reconcile_vips(&mut report).await;
        self.reconcile_instance_health(&mut report).await;

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .vips_corrected
            .fetch_add(report.vips_corrected as u64, Ordering::Relaxed);
        self.stats
            .statuses_updated
            .fetch_add(report.statuses_updated as u64, Ordering::Relaxed);
        self.stats.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        report
    }

    async fn reconcile_vips(&self, report: &mut DriftReport) {
        let lbs = match self.repos.loadbalancers.list().await {
            Ok(lbs) => lbs,
            Err(e) => {
                warn!("VIP reconciliation could not list loadbalancers: {}", e);
                return;
            }
        };

        for lb in lbs {
            report.vips_checked += 1;
            match self.reconcile_vip(&lb).await {
                Ok(true) => report.vips_corrected += 1,
                Ok(false) => {}
                Err(e) => {
                    report.skipped += 1;
                    warn!(loadbalancer_id = %lb.loadbalancer_id, "Skipping VIP check: {}", e);
                }
            }
        }
    }

    async fn reconcile_vip(&self, lb: &LoadBalancer) -> Result<bool> {
        let instance_id = match &lb.instance_id {
            Some(id) => id,
            None => return Ok(false),
        };

        let ports = self.infra.instance_ports(instance_id).await?;
        if ports.iter().any(|p| p.ip == lb.vip_address) {
            return Ok(false);
        }
        let live = match ports.first() {
            Some(port) => port.ip.clone(),
            None => return Ok(false),
        };

        info!(
            loadbalancer_id = %lb.loadbalancer_id,
            "VIP drift on instance {}: recorded {}, live {}", instance_id, lb.vip_address, live
        );
        let updated = self
            .repos
            .loadbalancers
            .modify(
                lb.id,
                Box::new(move |l: &mut LoadBalancer| {
                    l.vip_address = live;
                    l.touch();
                }),
            )
            .await?;
        Ok(updated.is_some())
    }

    async fn reconcile_instance_health(&self, report: &mut DriftReport) {
        let instances = match self.infra.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Health reconciliation could not list instances: {}", e);
                return;
            }
        };

        for instance in instances {
            report.instances_checked += 1;
            match self.reconcile_instance(&instance).await {
                Ok(true) => report.statuses_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    report.skipped += 1;
                    warn!("Skipping health check of instance {}: {}", instance.id, e);
                }
            }
        }
    }

    async fn reconcile_instance(&self, instance: &Instance) -> Result<bool> {
        let raw = match self.infra.get_tag(&instance.id, STATUS_TAG_NAME).await? {
            Some(raw) => raw,
            None => {
                return Err(Error::StatusTag(format!("no {} tag", STATUS_TAG_NAME)));
            }
        };
        let tag = StatusTag::parse(&raw)?;
        let threshold = chrono::Duration::seconds(self.settings.staleness_threshold_secs as i64);
        let status = derive_instance_status(instance.backend_state, tag.as_ref(), threshold)?;

        let instance_id = instance.id.clone();
        let owners = self
            .repos
            .loadbalancers
            .filter(&|l: &LoadBalancer| l.instance_id.as_ref() == Some(&instance_id))
            .await?;
        if owners.is_empty() {
            debug!("Instance {} is not bound to a loadbalancer", instance.id);
            return Ok(false);
        }

        for lb in owners {
            self.repos
                .loadbalancers
                .modify(
                    lb.id,
                    Box::new(move |l: &mut LoadBalancer| l.provisioning_status = status),
                )
                .await?;
            info!(
                loadbalancer_id = %lb.loadbalancer_id,
                "Instance {} reports provisioning status {}", instance.id, status
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InfrastructureProvider;
    use crate::infra::MemoryInfrastructure;
    use crate::model::{InstanceId, NetworkPort};

    fn tag(expected: &str, result: &str, gap_secs: u32) -> StatusTag {
        StatusTag {
            create_date: "2024-01-01 10:00:00".into(),
            update_date: format!("2024-01-01 10:00:{:02}", gap_secs),
            command: "service haproxy status".into(),
            expected_result: expected.into(),
            result: result.into(),
        }
    }

    fn threshold() -> chrono::Duration {
        chrono::Duration::seconds(30)
    }

    #[test]
    fn test_diverging_tag_past_threshold_is_error() {
        let stale = tag("ok", "fail", 40);
        assert_eq!(
            derive_instance_status(BackendState::Provisioned, Some(&stale), threshold()).unwrap(),
            ProvisioningStatus::Error
        );

        let fresh = tag("ok", "fail", 10);
        assert_eq!(
            derive_instance_status(BackendState::Provisioned, Some(&fresh), threshold()).unwrap(),
            ProvisioningStatus::Active
        );
    }

    #[test]
    fn test_uninitialized_and_pending() {
        let init = tag("ok", StatusTag::INITIALIZED, 50);
        assert_eq!(
            derive_instance_status(BackendState::Provisioned, Some(&init), threshold()).unwrap(),
            ProvisioningStatus::PendingUpdate
        );
        assert_eq!(
            derive_instance_status(BackendState::Provisioned, None, threshold()).unwrap(),
            ProvisioningStatus::PendingUpdate
        );
        let failing = tag("ok", "fail", 50);
        assert_eq!(
            derive_instance_status(BackendState::Pending, Some(&failing), threshold()).unwrap(),
            ProvisioningStatus::PendingUpdate
        );
    }

    #[test]
    fn test_failed_backend_escalates_after_threshold() {
        let early = tag("ok", "ok", 10);
        assert_eq!(
            derive_instance_status(BackendState::Failed, Some(&early), threshold()).unwrap(),
            ProvisioningStatus::PendingUpdate
        );
        let late = tag("ok", "ok", 45);
        assert_eq!(
            derive_instance_status(BackendState::Failed, Some(&late), threshold()).unwrap(),
            ProvisioningStatus::Error
        );
    }

    async fn setup(vip: &str, port_ip: &str) -> (Repositories, Arc<MemoryInfrastructure>, LoadBalancer) {
        let repos = Repositories::in_memory();
        let infra = MemoryInfrastructure::new();
        let instance_id = InstanceId::from("i-1");
        infra
            .register_instance(
                Instance::new(instance_id.clone(), "haproxy", BackendState::Provisioned),
                vec![NetworkPort {
                    instance_id: instance_id.clone(),
                    ip: port_ip.into(),
                    network: None,
                }],
            )
            .await
            .unwrap();

        let mut lb = LoadBalancer::new("lb-1".into(), "web", vip, "lbaas");
        lb.instance_id = Some(instance_id);
        let lb = repos.loadbalancers.insert(lb).await.unwrap();
        (repos, infra, lb)
    }

    #[tokio::test]
    async fn test_vip_drift_corrected() {
        let (repos, infra, lb) = setup("10.0.0.5", "10.0.0.9").await;
        let detector = DriftDetector::new(DriftSettings::default(), repos.clone(), infra);

        let report = detector.run_cycle().await;
        assert_eq!(report.vips_corrected, 1);

        let stored = repos.loadbalancers.get(lb.id).await.unwrap().unwrap();
        assert_eq!(stored.vip_address, "10.0.0.9");
        assert!(stored.updated_at > lb.updated_at);

        // Second cycle finds nothing to fix
        assert_eq!(detector.run_cycle().await.vips_corrected, 0);
    }

    #[tokio::test]
    async fn test_missing_tag_skips_instance() {
        let (repos, infra, lb) = setup("10.0.0.5", "10.0.0.5").await;
        let detector = DriftDetector::new(DriftSettings::default(), repos.clone(), infra);

        let report = detector.run_cycle().await;
        assert_eq!(report.instances_checked, 1);
        assert_eq!(report.statuses_updated, 0);
        assert_eq!(report.skipped, 1);

        let stored = repos.loadbalancers.get(lb.id).await.unwrap().unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::PendingCreate);
    }

    #[tokio::test]
    async fn test_tag_status_persisted_to_loadbalancer() {
        let (repos, infra, lb) = setup("10.0.0.5", "10.0.0.5").await;
        let stale = tag("haproxy is running.", "haproxy is not running.", 40);
        infra
            .put_tag(&InstanceId::from("i-1"), STATUS_TAG_NAME, stale.to_json().unwrap())
            .await
            .unwrap();
        let detector = DriftDetector::new(DriftSettings::default(), repos.clone(), infra.clone());

        let report = detector.run_cycle().await;
        assert_eq!(report.statuses_updated, 1);
        let stored = repos.loadbalancers.get(lb.id).await.unwrap().unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Error);

        // Malformed tag is skipped without touching the record
        infra
            .put_tag(&InstanceId::from("i-1"), STATUS_TAG_NAME, "{oops".into())
            .await
            .unwrap();
        let report = detector.run_cycle().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(detector.stats().cycles, 2);
    }

    #[tokio::test]
    async fn test_missing_instance_does_not_abort_cycle() {
        let (repos, infra, _) = setup("10.0.0.5", "10.0.0.9").await;
        let mut orphan = LoadBalancer::new("lb-2".into(), "orphan", "10.0.0.7", "lbaas");
        orphan.instance_id = Some(InstanceId::from("gone"));
        repos.loadbalancers.insert(orphan).await.unwrap();

        let detector = DriftDetector::new(DriftSettings::default(), repos, infra);
        let report = detector.run_cycle().await;
        assert_eq!(report.vips_checked, 2);
        assert_eq!(report.vips_corrected, 1);
        // Unreachable instance plus the untagged one
        assert_eq!(report.skipped, 2);
    }
}
