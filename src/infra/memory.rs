//! In-Memory Infrastructure Provider
//!
//! Tracks backing instances, their network ports and their tags. Deleting an
//! instance marks it deleted and drops its ports and tags.

use crate::domain::InfrastructureProvider;
use crate::error::{Error, Result};
use crate::model::{Instance, InstanceId, NetworkPort};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct InstanceRecord {
    instance: Instance,
    ports: Vec<NetworkPort>,
    tags: IndexMap<String, String>,
}

/// Infrastructure provider holding observed state in memory
#[derive(Default)]
pub struct MemoryInfrastructure {
    instances: DashMap<InstanceId, InstanceRecord>,
}

impl MemoryInfrastructure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn not_found(id: &InstanceId) -> Error {
        Error::InstanceNotFound {
            instance_id: id.to_string(),
        }
    }
}

#[async_trait]
impl InfrastructureProvider for MemoryInfrastructure {
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .instances
            .iter()
            .filter(|r| !r.instance.deleted)
            .map(|r| r.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.get(id).map(|r| r.instance.clone()))
    }

    async fn instance_ports(&self, id: &InstanceId) -> Result<Vec<NetworkPort>> {
        self.instances
            .get(id)
            .map(|r| r.ports.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn get_tag(&self, id: &InstanceId, name: &str) -> Result<Option<String>> {
        let record = self.instances.get(id).ok_or_else(|| Self::not_found(id))?;
        Ok(record.tags.get(name).cloned())
    }

    async fn put_tag(&self, id: &InstanceId, name: &str, value: String) -> Result<()> {
        let mut record = self.instances.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if record.instance.deleted {
            return Err(Self::not_found(id));
        }
        debug!("Tag {} set on instance {}", name, id);
        record.tags.insert(name.to_string(), value);
        Ok(())
    }

    async fn register_instance(&self, instance: Instance, ports: Vec<NetworkPort>) -> Result<()> {
        let id = instance.id.clone();
        match self.instances.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.instance.name = instance.name;
                record.instance.backend_state = instance.backend_state;
                record.instance.deleted = false;
                record.ports = ports;
            }
            Entry::Vacant(entry) => {
                info!("Registered instance {}", entry.key());
                entry.insert(InstanceRecord {
                    instance,
                    ports,
                    tags: IndexMap::new(),
                });
            }
        }
        Ok(())
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        let mut record = self.instances.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        record.instance.deleted = true;
        record.ports.clear();
        record.tags.clear();
        info!("Instance {} marked deleted", id);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendState;
    use assert_matches::assert_matches;

    fn port(id: &str, ip: &str) -> NetworkPort {
        NetworkPort {
            instance_id: InstanceId::from(id),
            ip: ip.to_string(),
            network: None,
        }
    }

    #[test]
    fn test_health_check_without_runtime() {
        let infra = MemoryInfrastructure::new();
        assert!(tokio_test::block_on(infra.health_check()).unwrap());
        assert!(tokio_test::block_on(infra.list_instances()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let infra = MemoryInfrastructure::new();
        let id = InstanceId::from("i-1");
        infra
            .register_instance(
                Instance::new(id.clone(), "haproxy-1", BackendState::Provisioned),
                vec![port("i-1", "10.0.0.9")],
            )
            .await
            .unwrap();

        assert_eq!(infra.list_instances().await.unwrap().len(), 1);
        assert_eq!(infra.instance_ports(&id).await.unwrap()[0].ip, "10.0.0.9");
        assert!(infra.get_tag(&id, "missing").await.unwrap().is_none());

        let err = infra.instance_ports(&InstanceId::from("nope")).await.unwrap_err();
        assert_matches!(err, Error::InstanceNotFound { .. });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_keeps_tags() {
        let infra = MemoryInfrastructure::new();

        let mut handles = Vec::new();
        for n in 0..16 {
            let infra = infra.clone();
            handles.push(tokio::spawn(async move {
                let id = InstanceId::from("i-1");
                infra
                    .register_instance(
                        Instance::new(id.clone(), "haproxy-1", BackendState::Provisioned),
                        vec![port("i-1", "10.0.0.9")],
                    )
                    .await
                    .unwrap();
                infra.put_tag(&id, &format!("tag-{}", n), "x".into()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let id = InstanceId::from("i-1");
        for n in 0..16 {
            assert!(infra.get_tag(&id, &format!("tag-{}", n)).await.unwrap().is_some());
        }
        assert_eq!(infra.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_ports_and_tags() {
        let infra = MemoryInfrastructure::new();
        let id = InstanceId::from("i-1");
        infra
            .register_instance(
                Instance::new(id.clone(), "haproxy-1", BackendState::Provisioned),
                vec![port("i-1", "10.0.0.9")],
            )
            .await
            .unwrap();
        infra.put_tag(&id, "chk_container_status", "{}".into()).await.unwrap();

        infra.delete_instance(&id).await.unwrap();

        let instance = infra.get_instance(&id).await.unwrap().unwrap();
        assert!(instance.deleted);
        assert!(infra.instance_ports(&id).await.unwrap().is_empty());
        assert!(infra.get_tag(&id, "chk_container_status").await.unwrap().is_none());
        assert!(infra.list_instances().await.unwrap().is_empty());
        assert!(infra.put_tag(&id, "x", "y".into()).await.is_err());
    }
}
