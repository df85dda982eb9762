//! Declarative Templates
//!
//! A template document describes a set of entities and the named
//! relationships between them. Applying a document is an upsert: each node
//! is matched against existing records by public id, then by name (members
//! by address and port within their pool), and created when no match
//! exists.
//!
//! The whole document is validated before the first write. Nodes are then
//! applied in dependency order so every relationship target exists by the
//! time it is referenced.

use crate::controlplane::fields::{
    present, HealthMonitorFields, ListenerFields, LoadBalancerFields, MemberFields, PoolFields,
};
use crate::controlplane::service::LbaasService;
use crate::error::{Error, Result};
use crate::model::{EntityKind, Pool, PublicId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Document Types
// =============================================================================

/// A declarative description of load balancer entities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TemplateDocument {
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<TemplateNode>,
}

/// One entity in a template
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TemplateNode {
    /// Unique within the document; also the entity name when none is given
    pub name: String,
    pub kind: NodeKind,
    /// Entity fields, as accepted by the matching create/update endpoint
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    LoadBalancer,
    Listener,
    Pool,
    Member,
    HealthMonitor,
}

impl NodeKind {
    pub fn entity_kind(self) -> EntityKind {
        match self {
            NodeKind::LoadBalancer => EntityKind::LoadBalancer,
            NodeKind::Listener => EntityKind::Listener,
            NodeKind::Pool => EntityKind::Pool,
            NodeKind::Member => EntityKind::Member,
            NodeKind::HealthMonitor => EntityKind::HealthMonitor,
        }
    }

    /// Application order; lower applies first
    fn rank(self) -> u8 {
        match self {
            NodeKind::HealthMonitor => 0,
            NodeKind::Listener => 1,
            NodeKind::Pool => 2,
            NodeKind::Member => 3,
            NodeKind::LoadBalancer => 4,
        }
    }

    /// Relationships a node of this kind must declare
    fn required(self) -> &'static [Relationship] {
        match self {
            NodeKind::LoadBalancer => &[Relationship::TenantOfService],
            NodeKind::Pool => &[Relationship::HealthmonitorOfPool],
            NodeKind::Member => &[Relationship::PoolOfMember],
            NodeKind::Listener | NodeKind::HealthMonitor => &[],
        }
    }
}

/// Typed relationship between a node and its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Relationship {
    /// LoadBalancer -> owning service name
    TenantOfService,
    /// LoadBalancer -> Listener
    ListenerOfLoadbalancer,
    /// LoadBalancer -> Pool
    PoolOfLoadbalancer,
    /// Pool -> HealthMonitor
    HealthmonitorOfPool,
    /// Member -> Pool
    PoolOfMember,
}

impl Relationship {
    fn source(self) -> NodeKind {
        match self {
            Relationship::TenantOfService
            | Relationship::ListenerOfLoadbalancer
            | Relationship::PoolOfLoadbalancer => NodeKind::LoadBalancer,
            Relationship::HealthmonitorOfPool => NodeKind::Pool,
            Relationship::PoolOfMember => NodeKind::Member,
        }
    }

    /// Kind of node targeted; `None` for owning services
    fn target(self) -> Option<NodeKind> {
        match self {
            Relationship::TenantOfService => None,
            Relationship::ListenerOfLoadbalancer => Some(NodeKind::Listener),
            Relationship::PoolOfLoadbalancer | Relationship::PoolOfMember => Some(NodeKind::Pool),
            Relationship::HealthmonitorOfPool => Some(NodeKind::HealthMonitor),
        }
    }
}

/// A named relationship; `node` is a node name in the same document, an
/// existing entity's public id, or a service name for `TenantOfService`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Requirement {
    pub relationship: Relationship,
    pub node: String,
}

impl TemplateDocument {
    /// Parse a document from JSON or YAML text
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim_start().starts_with('{') {
            Ok(serde_json::from_str(raw)?)
        } else {
            Ok(serde_yaml::from_str(raw)?)
        }
    }
}

/// JSON schema of the document format plus the per-kind property sets
pub fn template_schema() -> serde_json::Value {
    serde_json::json!({
        "document": schemars::schema_for!(TemplateDocument),
        "properties": {
            "loadbalancer": schemars::schema_for!(LoadBalancerFields),
            "listener": schemars::schema_for!(ListenerFields),
            "pool": schemars::schema_for!(PoolFields),
            "member": schemars::schema_for!(MemberFields),
            "healthmonitor": schemars::schema_for!(HealthMonitorFields),
        }
    })
}

// =============================================================================
// Planning
// =============================================================================

/// Typed properties of a validated node
#[derive(Debug, Clone)]
enum NodeBody {
    LoadBalancer(LoadBalancerFields),
    Listener(ListenerFields),
    Pool(PoolFields),
    Member(MemberFields),
    HealthMonitor(HealthMonitorFields),
}

/// A stored entity that a node updates instead of creating
#[derive(Debug, Clone)]
struct Existing {
    id: PublicId,
    /// Owning pool, members only
    pool: Option<PublicId>,
}

impl Existing {
    fn of(id: PublicId) -> Self {
        Self { id, pool: None }
    }
}

#[derive(Debug, Clone)]
struct PlannedNode {
    name: String,
    kind: NodeKind,
    body: NodeBody,
    links: HashMap<Relationship, String>,
    existing: Option<Existing>,
}

fn template_error(node: &str, reason: impl Into<String>) -> Error {
    Error::Template {
        node: node.to_string(),
        reason: reason.into(),
    }
}

fn properties<T: serde::de::DeserializeOwned + Default>(node: &TemplateNode) -> Result<T> {
    if node.properties.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.properties.clone())
        .map_err(|e| template_error(&node.name, format!("invalid properties: {}", e)))
}

/// Parse node properties, naming the entity after the node when unnamed
fn node_body(node: &TemplateNode) -> Result<NodeBody> {
    let default_name = || node.name.clone();
    Ok(match node.kind {
        NodeKind::LoadBalancer => {
            let mut fields: LoadBalancerFields = properties(node)?;
            fields.name.get_or_insert_with(default_name);
            NodeBody::LoadBalancer(fields)
        }
        NodeKind::Listener => {
            let mut fields: ListenerFields = properties(node)?;
            fields.name.get_or_insert_with(default_name);
            NodeBody::Listener(fields)
        }
        NodeKind::Pool => {
            let mut fields: PoolFields = properties(node)?;
            fields.name.get_or_insert_with(default_name);
            NodeBody::Pool(fields)
        }
        NodeKind::Member => NodeBody::Member(properties(node)?),
        NodeKind::HealthMonitor => {
            let mut fields: HealthMonitorFields = properties(node)?;
            fields.name.get_or_insert_with(default_name);
            NodeBody::HealthMonitor(fields)
        }
    })
}

// =============================================================================
// Applier
// =============================================================================

/// How a node was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedNode {
    pub node: String,
    pub kind: EntityKind,
    pub id: PublicId,
    pub action: AppliedAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateReport {
    pub applied: Vec<AppliedNode>,
}

/// Applies template documents through the service layer
pub struct TemplateApplier {
    service: Arc<LbaasService>,
}

impl TemplateApplier {
    pub fn new(service: Arc<LbaasService>) -> Self {
        Self { service }
    }

    /// Validate and apply a whole document
    pub async fn apply(&self, document: TemplateDocument) -> Result<TemplateReport> {
        let plan = self.plan(&document).await?;
        info!("Applying template with {} nodes", plan.len());

        let mut applied: HashMap<String, PublicId> = HashMap::new();
        let mut report = TemplateReport::default();

        for node in plan {
            let targets = self.link_targets(&node, &applied);
            let (id, action) = self.upsert(&node, targets).await?;
            debug!("Template node {} {:?} as {}", node.name, action, id);
            applied.insert(node.name.clone(), id.clone());
            report.applied.push(AppliedNode {
                node: node.name,
                kind: node.kind.entity_kind(),
                id,
                action,
            });
        }
        Ok(report)
    }

    /// Check structure, relationships and payloads, returning nodes in
    /// apply order. Nothing is written here.
    async fn plan(&self, document: &TemplateDocument) -> Result<Vec<PlannedNode>> {
        let mut kinds: HashMap<&str, NodeKind> = HashMap::new();
        for node in &document.nodes {
            if node.name.trim().is_empty() {
                return Err(template_error("", "node name must not be empty"));
            }
            if kinds.insert(node.name.as_str(), node.kind).is_some() {
                return Err(template_error(&node.name, "duplicate node name"));
            }
        }

        let mut plan = Vec::with_capacity(document.nodes.len());
        for node in &document.nodes {
            let mut links = HashMap::new();
            for req in &node.requirements {
                if req.relationship.source() != node.kind {
                    return Err(template_error(
                        &node.name,
                        format!("{:?} does not apply to a {:?} node", req.relationship, node.kind),
                    ));
                }
                self.check_target(node, req, &kinds).await?;
                if links.insert(req.relationship, req.node.clone()).is_some() {
                    return Err(template_error(
                        &node.name,
                        format!("{:?} declared more than once", req.relationship),
                    ));
                }
            }
            for required in node.kind.required() {
                if !links.contains_key(required) {
                    return Err(template_error(
                        &node.name,
                        format!("missing required relationship {:?}", required),
                    ));
                }
            }

            plan.push(PlannedNode {
                name: node.name.clone(),
                kind: node.kind,
                body: node_body(node)?,
                links,
                existing: None,
            });
        }
        plan.sort_by_key(|n| n.kind.rank());

        // Pools are ranked before members, so a member's pool is settled
        // by the time the member is matched.
        let mut resolved: HashMap<String, PublicId> = HashMap::new();
        for node in plan.iter_mut() {
            let pool = match node.links.get(&Relationship::PoolOfMember) {
                Some(target) if kinds.contains_key(target.as_str()) => resolved.get(target).cloned(),
                Some(target) => Some(PublicId::from(target.as_str())),
                None => None,
            };
            node.existing = self.find_existing(&node.body, pool.as_ref()).await?;
            match &node.existing {
                Some(existing) => {
                    resolved.insert(node.name.clone(), existing.id.clone());
                    check_update(&node.body)?;
                }
                None => self.check_create(node)?,
            }
        }
        Ok(plan)
    }

    /// Build the record a create would insert, discarding it
    fn check_create(&self, node: &PlannedNode) -> Result<()> {
        match &node.body {
            NodeBody::LoadBalancer(fields) => fields.draft(self.service.default_owner()).map(drop),
            NodeBody::Listener(fields) => fields.draft().map(drop),
            NodeBody::Pool(fields) => fields.draft().map(drop),
            NodeBody::Member(fields) => {
                let pool = Pool::new(PublicId::generate(), node.name.clone(), "", "");
                fields.draft(&pool).map(drop)
            }
            NodeBody::HealthMonitor(fields) => fields.draft().map(drop),
        }
    }

    async fn check_target(
        &self,
        node: &TemplateNode,
        req: &Requirement,
        kinds: &HashMap<&str, NodeKind>,
    ) -> Result<()> {
        let Some(target_kind) = req.relationship.target() else {
            if self.service.knows_service(&req.node) {
                return Ok(());
            }
            return Err(template_error(
                &node.name,
                format!("unknown service '{}'", req.node),
            ));
        };

        match kinds.get(req.node.as_str()) {
            Some(kind) if *kind == target_kind => Ok(()),
            Some(kind) => Err(template_error(
                &node.name,
                format!(
                    "{:?} must target a {:?} node, '{}' is a {:?}",
                    req.relationship, target_kind, req.node, kind
                ),
            )),
            None if self.entity_exists(target_kind, &req.node).await? => Ok(()),
            None => Err(template_error(
                &node.name,
                format!("{:?} target '{}' cannot be resolved", req.relationship, req.node),
            )),
        }
    }

    async fn entity_exists(&self, kind: NodeKind, id: &str) -> Result<bool> {
        let repos = self.service.repos();
        let id = PublicId::from(id);
        Ok(match kind {
            NodeKind::Listener => repos.listeners.find(&id).await?.is_some(),
            NodeKind::Pool => repos.pools.find(&id).await?.is_some(),
            NodeKind::HealthMonitor => repos.health_monitors.find(&id).await?.is_some(),
            NodeKind::LoadBalancer => repos.loadbalancers.find(&id).await?.is_some(),
            NodeKind::Member => repos.members.find(&id).await?.is_some(),
        })
    }

    /// Match a node against stored records: by public id, then by name.
    /// Members match by address and port within `pool`.
    async fn find_existing(&self, body: &NodeBody, pool: Option<&PublicId>) -> Result<Option<Existing>> {
        let svc = &self.service;
        let repos = svc.repos();
        Ok(match body {
            NodeBody::HealthMonitor(fields) => {
                let found = match present(&fields.id) {
                    Some(id) => repos.health_monitors.find(&id.into()).await?,
                    None => svc
                        .list_health_monitors()
                        .await?
                        .into_iter()
                        .find(|h| Some(&h.name) == fields.name.as_ref()),
                };
                found.map(|h| Existing::of(h.health_monitor_id))
            }
            NodeBody::Listener(fields) => {
                let found = match present(&fields.id) {
                    Some(id) => repos.listeners.find(&id.into()).await?,
                    None => svc
                        .list_listeners()
                        .await?
                        .into_iter()
                        .find(|l| Some(&l.name) == fields.name.as_ref()),
                };
                found.map(|l| Existing::of(l.listener_id))
            }
            NodeBody::Pool(fields) => {
                let found = match present(&fields.id) {
                    Some(id) => repos.pools.find(&id.into()).await?,
                    None => svc
                        .list_pools()
                        .await?
                        .into_iter()
                        .find(|p| Some(&p.name) == fields.name.as_ref()),
                };
                found.map(|p| Existing::of(p.pool_id))
            }
            NodeBody::LoadBalancer(fields) => {
                let found = match present(&fields.id) {
                    Some(id) => repos.loadbalancers.find(&id.into()).await?,
                    None => svc
                        .list_loadbalancers()
                        .await?
                        .into_iter()
                        .find(|lb| Some(&lb.name) == fields.name.as_ref()),
                };
                found.map(|lb| Existing::of(lb.loadbalancer_id))
            }
            NodeBody::Member(fields) => {
                let found = match (present(&fields.id), pool) {
                    (Some(id), _) => repos.members.find(&id.into()).await?,
                    (None, Some(pool)) => svc.list_members(pool).await?.into_iter().find(|m| {
                        Some(m.address.as_str()) == present(&fields.address)
                            && Some(m.protocol_port) == fields.protocol_port
                    }),
                    // New pool, so no members yet
                    (None, None) => None,
                };
                match found {
                    Some(member) => {
                        let owner = repos
                            .pools
                            .get(member.pool)
                            .await?
                            .map(|p| p.pool_id)
                            .ok_or_else(|| Error::not_found(EntityKind::Pool, member.pool))?;
                        Some(Existing {
                            id: member.member_id,
                            pool: Some(owner),
                        })
                    }
                    None => None,
                }
            }
        })
    }

    /// Translate relationship targets into public ids (or service names)
    fn link_targets(
        &self,
        node: &PlannedNode,
        applied: &HashMap<String, PublicId>,
    ) -> HashMap<Relationship, String> {
        node.links
            .iter()
            .map(|(rel, target)| {
                let value = match rel.target() {
                    None => target.clone(),
                    Some(_) => applied
                        .get(target)
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| target.clone()),
                };
                (*rel, value)
            })
            .collect()
    }

    async fn upsert(
        &self,
        node: &PlannedNode,
        targets: HashMap<Relationship, String>,
    ) -> Result<(PublicId, AppliedAction)> {
        let svc = &self.service;
        let existing = node.existing.clone();
        match node.body.clone() {
            NodeBody::HealthMonitor(fields) => match existing {
                Some(found) => {
                    svc.update_health_monitor(&found.id, fields).await?;
                    Ok((found.id, AppliedAction::Updated))
                }
                None => {
                    let hm = svc.create_health_monitor(fields).await?;
                    Ok((hm.health_monitor_id, AppliedAction::Created))
                }
            },
            NodeBody::Listener(fields) => match existing {
                Some(found) => {
                    svc.update_listener(&found.id, fields).await?;
                    Ok((found.id, AppliedAction::Updated))
                }
                None => {
                    let listener = svc.create_listener(fields).await?;
                    Ok((listener.listener_id, AppliedAction::Created))
                }
            },
            NodeBody::Pool(mut fields) => {
                if let Some(hm) = targets.get(&Relationship::HealthmonitorOfPool) {
                    fields.health_monitor = Some(hm.clone());
                }
                match existing {
                    Some(found) => {
                        svc.update_pool(&found.id, fields).await?;
                        Ok((found.id, AppliedAction::Updated))
                    }
                    None => {
                        let pool = svc.create_pool(fields).await?;
                        Ok((pool.pool_id, AppliedAction::Created))
                    }
                }
            }
            NodeBody::Member(mut fields) => {
                let pool_id = targets
                    .get(&Relationship::PoolOfMember)
                    .map(|p| PublicId::from(p.as_str()))
                    .ok_or_else(|| template_error(&node.name, "missing required relationship PoolOfMember"))?;
                fields.pool = Some(pool_id.to_string());

                match existing {
                    Some(found) => {
                        let owner = found.pool.unwrap_or(pool_id);
                        svc.update_member(&owner, &found.id, fields).await?;
                        Ok((found.id, AppliedAction::Updated))
                    }
                    None => {
                        let member = svc.create_member(fields).await?;
                        Ok((member.member_id, AppliedAction::Created))
                    }
                }
            }
            NodeBody::LoadBalancer(mut fields) => {
                if let Some(owner) = targets.get(&Relationship::TenantOfService) {
                    fields.owner = Some(owner.clone());
                }
                if let Some(listener) = targets.get(&Relationship::ListenerOfLoadbalancer) {
                    fields.listener = Some(listener.clone());
                }
                if let Some(pool) = targets.get(&Relationship::PoolOfLoadbalancer) {
                    fields.pool = Some(pool.clone());
                }
                match existing {
                    Some(found) => {
                        svc.update_loadbalancer(&found.id, fields).await?;
                        Ok((found.id, AppliedAction::Updated))
                    }
                    None => {
                        let lb = svc.create_loadbalancer(fields).await?;
                        Ok((lb.loadbalancer_id, AppliedAction::Created))
                    }
                }
            }
        }
    }
}

/// Payload checks an update runs before writing
fn check_update(body: &NodeBody) -> Result<()> {
    match body {
        NodeBody::Listener(fields) => fields.validate(),
        NodeBody::Member(fields) => fields.validate(),
        _ => Ok(()),
    }
}
