//! Capability grants: the binding between an agent and a schema
//! descriptor, with a permission tier, explicit allow-lists, a daily
//! quota and an approval flag.
//!
//! A grant never widens what its descriptor exposes; subset validation
//! happens on load. An agent may hold several active grants — admission
//! and quota semantics across them live in the sandbox and orchestrator.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use qgate_schema::{DescriptorRegistry, SchemaDescriptor};
use qgate_types::QueryAction;

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant {grant}: descriptor {descriptor} not found")]
    UnknownDescriptor { grant: Uuid, descriptor: String },
    #[error("grant {grant}: entity {entity} not exposed by descriptor")]
    EntityNotExposed { grant: Uuid, entity: String },
    #[error("grant {grant}: action {action} not exposed by descriptor")]
    ActionNotExposed { grant: Uuid, action: String },
    #[error("grants parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Permission tier. The tier gates action classes; destructive actions
/// additionally require explicit membership in the grant's allow-list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantTier {
    ReadOnly,
    ReadWrite,
    Admin,
}

impl GrantTier {
    pub fn permits(&self, action: QueryAction) -> bool {
        match self {
            Self::ReadOnly => action.is_read(),
            Self::ReadWrite => !action.is_bulk(),
            Self::Admin => true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub descriptor_id: Uuid,
    pub tier: GrantTier,
    /// Empty set means: inherit every entity the descriptor exposes.
    #[serde(default)]
    pub entities: BTreeSet<String>,
    /// Empty set means: inherit the descriptor's per-entity actions,
    /// except destructive ones, which are never inherited.
    #[serde(default)]
    pub actions: BTreeSet<QueryAction>,
    pub max_queries_per_day: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl CapabilityGrant {
    pub fn allows_entity(&self, entity: &str) -> bool {
        self.entities.is_empty() || self.entities.contains(entity)
    }

    /// Whether this grant's own allow-list and tier admit the action.
    /// Delete and bulk actions must be listed explicitly; an empty
    /// allow-list never implies them.
    pub fn allows_action(&self, action: QueryAction) -> bool {
        if !self.tier.permits(action) {
            return false;
        }
        if action.needs_explicit_grant() {
            return self.actions.contains(&action);
        }
        self.actions.is_empty() || self.actions.contains(&action)
    }

    /// Subset invariant: allow-listed entities/actions must exist in the
    /// referenced descriptor.
    pub fn validate_against(&self, descriptor: &SchemaDescriptor) -> Result<(), GrantError> {
        for entity in &self.entities {
            if descriptor.resolve(entity).is_none() {
                return Err(GrantError::EntityNotExposed {
                    grant: self.id,
                    entity: entity.clone(),
                });
            }
        }
        for action in &self.actions {
            let exposed = descriptor
                .entities
                .values()
                .any(|cap| cap.allows_action(*action));
            if !exposed {
                return Err(GrantError::ActionNotExposed {
                    grant: self.id,
                    action: action.as_str().into(),
                });
            }
        }
        Ok(())
    }
}

/// A grant pinned to the descriptor version it was resolved against.
/// Handed as an explicit snapshot through validation so verdicts are
/// reproducible regardless of later registry changes.
#[derive(Clone)]
pub struct GrantSnapshot {
    pub grant: CapabilityGrant,
    pub descriptor: Arc<SchemaDescriptor>,
}

/// Lookup of an agent's active grants, descriptor-pinned.
#[async_trait]
pub trait GrantDirectory: Send + Sync {
    async fn active_grants(&self, agent_id: Uuid) -> Vec<GrantSnapshot>;
}

/// In-memory directory over a descriptor registry.
pub struct InMemoryGrantDirectory {
    registry: Arc<DescriptorRegistry>,
    grants: Mutex<Vec<CapabilityGrant>>,
}

impl InMemoryGrantDirectory {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            registry,
            grants: Mutex::new(Vec::new()),
        }
    }

    pub async fn add(&self, grant: CapabilityGrant) -> Result<(), GrantError> {
        let descriptor = self.registry.get(grant.descriptor_id).ok_or_else(|| {
            GrantError::UnknownDescriptor {
                grant: grant.id,
                descriptor: grant.descriptor_id.to_string(),
            }
        })?;
        grant.validate_against(&descriptor)?;
        self.grants.lock().await.push(grant);
        Ok(())
    }

    pub async fn deactivate(&self, grant_id: Uuid) -> bool {
        let mut grants = self.grants.lock().await;
        match grants.iter_mut().find(|g| g.id == grant_id) {
            Some(grant) => {
                grant.is_active = false;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl GrantDirectory for InMemoryGrantDirectory {
    async fn active_grants(&self, agent_id: Uuid) -> Vec<GrantSnapshot> {
        let grants = self.grants.lock().await;
        grants
            .iter()
            .filter(|g| g.is_active && g.agent_id == agent_id)
            .filter_map(|g| {
                // Grants against a deactivated descriptor no longer cover
                // new requests.
                let descriptor = self.registry.get_active(g.descriptor_id)?;
                Some(GrantSnapshot {
                    grant: g.clone(),
                    descriptor,
                })
            })
            .collect()
    }
}

/// YAML config shape for authored grants. Descriptors are referenced by
/// name and resolved against the registry on load.
#[derive(Debug, Deserialize)]
pub struct GrantsFile {
    pub grants: Vec<GrantSpec>,
}

#[derive(Debug, Deserialize)]
pub struct GrantSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub agent_id: Uuid,
    pub descriptor: String,
    pub tier: GrantTier,
    #[serde(default)]
    pub entities: BTreeSet<String>,
    #[serde(default)]
    pub actions: BTreeSet<QueryAction>,
    pub max_queries_per_day: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl GrantsFile {
    pub fn parse_yaml(yaml: &str) -> Result<Self, GrantError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Resolve descriptor names and load every grant into the directory.
    pub async fn load_into(
        self,
        registry: &DescriptorRegistry,
        directory: &InMemoryGrantDirectory,
    ) -> Result<usize, GrantError> {
        let mut loaded = 0;
        for spec in self.grants {
            let descriptor = registry
                .active()
                .into_iter()
                .find(|d| d.name == spec.descriptor)
                .ok_or_else(|| GrantError::UnknownDescriptor {
                    grant: spec.id,
                    descriptor: spec.descriptor.clone(),
                })?;
            directory
                .add(CapabilityGrant {
                    id: spec.id,
                    agent_id: spec.agent_id,
                    descriptor_id: descriptor.id,
                    tier: spec.tier,
                    entities: spec.entities,
                    actions: spec.actions,
                    max_queries_per_day: spec.max_queries_per_day,
                    requires_approval: spec.requires_approval,
                    is_active: spec.is_active,
                })
                .await?;
            loaded += 1;
        }
        Ok(loaded)
    }
}
