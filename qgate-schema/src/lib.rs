//! Schema capability descriptors.
//!
//! A descriptor is a versioned, declarative statement of which entities,
//! fields, relations and actions are exposed to agent queries. It is pure
//! data: produced by an external introspector or authored by hand (YAML),
//! validated structurally on load, and pinned by id+version once a request
//! has been validated against it. Structural edits create a new version;
//! a referenced descriptor is deactivated, never deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use qgate_types::QueryAction;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("entity {entity}: {context} references unknown field {field}")]
    UnknownField {
        entity: String,
        context: String,
        field: String,
    },
    #[error("entity {entity}: relation {relation} targets unknown entity {target}")]
    UnknownRelationTarget {
        entity: String,
        relation: String,
        target: String,
    },
    #[error("descriptor parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Primitive type of an exposed field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    Json,
    Uuid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn is_to_many(&self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }
}

/// Relation exposed through a field of the owning entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub cardinality: Cardinality,
    pub target_entity: String,
    pub join_key: String,
}

/// What one entity exposes to queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCapability {
    pub actions: BTreeSet<QueryAction>,
    pub fields: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub required_fields: BTreeSet<String>,
    pub field_types: BTreeMap<String, FieldType>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, Relation>,
    /// Groups of fields that must be jointly unique.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unique_groups: Vec<Vec<String>>,
}

impl EntityCapability {
    pub fn allows_action(&self, action: QueryAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn allows_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn relation(&self, field: &str) -> Option<&Relation> {
        self.relations.get(field)
    }
}

/// Versioned capability declaration for a set of entities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub entities: BTreeMap<String, EntityCapability>,
}

impl SchemaDescriptor {
    /// Pure lookup: the capability of one entity, if exposed at all.
    pub fn resolve(&self, entity: &str) -> Option<&EntityCapability> {
        self.entities.get(entity)
    }

    pub fn parse_yaml(yaml: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self = serde_yaml::from_str(yaml)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Structural invariant: every field referenced in `fields`,
    /// `required_fields`, `relations` and `unique_groups` must exist in
    /// `field_types`, and every relation target must be an exposed entity.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for (entity, cap) in &self.entities {
            let known = |field: &str| cap.field_types.contains_key(field);
            for field in &cap.fields {
                if !known(field) {
                    return Err(DescriptorError::UnknownField {
                        entity: entity.clone(),
                        context: "fields".into(),
                        field: field.clone(),
                    });
                }
            }
            for field in &cap.required_fields {
                if !known(field) {
                    return Err(DescriptorError::UnknownField {
                        entity: entity.clone(),
                        context: "required_fields".into(),
                        field: field.clone(),
                    });
                }
            }
            for group in &cap.unique_groups {
                for field in group {
                    if !known(field) {
                        return Err(DescriptorError::UnknownField {
                            entity: entity.clone(),
                            context: "unique_groups".into(),
                            field: field.clone(),
                        });
                    }
                }
            }
            for (rel_field, relation) in &cap.relations {
                if !known(rel_field) {
                    return Err(DescriptorError::UnknownField {
                        entity: entity.clone(),
                        context: "relations".into(),
                        field: rel_field.clone(),
                    });
                }
                if !self.entities.contains_key(&relation.target_entity) {
                    return Err(DescriptorError::UnknownRelationTarget {
                        entity: entity.clone(),
                        relation: rel_field.clone(),
                        target: relation.target_entity.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// In-memory descriptor lookup, keyed by id.
///
/// `get_active` is the resolution path for new requests; `get` also serves
/// deactivated versions so historical validations stay replayable.
#[derive(Default)]
pub struct DescriptorRegistry {
    by_id: HashMap<Uuid, Arc<SchemaDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: SchemaDescriptor) -> Result<Uuid, DescriptorError> {
        descriptor.validate()?;
        let id = descriptor.id;
        self.by_id.insert(id, Arc::new(descriptor));
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SchemaDescriptor>> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_active(&self, id: Uuid) -> Option<Arc<SchemaDescriptor>> {
        self.by_id.get(&id).filter(|d| d.is_active).cloned()
    }

    /// Deactivate in place. The only mutation allowed on a referenced
    /// descriptor; structural edits must insert a new version.
    pub fn deactivate(&mut self, id: Uuid) -> bool {
        match self.by_id.get_mut(&id) {
            Some(existing) => {
                let mut descriptor = (**existing).clone();
                descriptor.is_active = false;
                *existing = Arc::new(descriptor);
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<Arc<SchemaDescriptor>> {
        let mut all: Vec<_> = self
            .by_id
            .values()
            .filter(|d| d.is_active)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
