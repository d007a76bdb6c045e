//! The query sandbox: single authority deciding whether a structured
//! query may proceed.
//!
//! Validation is purely computational. It takes the query and an explicit
//! snapshot of the agent's active grants (each pinned to its descriptor
//! version) and produces a verdict with specific error kinds. Given the
//! same snapshots it always returns the same verdict, so it may run fully
//! in parallel across requests and be replayed for audit.

use qgate_grant::GrantSnapshot;
use qgate_schema::{EntityCapability, SchemaDescriptor};
use qgate_types::{
    Filter, Include, ParamValue, QueryAction, StructuredQuery, ValidationErrorKind,
    ValidationSnapshot,
};
use std::collections::BTreeMap;

/// Default maximum nesting for relation fetches.
pub const DEFAULT_MAX_RELATION_DEPTH: usize = 2;

#[derive(Clone, Copy, Debug)]
pub struct Sandbox {
    pub max_relation_depth: usize,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            max_relation_depth: DEFAULT_MAX_RELATION_DEPTH,
        }
    }
}

impl Sandbox {
    pub fn new(max_relation_depth: usize) -> Self {
        Self { max_relation_depth }
    }

    /// Grants that cover this query's entity+action: the grant is active,
    /// its descriptor exposes the entity and the action on it, and the
    /// grant's own allow-lists admit both.
    pub fn covering<'a>(
        &self,
        query: &StructuredQuery,
        grants: &'a [GrantSnapshot],
    ) -> Vec<&'a GrantSnapshot> {
        grants
            .iter()
            .filter(|snap| snap.grant.is_active)
            .filter(|snap| {
                let Some(cap) = snap.descriptor.resolve(&query.entity) else {
                    return false;
                };
                cap.allows_action(query.action)
                    && snap.grant.allows_entity(&query.entity)
                    && snap.grant.allows_action(query.action)
            })
            .collect()
    }

    /// Admit or reject the candidate query. The request is admitted if at
    /// least one covering grant's descriptor also passes the field-level,
    /// required-field and relation-depth checks; otherwise the errors of
    /// the first covering grant are reported.
    pub fn validate(
        &self,
        query: &StructuredQuery,
        grants: &[GrantSnapshot],
    ) -> ValidationSnapshot {
        let active: Vec<&GrantSnapshot> =
            grants.iter().filter(|s| s.grant.is_active).collect();
        if active.is_empty() {
            return rejection(vec![ValidationErrorKind::NoGrant]);
        }

        let covering = self.covering(query, grants);
        if covering.is_empty() {
            // Distinguish "entity exposed somewhere but the action is the
            // problem" from "nothing exposes this entity at all".
            let entity_reachable = active.iter().any(|snap| {
                snap.descriptor.resolve(&query.entity).is_some()
                    && snap.grant.allows_entity(&query.entity)
            });
            let kind = if entity_reachable {
                ValidationErrorKind::ActionNotGranted
            } else {
                ValidationErrorKind::NoGrant
            };
            return rejection(vec![kind]);
        }

        let mut first_errors: Option<(Vec<ValidationErrorKind>, &GrantSnapshot)> = None;
        for snap in &covering {
            let Some(cap) = snap.descriptor.resolve(&query.entity) else {
                continue;
            };
            let errors = self.check_shape(query, cap, &snap.descriptor);
            if errors.is_empty() {
                return ValidationSnapshot {
                    valid: true,
                    errors: Vec::new(),
                    covering_grant_id: Some(snap.grant.id),
                    descriptor_id: Some(snap.descriptor.id),
                    descriptor_version: Some(snap.descriptor.version.clone()),
                };
            }
            if first_errors.is_none() {
                first_errors = Some((errors, snap));
            }
        }

        match first_errors {
            Some((errors, snap)) => ValidationSnapshot {
                valid: false,
                errors,
                covering_grant_id: Some(snap.grant.id),
                descriptor_id: Some(snap.descriptor.id),
                descriptor_version: Some(snap.descriptor.version.clone()),
            },
            None => rejection(vec![ValidationErrorKind::NoGrant]),
        }
    }

    /// Field-level, required-field and depth checks for the parameter tree
    /// under one descriptor.
    fn check_shape(
        &self,
        query: &StructuredQuery,
        cap: &EntityCapability,
        descriptor: &SchemaDescriptor,
    ) -> Vec<ValidationErrorKind> {
        let mut errors = Vec::new();
        let params = &query.params;

        for field in &params.select {
            if !cap.allows_field(field) {
                errors.push(ValidationErrorKind::FieldNotAllowed(field.clone()));
            }
        }

        if let Some(filter) = &params.filter {
            self.walk_filter(filter, cap, descriptor, &mut errors);
        }

        for order in &params.order_by {
            if !cap.allows_field(&order.field) {
                errors.push(ValidationErrorKind::FieldNotAllowed(order.field.clone()));
            }
        }

        for (name, include) in &params.include {
            self.walk_include(name, include, cap, descriptor, 1, &mut errors);
        }

        if query.action == QueryAction::Create || query.action == QueryAction::Update {
            self.walk_data(&params.data, cap, descriptor, 1, &mut errors);
        }

        // Required fields bind creation only; updates stay partial.
        if query.action == QueryAction::Create {
            for required in &cap.required_fields {
                if !params.data.contains_key(required) {
                    errors.push(ValidationErrorKind::MissingRequiredField(required.clone()));
                }
            }
        }

        errors
    }

    fn walk_filter(
        &self,
        filter: &Filter,
        cap: &EntityCapability,
        descriptor: &SchemaDescriptor,
        errors: &mut Vec<ValidationErrorKind>,
    ) {
        for field in filter.fields.keys() {
            if !cap.allows_field(field) {
                errors.push(ValidationErrorKind::FieldNotAllowed(field.clone()));
            }
        }
        for branch in &filter.or {
            self.walk_filter(branch, cap, descriptor, errors);
        }
        if let Some(inner) = &filter.not {
            self.walk_filter(inner, cap, descriptor, errors);
        }
        for (name, rel_filter) in &filter.relations {
            match cap.relation(name) {
                Some(relation) => {
                    if let Some(target) = descriptor.resolve(&relation.target_entity) {
                        self.walk_filter(&rel_filter.filter, target, descriptor, errors);
                    }
                }
                None => {
                    errors.push(ValidationErrorKind::FieldNotAllowed(name.clone()));
                }
            }
        }
    }

    fn walk_include(
        &self,
        name: &str,
        include: &Include,
        owner: &EntityCapability,
        descriptor: &SchemaDescriptor,
        depth: usize,
        errors: &mut Vec<ValidationErrorKind>,
    ) {
        let Some(relation) = owner.relation(name) else {
            errors.push(ValidationErrorKind::FieldNotAllowed(name.to_string()));
            return;
        };
        if depth > self.max_relation_depth {
            errors.push(ValidationErrorKind::RelationTooDeep(name.to_string()));
            return;
        }
        let Some(target) = descriptor.resolve(&relation.target_entity) else {
            errors.push(ValidationErrorKind::FieldNotAllowed(name.to_string()));
            return;
        };
        for field in &include.select {
            if !target.allows_field(field) {
                errors.push(ValidationErrorKind::FieldNotAllowed(field.clone()));
            }
        }
        if let Some(filter) = &include.filter {
            self.walk_filter(filter, target, descriptor, errors);
        }
        for (nested_name, nested) in &include.include {
            self.walk_include(nested_name, nested, target, descriptor, depth + 1, errors);
        }
    }

    /// Write payload keys must be allowed fields, or relation names whose
    /// nested objects are checked against the target entity.
    fn walk_data(
        &self,
        data: &BTreeMap<String, ParamValue>,
        cap: &EntityCapability,
        descriptor: &SchemaDescriptor,
        depth: usize,
        errors: &mut Vec<ValidationErrorKind>,
    ) {
        for (key, value) in data {
            if cap.allows_field(key) && cap.relation(key).is_none() {
                continue;
            }
            match cap.relation(key) {
                Some(relation) => {
                    if depth > self.max_relation_depth {
                        errors.push(ValidationErrorKind::RelationTooDeep(key.clone()));
                        continue;
                    }
                    let Some(target) = descriptor.resolve(&relation.target_entity) else {
                        errors.push(ValidationErrorKind::FieldNotAllowed(key.clone()));
                        continue;
                    };
                    match value {
                        ParamValue::Object(nested) => {
                            self.walk_data(nested, target, descriptor, depth + 1, errors)
                        }
                        ParamValue::List(items) => {
                            for item in items {
                                if let ParamValue::Object(nested) = item {
                                    self.walk_data(nested, target, descriptor, depth + 1, errors);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                None => errors.push(ValidationErrorKind::FieldNotAllowed(key.clone())),
            }
        }
    }
}

fn rejection(errors: Vec<ValidationErrorKind>) -> ValidationSnapshot {
    ValidationSnapshot {
        valid: false,
        errors,
        covering_grant_id: None,
        descriptor_id: None,
        descriptor_version: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_grant::{CapabilityGrant, GrantTier};
    use qgate_schema::SchemaDescriptor;
    use qgate_types::{OrderBy, QueryParams, RelationFilter, RelationQuantifier, ScalarValue, SortDir};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use uuid::Uuid;

    const DESCRIPTOR: &str = r#"
id: 5f1c9d3e-8a42-4b8f-9c11-0f4dd1a2b3c4
name: crm
version: "1.0.0"
is_active: true
entities:
  User:
    actions: [read-many, read-one, count, create, update, delete, bulk-delete]
    fields: [id, email, name, posts]
    required_fields: [email]
    field_types:
      id: uuid
      email: string
      name: string
      posts: json
    relations:
      posts:
        cardinality: one-to-many
        target_entity: Post
        join_key: author_id
  Post:
    actions: [read-many]
    fields: [id, title, comments]
    field_types:
      id: uuid
      title: string
      comments: json
    relations:
      comments:
        cardinality: one-to-many
        target_entity: Comment
        join_key: post_id
  Comment:
    actions: [read-many]
    fields: [id, body, replies]
    field_types:
      id: uuid
      body: string
      replies: json
    relations:
      replies:
        cardinality: one-to-many
        target_entity: Comment
        join_key: parent_id
"#;

    fn descriptor() -> Arc<SchemaDescriptor> {
        Arc::new(SchemaDescriptor::parse_yaml(DESCRIPTOR).unwrap())
    }

    fn snapshot(tier: GrantTier, actions: &[QueryAction]) -> GrantSnapshot {
        GrantSnapshot {
            grant: CapabilityGrant {
                id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
                descriptor_id: Uuid::new_v4(),
                tier,
                entities: BTreeSet::new(),
                actions: actions.iter().copied().collect(),
                max_queries_per_day: 10,
                requires_approval: false,
                is_active: true,
            },
            descriptor: descriptor(),
        }
    }

    fn read_users() -> StructuredQuery {
        StructuredQuery {
            entity: "User".into(),
            action: QueryAction::ReadMany,
            params: QueryParams {
                select: vec!["id".into(), "email".into()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn no_grants_rejects_with_no_grant() {
        let verdict = Sandbox::default().validate(&read_users(), &[]);
        assert!(!verdict.valid);
        assert_eq!(verdict.errors, vec![ValidationErrorKind::NoGrant]);
    }

    #[test]
    fn covering_grant_admits_and_is_pinned() {
        let snap = snapshot(GrantTier::ReadOnly, &[]);
        let grant_id = snap.grant.id;
        let verdict = Sandbox::default().validate(&read_users(), &[snap]);
        assert!(verdict.valid);
        assert_eq!(verdict.covering_grant_id, Some(grant_id));
        assert_eq!(verdict.descriptor_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn unknown_field_rejects_regardless_of_action() {
        let snap = snapshot(GrantTier::ReadWrite, &[]);
        for action in [QueryAction::ReadMany, QueryAction::Count, QueryAction::Update] {
            let mut query = read_users();
            query.action = action;
            query.params.select = vec!["ssn".into()];
            let verdict = Sandbox::default().validate(&query, &[snap.clone()]);
            assert!(!verdict.valid);
            assert!(verdict
                .errors
                .contains(&ValidationErrorKind::FieldNotAllowed("ssn".into())));
        }
    }

    #[test]
    fn delete_needs_explicit_grant_action() {
        let mut query = read_users();
        query.action = QueryAction::Delete;
        query.params.select.clear();

        let inherit_all = snapshot(GrantTier::Admin, &[]);
        let verdict = Sandbox::default().validate(&query, &[inherit_all]);
        assert_eq!(verdict.errors, vec![ValidationErrorKind::ActionNotGranted]);

        let explicit = snapshot(GrantTier::Admin, &[QueryAction::Delete]);
        let verdict = Sandbox::default().validate(&query, &[explicit]);
        assert!(verdict.valid);
    }

    #[test]
    fn action_not_exposed_by_descriptor_is_not_granted() {
        // Post only exposes read-many; update must be refused even for an
        // admin grant with an explicit allow-list.
        let snap = snapshot(GrantTier::Admin, &[QueryAction::Update]);
        let query = StructuredQuery {
            entity: "Post".into(),
            action: QueryAction::Update,
            params: QueryParams::default(),
        };
        let verdict = Sandbox::default().validate(&query, &[snap]);
        assert_eq!(verdict.errors, vec![ValidationErrorKind::ActionNotGranted]);
    }

    #[test]
    fn missing_required_field_on_create() {
        let snap = snapshot(GrantTier::ReadWrite, &[]);
        let query = StructuredQuery {
            entity: "User".into(),
            action: QueryAction::Create,
            params: QueryParams {
                data: [(
                    "name".to_string(),
                    ParamValue::Scalar(ScalarValue::Text("ada".into())),
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        };
        let verdict = Sandbox::default().validate(&query, &[snap]);
        assert!(verdict
            .errors
            .contains(&ValidationErrorKind::MissingRequiredField("email".into())));
    }

    #[test]
    fn update_stays_partial() {
        let snap = snapshot(GrantTier::ReadWrite, &[]);
        let query = StructuredQuery {
            entity: "User".into(),
            action: QueryAction::Update,
            params: QueryParams {
                data: [(
                    "name".to_string(),
                    ParamValue::Scalar(ScalarValue::Text("ada".into())),
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        };
        assert!(Sandbox::default().validate(&query, &[snap]).valid);
    }

    #[test]
    fn include_depth_beyond_limit_rejects() {
        let snap = snapshot(GrantTier::ReadOnly, &[]);
        let mut query = read_users();
        query.params.select.clear();
        // posts -> comments -> replies is three levels deep.
        query.params.include = [(
            "posts".to_string(),
            Include {
                include: [(
                    "comments".to_string(),
                    Include {
                        include: [("replies".to_string(), Include::default())]
                            .into_iter()
                            .collect(),
                        ..Default::default()
                    },
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();

        let verdict = Sandbox::default().validate(&query, &[snap.clone()]);
        assert!(verdict
            .errors
            .contains(&ValidationErrorKind::RelationTooDeep("replies".into())));

        // Two levels is within the default limit.
        query.params.include.get_mut("posts").unwrap().include =
            [("comments".to_string(), Include::default())]
                .into_iter()
                .collect();
        assert!(Sandbox::default().validate(&query, &[snap]).valid);
    }

    #[test]
    fn quantified_filter_walks_the_target_entity() {
        let snap = snapshot(GrantTier::ReadOnly, &[]);
        let mut query = read_users();
        query.params.select.clear();
        query.params.filter = Some(Filter {
            relations: [(
                "posts".to_string(),
                RelationFilter {
                    quantifier: RelationQuantifier::Some,
                    filter: Filter {
                        fields: [(
                            "secret".to_string(),
                            ParamValue::Scalar(ScalarValue::Bool(true)),
                        )]
                        .into_iter()
                        .collect(),
                        ..Default::default()
                    },
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        let verdict = Sandbox::default().validate(&query, &[snap]);
        assert!(verdict
            .errors
            .contains(&ValidationErrorKind::FieldNotAllowed("secret".into())));
    }

    #[test]
    fn order_by_fields_are_checked() {
        let snap = snapshot(GrantTier::ReadOnly, &[]);
        let mut query = read_users();
        query.params.order_by = vec![OrderBy {
            field: "ssn".into(),
            dir: SortDir::Desc,
        }];
        let verdict = Sandbox::default().validate(&query, &[snap]);
        assert!(verdict
            .errors
            .contains(&ValidationErrorKind::FieldNotAllowed("ssn".into())));
    }

    #[test]
    fn any_covering_grant_admits() {
        // First grant is entity-restricted away from User; second covers it.
        let mut restricted = snapshot(GrantTier::ReadOnly, &[]);
        restricted.grant.entities.insert("Post".into());
        let open = snapshot(GrantTier::ReadOnly, &[]);
        let open_id = open.grant.id;

        let verdict = Sandbox::default().validate(&read_users(), &[restricted, open]);
        assert!(verdict.valid);
        assert_eq!(verdict.covering_grant_id, Some(open_id));
    }

    #[test]
    fn verdict_is_deterministic() {
        let snap = snapshot(GrantTier::ReadOnly, &[]);
        let query = read_users();
        let a = Sandbox::default().validate(&query, &[snap.clone()]);
        let b = Sandbox::default().validate(&query, &[snap]);
        assert_eq!(a, b);
    }
}
