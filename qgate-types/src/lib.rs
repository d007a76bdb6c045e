//! Shared vocabulary for the query gateway.
//!
//! Everything that crosses a crate boundary lives here: the structured
//! query shape (action, parameter tree, filter/include trees), the request
//! lifecycle state machine, and the validation snapshot recorded on every
//! persisted request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Data-store action an agent may request against an entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryAction {
    ReadMany,
    ReadOne,
    ReadFirst,
    Count,
    Create,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
}

impl QueryAction {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::ReadMany | Self::ReadOne | Self::ReadFirst | Self::Count
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::BulkUpdate | Self::BulkDelete)
    }

    /// Destructive actions are never inherited from a wildcard/empty
    /// allow-list; a grant must name them explicitly.
    pub fn needs_explicit_grant(&self) -> bool {
        matches!(self, Self::Delete | Self::BulkUpdate | Self::BulkDelete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadMany => "read-many",
            Self::ReadOne => "read-one",
            Self::ReadFirst => "read-first",
            Self::Count => "count",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkUpdate => "bulk-update",
            Self::BulkDelete => "bulk-delete",
        }
    }
}

/// Leaf value in the parameter tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

/// Comparison operator inside a filter condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

/// Operator node: `{"op": "gt", "value": 5}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpNode {
    pub op: FilterOp,
    pub value: Box<ParamValue>,
}

/// Tagged parameter-tree value: the only shapes a candidate query may
/// carry. Keeps traversal (field-reference and depth checks) explicit
/// instead of walking untyped JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(ScalarValue),
    Op(OpNode),
    List(Vec<ParamValue>),
    Object(BTreeMap<String, ParamValue>),
}

/// Quantifier over a to-many relation in a filter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationQuantifier {
    Some,
    Every,
    None,
}

/// Quantified sub-filter applied through a relation field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationFilter {
    pub quantifier: RelationQuantifier,
    pub filter: Filter,
}

/// Where-clause tree. `fields` are direct conditions keyed by field name;
/// `or`/`not` are boolean combinators; `relations` are quantified
/// sub-filters keyed by relation field name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, ParamValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Filter>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationFilter>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.or.is_empty()
            && self.not.is_none()
            && self.relations.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub dir: SortDir,
}

/// Nested relation fetch. Recursive: an include may itself include.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Include {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, Include>,
}

/// Structured parameters of a candidate query: selection, filtering,
/// relation fetches, ordering, pagination and (for writes) the payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, Include>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, ParamValue>,
}

impl QueryParams {
    pub fn has_filter(&self) -> bool {
        self.filter.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
    }
}

/// Candidate query: the unit the sandbox admits or rejects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub entity: String,
    pub action: QueryAction,
    pub params: QueryParams,
}

impl StructuredQuery {
    /// Deterministic human-readable rendering for reviewers and audit.
    pub fn summary(&self) -> String {
        let mut out = format!("{} {}", self.action.as_str(), self.entity);
        if !self.params.select.is_empty() {
            out.push_str(&format!(" select[{}]", self.params.select.join(",")));
        }
        if let Some(filter) = &self.params.filter {
            if !filter.is_empty() {
                let mut keys: Vec<&str> =
                    filter.fields.keys().map(String::as_str).collect();
                keys.extend(filter.relations.keys().map(String::as_str));
                out.push_str(&format!(" where[{}]", keys.join(",")));
                if !filter.or.is_empty() {
                    out.push_str(&format!(" or({})", filter.or.len()));
                }
                if filter.not.is_some() {
                    out.push_str(" not");
                }
            }
        }
        if !self.params.include.is_empty() {
            let rels: Vec<&str> =
                self.params.include.keys().map(String::as_str).collect();
            out.push_str(&format!(" include[{}]", rels.join(",")));
        }
        if !self.params.order_by.is_empty() {
            let keys: Vec<&str> = self
                .params
                .order_by
                .iter()
                .map(|o| o.field.as_str())
                .collect();
            out.push_str(&format!(" order[{}]", keys.join(",")));
        }
        if !self.params.data.is_empty() {
            let keys: Vec<&str> =
                self.params.data.keys().map(String::as_str).collect();
            out.push_str(&format!(" data[{}]", keys.join(",")));
        }
        out
    }
}

/// Why the sandbox rejected a candidate query.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "field", rename_all = "snake_case")]
pub enum ValidationErrorKind {
    #[error("no active grant covers this request")]
    NoGrant,
    #[error("action not granted")]
    ActionNotGranted,
    #[error("field not allowed: {0}")]
    FieldNotAllowed(String),
    #[error("missing required field: {0}")]
    MissingRequiredField(String),
    #[error("relation include too deep: {0}")]
    RelationTooDeep(String),
}

/// Sandbox verdict, persisted verbatim on the request. The descriptor is
/// pinned by id+version so later descriptor edits do not retroactively
/// change what this validation meant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSnapshot {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<ValidationErrorKind>,
    pub covering_grant_id: Option<Uuid>,
    pub descriptor_id: Option<Uuid>,
    pub descriptor_version: Option<String>,
}

/// Lifecycle state of a query request. Transitions are one-directional;
/// no state is ever revisited.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    AutoApproved,
    Approved,
    Rejected,
    Escalated,
    Executed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Failed)
    }

    /// States in which an approval decision may still be applied.
    pub fn is_decidable(&self) -> bool {
        matches!(self, Self::Pending | Self::Escalated)
    }

    pub fn can_transition(&self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Pending, AutoApproved)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Escalated)
                | (Escalated, Approved)
                | (Escalated, Rejected)
                | (AutoApproved, Executed)
                | (AutoApproved, Failed)
                | (Approved, Executed)
                | (Approved, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::AutoApproved => "AUTO_APPROVED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Escalated => "ESCALATED",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        }
    }
}

/// Persisted unit of work: one prompt's journey to execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub prompt: String,
    /// Human-readable rendering of the structured query.
    pub generated_query: String,
    pub entity: String,
    pub action: QueryAction,
    pub params: QueryParams,
    pub status: RequestStatus,
    pub validation: ValidationSnapshot,
    pub is_complex: bool,
    pub requires_approval: bool,
    pub approver_id: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub execution_result: Option<serde_json::Value>,
    pub execution_error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueryRequest {
    pub fn query(&self) -> StructuredQuery {
        StructuredQuery {
            entity: self.entity.clone(),
            action: self.action,
            params: self.params.clone(),
        }
    }
}

/// Caller options for request creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub auto_approve: bool,
    pub use_templates: bool,
    pub max_retries: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            auto_approve: true,
            use_templates: true,
            max_retries: 2,
        }
    }
}

/// What the orchestrator hands back once a request is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestTicket {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub requires_approval: bool,
}

/// Sampling knobs for one generation attempt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Marginally different settings per retry, to escape a degenerate
    /// failure mode of the upstream generator.
    pub fn for_attempt(attempt: u32) -> Self {
        Self {
            temperature: (0.2 * attempt as f32).min(1.0),
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serde_is_kebab_case() {
        let json = serde_json::to_string(&QueryAction::BulkUpdate).unwrap();
        assert_eq!(json, "\"bulk-update\"");
        let back: QueryAction = serde_json::from_str("\"read-many\"").unwrap();
        assert_eq!(back, QueryAction::ReadMany);
    }

    #[test]
    fn destructive_actions_need_explicit_grant() {
        assert!(QueryAction::Delete.needs_explicit_grant());
        assert!(QueryAction::BulkDelete.needs_explicit_grant());
        assert!(!QueryAction::Update.needs_explicit_grant());
        assert!(!QueryAction::ReadMany.needs_explicit_grant());
    }

    #[test]
    fn op_node_parses_before_plain_object() {
        let v: ParamValue = serde_json::from_str(r#"{"op": "gt", "value": 5}"#).unwrap();
        assert!(matches!(v, ParamValue::Op(_)));
        let v: ParamValue = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert!(matches!(v, ParamValue::Object(_)));
    }

    #[test]
    fn terminal_states_never_transition() {
        use RequestStatus::*;
        for terminal in [Rejected, Executed, Failed] {
            for to in [
                Pending,
                AutoApproved,
                Approved,
                Rejected,
                Escalated,
                Executed,
                Failed,
            ] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn pending_reaches_only_decision_states() {
        use RequestStatus::*;
        assert!(Pending.can_transition(AutoApproved));
        assert!(Pending.can_transition(Escalated));
        assert!(!Pending.can_transition(Executed));
        assert!(Escalated.can_transition(Approved));
        assert!(!Escalated.can_transition(Escalated));
    }

    #[test]
    fn summary_is_deterministic() {
        let q = StructuredQuery {
            entity: "User".into(),
            action: QueryAction::ReadMany,
            params: QueryParams {
                select: vec!["id".into(), "email".into()],
                order_by: vec![OrderBy {
                    field: "email".into(),
                    dir: SortDir::Asc,
                }],
                ..Default::default()
            },
        };
        assert_eq!(q.summary(), q.summary());
        assert_eq!(q.summary(), "read-many User select[id,email] order[email]");
    }
}
