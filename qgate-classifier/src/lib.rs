//! Risk classification for candidate queries.
//!
//! A pure predicate set over (entity, action, parameters): any single true
//! predicate marks the whole query complex, which forces human approval
//! regardless of the grant's own approval flag.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use qgate_types::{Filter, StructuredQuery};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Entities whose writes and unfiltered reads always count as complex.
    pub sensitive_entities: BTreeSet<String>,
    pub max_included_relations: usize,
    pub max_filter_keys: usize,
    pub max_sort_keys: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sensitive_entities: BTreeSet::new(),
            max_included_relations: 2,
            max_filter_keys: 5,
            max_sort_keys: 2,
        }
    }
}

/// Which predicate fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityReason {
    BulkAction,
    SensitiveWrite,
    UnfilteredSensitiveRead,
    RelationFanOut,
    NestedInclude,
    DisjunctiveFilter,
    NegatedFilter,
    WideFilter,
    QuantifiedFilter,
    WideOrdering,
}

impl ComplexityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkAction => "bulk_action",
            Self::SensitiveWrite => "sensitive_write",
            Self::UnfilteredSensitiveRead => "unfiltered_sensitive_read",
            Self::RelationFanOut => "relation_fan_out",
            Self::NestedInclude => "nested_include",
            Self::DisjunctiveFilter => "disjunctive_filter",
            Self::NegatedFilter => "negated_filter",
            Self::WideFilter => "wide_filter",
            Self::QuantifiedFilter => "quantified_filter",
            Self::WideOrdering => "wide_ordering",
        }
    }
}

/// Every predicate that fires, in a fixed order.
pub fn classify(cfg: &ClassifierConfig, query: &StructuredQuery) -> Vec<ComplexityReason> {
    let mut reasons = Vec::new();
    let params = &query.params;
    let sensitive = cfg.sensitive_entities.contains(&query.entity);

    if query.action.is_bulk() {
        reasons.push(ComplexityReason::BulkAction);
    }
    if sensitive && query.action.is_write() {
        reasons.push(ComplexityReason::SensitiveWrite);
    }
    if sensitive && query.action.is_read() && !params.has_filter() {
        reasons.push(ComplexityReason::UnfilteredSensitiveRead);
    }

    if params.include.len() > cfg.max_included_relations {
        reasons.push(ComplexityReason::RelationFanOut);
    }
    if params.include.values().any(|inc| !inc.include.is_empty()) {
        reasons.push(ComplexityReason::NestedInclude);
    }

    if let Some(filter) = &params.filter {
        if filter.or.len() > 1 {
            reasons.push(ComplexityReason::DisjunctiveFilter);
        }
        if has_negation(filter) {
            reasons.push(ComplexityReason::NegatedFilter);
        }
        if filter.fields.len() > cfg.max_filter_keys {
            reasons.push(ComplexityReason::WideFilter);
        }
        if has_quantifier(filter) {
            reasons.push(ComplexityReason::QuantifiedFilter);
        }
    }

    if params.order_by.len() > cfg.max_sort_keys {
        reasons.push(ComplexityReason::WideOrdering);
    }

    reasons
}

pub fn is_complex(cfg: &ClassifierConfig, query: &StructuredQuery) -> bool {
    !classify(cfg, query).is_empty()
}

fn has_negation(filter: &Filter) -> bool {
    filter.not.is_some()
        || filter.or.iter().any(has_negation)
        || filter
            .relations
            .values()
            .any(|rel| has_negation(&rel.filter))
}

fn has_quantifier(filter: &Filter) -> bool {
    !filter.relations.is_empty()
        || filter.or.iter().any(has_quantifier)
        || filter
            .not
            .as_deref()
            .map(has_quantifier)
            .unwrap_or(false)
}

/// Convenience for audit detail: reasons as a stable string list.
pub fn reason_names(reasons: &[ComplexityReason]) -> Vec<&'static str> {
    reasons.iter().map(|r| r.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_types::{
        Include, OrderBy, ParamValue, QueryAction, RelationFilter, RelationQuantifier,
        ScalarValue, SortDir,
    };
    use std::collections::BTreeMap;

    fn query(entity: &str, action: QueryAction) -> StructuredQuery {
        StructuredQuery {
            entity: entity.into(),
            action,
            params: Default::default(),
        }
    }

    fn cfg_with_sensitive(entity: &str) -> ClassifierConfig {
        let mut cfg = ClassifierConfig::default();
        cfg.sensitive_entities.insert(entity.into());
        cfg
    }

    #[test]
    fn plain_read_is_not_complex() {
        let cfg = ClassifierConfig::default();
        let q = query("User", QueryAction::ReadMany);
        assert!(!is_complex(&cfg, &q));
    }

    #[test]
    fn bulk_actions_are_always_complex() {
        let cfg = ClassifierConfig::default();
        let q = query("User", QueryAction::BulkDelete);
        assert_eq!(classify(&cfg, &q), vec![ComplexityReason::BulkAction]);
    }

    #[test]
    fn sensitive_write_and_unfiltered_sensitive_read() {
        let cfg = cfg_with_sensitive("Payment");
        let q = query("Payment", QueryAction::Update);
        assert!(classify(&cfg, &q).contains(&ComplexityReason::SensitiveWrite));

        let q = query("Payment", QueryAction::Count);
        assert!(classify(&cfg, &q).contains(&ComplexityReason::UnfilteredSensitiveRead));

        // A filtered read of a sensitive entity is fine on its own.
        let mut q = query("Payment", QueryAction::ReadMany);
        q.params.filter = Some(Filter {
            fields: [(
                "status".to_string(),
                ParamValue::Scalar(ScalarValue::Text("open".into())),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        assert!(!is_complex(&cfg, &q));
    }

    #[test]
    fn relation_fan_out_and_nesting() {
        let cfg = ClassifierConfig::default();
        let mut q = query("User", QueryAction::ReadMany);
        let mut includes: BTreeMap<String, Include> = BTreeMap::new();
        for name in ["posts", "teams", "sessions"] {
            includes.insert(name.into(), Include::default());
        }
        q.params.include = includes;
        assert!(classify(&cfg, &q).contains(&ComplexityReason::RelationFanOut));

        let mut q = query("User", QueryAction::ReadMany);
        q.params.include = [(
            "posts".to_string(),
            Include {
                include: [("comments".to_string(), Include::default())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();
        assert!(classify(&cfg, &q).contains(&ComplexityReason::NestedInclude));
    }

    #[test]
    fn filter_shape_predicates() {
        let cfg = ClassifierConfig::default();
        let mut q = query("User", QueryAction::ReadMany);
        q.params.filter = Some(Filter {
            or: vec![Filter::default(), Filter::default()],
            ..Default::default()
        });
        assert!(classify(&cfg, &q).contains(&ComplexityReason::DisjunctiveFilter));

        let mut q = query("User", QueryAction::ReadMany);
        q.params.filter = Some(Filter {
            not: Some(Box::new(Filter::default())),
            ..Default::default()
        });
        assert!(classify(&cfg, &q).contains(&ComplexityReason::NegatedFilter));

        let mut q = query("User", QueryAction::ReadMany);
        let mut fields = BTreeMap::new();
        for i in 0..6 {
            fields.insert(format!("f{i}"), ParamValue::Scalar(ScalarValue::Int(i)));
        }
        q.params.filter = Some(Filter {
            fields,
            ..Default::default()
        });
        assert!(classify(&cfg, &q).contains(&ComplexityReason::WideFilter));

        let mut q = query("User", QueryAction::ReadMany);
        q.params.filter = Some(Filter {
            relations: [(
                "posts".to_string(),
                RelationFilter {
                    quantifier: RelationQuantifier::Every,
                    filter: Filter::default(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        assert!(classify(&cfg, &q).contains(&ComplexityReason::QuantifiedFilter));
    }

    #[test]
    fn wide_ordering() {
        let cfg = ClassifierConfig::default();
        let mut q = query("User", QueryAction::ReadMany);
        q.params.order_by = (0..3)
            .map(|i| OrderBy {
                field: format!("f{i}"),
                dir: SortDir::Asc,
            })
            .collect();
        assert!(classify(&cfg, &q).contains(&ComplexityReason::WideOrdering));
    }

    #[test]
    fn classification_is_idempotent() {
        let cfg = cfg_with_sensitive("Payment");
        let mut q = query("Payment", QueryAction::BulkUpdate);
        q.params.order_by = (0..3)
            .map(|i| OrderBy {
                field: format!("f{i}"),
                dir: SortDir::Desc,
            })
            .collect();
        assert_eq!(classify(&cfg, &q), classify(&cfg, &q));
    }
}
