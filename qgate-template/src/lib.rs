//! Pre-vetted query templates: the deterministic fast path that avoids
//! generative translation.
//!
//! A template binds one entity/action to a parameterised body with
//! `{{placeholder}}` slots. Filling checks the extracted parameters
//! against the template's schema before anything else happens; a template
//! match never skips sandbox validation, it only skips generation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use qgate_types::{QueryAction, QueryParams, ScalarValue, StructuredQuery};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {template}: placeholder {placeholder} not in parameter schema")]
    UnboundPlaceholder { template: String, placeholder: String },
    #[error("missing required parameter: {0}")]
    MissingParam(String),
    #[error("unknown parameter: {0}")]
    UnknownParam(String),
    #[error("parameter {param} has wrong type (expected {expected}, got {got})")]
    TypeMismatch {
        param: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("template body is not a valid parameter tree: {0}")]
    Body(#[from] serde_json::Error),
    #[error("templates parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    Int,
    Float,
    Bool,
    Uuid,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Uuid => "uuid",
        }
    }

    fn accepts(&self, value: &ScalarValue) -> bool {
        match (self, value) {
            (Self::Text, ScalarValue::Text(_)) => true,
            (Self::Int, ScalarValue::Int(_)) => true,
            (Self::Float, ScalarValue::Float(_) | ScalarValue::Int(_)) => true,
            (Self::Bool, ScalarValue::Bool(_)) => true,
            (Self::Uuid, ScalarValue::Text(t)) => Uuid::parse_str(t).is_ok(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateParam {
    pub kind: ParamKind,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// A named, parameterised, pre-vetted query pattern. The body is JSON for
/// a `QueryParams` tree with unquoted `{{name}}` slots; each slot is
/// replaced by the JSON encoding of the supplied scalar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryTemplate {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub entity: String,
    pub action: QueryAction,
    #[serde(default)]
    pub params: BTreeMap<String, TemplateParam>,
    pub body: String,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl QueryTemplate {
    /// Placeholder names appearing in the body, in order of appearance.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut rest = self.body.as_str();
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    names.insert(after[..end].trim().to_string());
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
        names
    }

    /// Invariant: every placeholder in the body must be declared in the
    /// parameter schema.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for placeholder in self.placeholders() {
            if !self.params.contains_key(&placeholder) {
                return Err(TemplateError::UnboundPlaceholder {
                    template: self.name.clone(),
                    placeholder,
                });
            }
        }
        // The body must parse once all slots are bound; probe with nulls.
        let mut probe = self.body.clone();
        for placeholder in self.placeholders() {
            probe = probe.replace(&format!("{{{{{placeholder}}}}}"), "null");
        }
        let _: QueryParams = serde_json::from_str(&probe)?;
        Ok(())
    }

    /// Check the values against the schema and produce the filled query.
    pub fn fill(
        &self,
        values: &BTreeMap<String, ScalarValue>,
    ) -> Result<StructuredQuery, TemplateError> {
        for key in values.keys() {
            if !self.params.contains_key(key) {
                return Err(TemplateError::UnknownParam(key.clone()));
            }
        }
        for (name, schema) in &self.params {
            match values.get(name) {
                Some(value) => {
                    if !schema.kind.accepts(value) {
                        return Err(TemplateError::TypeMismatch {
                            param: name.clone(),
                            expected: schema.kind.as_str(),
                            got: value.type_name(),
                        });
                    }
                }
                None if schema.required => {
                    return Err(TemplateError::MissingParam(name.clone()));
                }
                None => {}
            }
        }

        let mut body = self.body.clone();
        for (name, value) in values {
            let slot = format!("{{{{{name}}}}}");
            let encoded = serde_json::to_string(value)?;
            body = body.replace(&slot, &encoded);
        }
        // Optional, unfilled slots become null.
        for placeholder in self.placeholders() {
            body = body.replace(&format!("{{{{{placeholder}}}}}"), "null");
        }

        let params: QueryParams = serde_json::from_str(&body)?;
        Ok(StructuredQuery {
            entity: self.entity.clone(),
            action: self.action,
            params,
        })
    }
}

/// Outcome of a successful template match.
#[derive(Clone, Debug)]
pub struct TemplateMatch {
    pub template_id: Uuid,
    pub values: BTreeMap<String, ScalarValue>,
}

/// Matching may be deterministic or delegated to the generator; the only
/// contract is that the returned template exists and is active, and that
/// filling it with the extracted values succeeds. Anything else is a
/// non-match, never a bypass.
#[async_trait]
pub trait TemplateMatcher: Send + Sync {
    async fn match_prompt(
        &self,
        prompt: &str,
        templates: &[QueryTemplate],
    ) -> Option<TemplateMatch>;
}

/// Matcher that never matches; every prompt falls through to generation.
pub struct NullMatcher;

#[async_trait]
impl TemplateMatcher for NullMatcher {
    async fn match_prompt(&self, _prompt: &str, _templates: &[QueryTemplate]) -> Option<TemplateMatch> {
        None
    }
}

/// Lightweight deterministic matcher: a template matches when every token
/// of its name appears in the prompt, and parameters are extracted from
/// `key:value` / `key=value` tokens. Best (longest-name) match wins; ties
/// break on template name.
pub struct KeywordMatcher;

impl KeywordMatcher {
    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn extract_values(prompt: &str, template: &QueryTemplate) -> Option<BTreeMap<String, ScalarValue>> {
        let mut values = BTreeMap::new();
        for token in prompt.split_whitespace() {
            let Some((key, raw)) = token.split_once(':').or_else(|| token.split_once('=')) else {
                continue;
            };
            let Some(schema) = template.params.get(key) else {
                continue;
            };
            let value = Self::coerce(raw, schema.kind)?;
            values.insert(key.to_string(), value);
        }
        for (name, schema) in &template.params {
            if schema.required && !values.contains_key(name) {
                return None;
            }
        }
        Some(values)
    }

    fn coerce(raw: &str, kind: ParamKind) -> Option<ScalarValue> {
        match kind {
            ParamKind::Text => Some(ScalarValue::Text(raw.to_string())),
            ParamKind::Int => raw.parse().ok().map(ScalarValue::Int),
            ParamKind::Float => raw.parse().ok().map(ScalarValue::Float),
            ParamKind::Bool => raw.parse().ok().map(ScalarValue::Bool),
            ParamKind::Uuid => Uuid::parse_str(raw)
                .ok()
                .map(|_| ScalarValue::Text(raw.to_string())),
        }
    }
}

#[async_trait]
impl TemplateMatcher for KeywordMatcher {
    async fn match_prompt(
        &self,
        prompt: &str,
        templates: &[QueryTemplate],
    ) -> Option<TemplateMatch> {
        let prompt_tokens = Self::tokens(prompt);
        let mut best: Option<(usize, &QueryTemplate, BTreeMap<String, ScalarValue>)> = None;

        for template in templates.iter().filter(|t| t.is_active) {
            let name_tokens = Self::tokens(&template.name);
            if name_tokens.is_empty()
                || !name_tokens.iter().all(|t| prompt_tokens.contains(t))
            {
                continue;
            }
            let Some(values) = Self::extract_values(prompt, template) else {
                continue;
            };
            let score = name_tokens.len();
            let better = match &best {
                Some((best_score, best_template, _)) => {
                    score > *best_score
                        || (score == *best_score && template.name < best_template.name)
                }
                None => true,
            };
            if better {
                best = Some((score, template, values));
            }
        }

        best.map(|(_, template, values)| TemplateMatch {
            template_id: template.id,
            values,
        })
    }
}

/// YAML config shape for authored templates.
#[derive(Debug, Deserialize)]
pub struct TemplatesFile {
    pub templates: Vec<QueryTemplate>,
}

impl TemplatesFile {
    pub fn parse_yaml(yaml: &str) -> Result<Vec<QueryTemplate>, TemplateError> {
        let file: Self = serde_yaml::from_str(yaml)?;
        for template in &file.templates {
            template.validate()?;
        }
        Ok(file.templates)
    }
}
