//! Generation backend boundary.
//!
//! The backend turns a prompt plus a descriptor summary into raw text that
//! should contain one JSON candidate query. It is untrusted: whatever comes
//! back is parsed strictly and then sandbox-validated by the caller. Calls
//! are idempotent-safe to retry with different sampling settings.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use qgate_schema::SchemaDescriptor;
use qgate_types::{QueryAction, QueryParams, SamplingParams, StructuredQuery};

pub mod http_openai;
pub use http_openai::HttpOpenAiGenerator;

#[derive(Debug, Error)]
#[error("generation error: {message}")]
pub struct GenerateError {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object in generator output")]
    NoJson,
    #[error("candidate is not a structured query: {0}")]
    BadShape(#[from] serde_json::Error),
}

#[async_trait]
pub trait QueryGenerator: Send + Sync {
    /// One generation attempt. `system_context` is the rendered descriptor
    /// summary; the returned string is raw model output.
    async fn generate(
        &self,
        system_context: &str,
        prompt: &str,
        sampling: SamplingParams,
    ) -> Result<String, GenerateError>;
}

/// Backend for deployments without a generator; every attempt fails.
pub struct NullGenerator;

#[async_trait]
impl QueryGenerator for NullGenerator {
    async fn generate(
        &self,
        _system_context: &str,
        _prompt: &str,
        _sampling: SamplingParams,
    ) -> Result<String, GenerateError> {
        Err(GenerateError {
            message: "no generation backend configured".into(),
        })
    }
}

/// Fixed-output backend for tests and the offline demo.
pub struct StaticGenerator {
    pub raw: String,
}

impl StaticGenerator {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn for_query(query: &StructuredQuery) -> Self {
        Self {
            // Wire shape mirrors CandidateWire.
            raw: serde_json::json!({
                "entity": query.entity,
                "action": query.action,
                "params": query.params,
            })
            .to_string(),
        }
    }
}

#[async_trait]
impl QueryGenerator for StaticGenerator {
    async fn generate(
        &self,
        _system_context: &str,
        _prompt: &str,
        _sampling: SamplingParams,
    ) -> Result<String, GenerateError> {
        Ok(self.raw.clone())
    }
}

#[derive(Deserialize)]
struct CandidateWire {
    entity: String,
    action: QueryAction,
    #[serde(default)]
    params: QueryParams,
}

/// Parse raw generator output into a candidate query.
///
/// Models wrap JSON in prose and code fences; we take the outermost brace
/// span and parse that strictly. Anything else is a parse failure, which
/// the orchestrator treats as retryable.
pub fn parse_candidate(raw: &str) -> Result<StructuredQuery, ParseError> {
    let start = raw.find('{').ok_or(ParseError::NoJson)?;
    let end = raw.rfind('}').ok_or(ParseError::NoJson)?;
    if end < start {
        return Err(ParseError::NoJson);
    }
    let wire: CandidateWire = serde_json::from_str(&raw[start..=end])?;
    Ok(StructuredQuery {
        entity: wire.entity,
        action: wire.action,
        params: wire.params,
    })
}

/// Render the union of resolvable descriptors as generation context.
pub fn render_context(descriptors: &[std::sync::Arc<SchemaDescriptor>]) -> String {
    let mut out = String::new();
    for descriptor in descriptors {
        out.push_str(&format!(
            "schema {} (version {}):\n",
            descriptor.name, descriptor.version
        ));
        for (entity, cap) in &descriptor.entities {
            let actions: Vec<&str> = cap.actions.iter().map(|a| a.as_str()).collect();
            let fields: Vec<&str> = cap.fields.iter().map(String::as_str).collect();
            out.push_str(&format!(
                "  {entity}: actions[{}] fields[{}]",
                actions.join(","),
                fields.join(",")
            ));
            if !cap.relations.is_empty() {
                let rels: Vec<String> = cap
                    .relations
                    .iter()
                    .map(|(name, rel)| format!("{name}->{}", rel.target_entity))
                    .collect();
                out.push_str(&format!(" relations[{}]", rels.join(",")));
            }
            out.push('\n');
        }
    }
    out
}

/// System prompt handed to the backend together with the rendered context.
pub fn build_system_prompt(context: &str) -> String {
    format!(
        "You translate a natural-language request into exactly one JSON object \
         {{\"entity\": ..., \"action\": ..., \"params\": ...}} using only the \
         entities, fields and actions listed below. Respond with the JSON object \
         and nothing else.\n\n{context}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_types::QueryAction;

    #[test]
    fn parses_fenced_output() {
        let raw = "Sure, here is the query:\n```json\n{\"entity\": \"User\", \"action\": \"read-many\"}\n```";
        let q = parse_candidate(raw).unwrap();
        assert_eq!(q.entity, "User");
        assert_eq!(q.action, QueryAction::ReadMany);
        assert_eq!(q.params, Default::default());
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(matches!(
            parse_candidate("I cannot do that"),
            Err(ParseError::NoJson)
        ));
    }

    #[test]
    fn rejects_malformed_candidate() {
        assert!(matches!(
            parse_candidate("{\"entity\": \"User\"}"),
            Err(ParseError::BadShape(_))
        ));
        assert!(matches!(
            parse_candidate("{\"entity\": \"User\", \"action\": \"drop-table\"}"),
            Err(ParseError::BadShape(_))
        ));
    }

    #[tokio::test]
    async fn static_generator_round_trips() {
        let query = StructuredQuery {
            entity: "User".into(),
            action: QueryAction::Count,
            params: Default::default(),
        };
        let backend = StaticGenerator::for_query(&query);
        let raw = backend
            .generate("", "count users", SamplingParams::for_attempt(0))
            .await
            .unwrap();
        assert_eq!(parse_candidate(&raw).unwrap(), query);
    }
}
