use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use qgate_audit::AuditLog;
use qgate_classifier::ClassifierConfig;
use qgate_core::{
    NullApprovalGateway, NullQueryExecutor, Orchestrator, OrchestratorError, ProcessAction,
};
use qgate_grant::{GrantsFile, InMemoryGrantDirectory};
use qgate_infer::{HttpOpenAiGenerator, NullGenerator, QueryGenerator};
use qgate_sandbox::Sandbox;
use qgate_schema::{DescriptorRegistry, SchemaDescriptor};
use qgate_store::{InMemoryRequestStore, Page, RequestFilter};
use qgate_template::{KeywordMatcher, TemplatesFile};
use qgate_types::{QueryParams, RequestOptions, RequestStatus};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
struct CreateRequestBody {
    agent_id: Uuid,
    user_id: Uuid,
    #[serde(default)]
    session_id: Option<Uuid>,
    prompt: String,
    #[serde(default)]
    options: Option<RequestOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionKind {
    Approve,
    Reject,
    Escalate,
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    approver_id: Uuid,
    decision: DecisionKind,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    modified_params: Option<QueryParams>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    agent_id: Option<Uuid>,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    status: Option<RequestStatus>,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    take: Option<usize>,
    #[serde(default)]
    skip: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let mut registry = DescriptorRegistry::new();
    let descriptor_paths = std::env::var("QGATE_DESCRIPTORS")
        .unwrap_or_else(|_| "./descriptors.yaml".into());
    for path in descriptor_paths.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let yaml = std::fs::read_to_string(path)?;
        let descriptor = SchemaDescriptor::parse_yaml(&yaml)?;
        info!(name = %descriptor.name, version = %descriptor.version, "loaded descriptor");
        registry.insert(descriptor)?;
    }
    let registry = Arc::new(registry);

    let directory = Arc::new(InMemoryGrantDirectory::new(Arc::clone(&registry)));
    if let Ok(path) = std::env::var("QGATE_GRANTS") {
        let yaml = std::fs::read_to_string(&path)?;
        let loaded = GrantsFile::parse_yaml(&yaml)?
            .load_into(&registry, &directory)
            .await?;
        info!(count = loaded, "loaded grants");
    }

    let templates = match std::env::var("QGATE_TEMPLATES") {
        Ok(path) => {
            let yaml = std::fs::read_to_string(&path)?;
            let templates = TemplatesFile::parse_yaml(&yaml)?;
            info!(count = templates.len(), "loaded templates");
            templates
        }
        Err(_) => Vec::new(),
    };

    let use_stub = std::env::var("LLM_STUB")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);
    let generator: Arc<dyn QueryGenerator> = if use_stub {
        Arc::new(NullGenerator)
    } else {
        let llm_url = std::env::var("LLM_LOCAL_URL")
            .unwrap_or_else(|_| "http://localhost:8000/v1".into());
        let llm_model = std::env::var("LLM_MODEL")
            .unwrap_or_else(|_| "mistralai/Mistral-7B-Instruct-v0.3".into());
        Arc::new(HttpOpenAiGenerator::new(llm_url, llm_model))
    };

    let audit_path =
        std::env::var("QGATE_AUDIT_FILE").unwrap_or_else(|_| "./audit.jsonl".into());
    let audit = Arc::new(AuditLog::open(&audit_path)?);

    let sandbox = match std::env::var("QGATE_MAX_RELATION_DEPTH")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(depth) => Sandbox::new(depth),
        None => Sandbox::default(),
    };
    let mut classifier = ClassifierConfig::default();
    if let Ok(entities) = std::env::var("QGATE_SENSITIVE_ENTITIES") {
        classifier.sensitive_entities = entities
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
    }

    let orchestrator = Arc::new(
        Orchestrator::new(
            directory,
            Arc::new(KeywordMatcher),
            generator,
            Arc::new(InMemoryRequestStore::new()),
            Arc::new(NullApprovalGateway),
            Arc::new(NullQueryExecutor),
            audit,
        )
        .with_templates(templates)
        .with_sandbox(sandbox)
        .with_classifier(classifier),
    );

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/query-requests", post(create_request).get(list_requests))
        .route("/v1/query-requests/:id", get(get_request))
        .route("/v1/query-requests/:id/decision", post(decide_request))
        .with_state(AppState { orchestrator })
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = std::env::var("QGATE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7100".into())
        .parse()?;
    info!(%addr, "query gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    let options = body.options.unwrap_or_default();
    let ticket = state
        .orchestrator
        .create_query_request(
            body.agent_id,
            body.user_id,
            body.session_id,
            &body.prompt,
            options,
        )
        .await
        .map_err(into_http)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "request_id": ticket.request_id,
            "status": ticket.status,
            "requires_approval": ticket.requires_approval,
        })),
    ))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let request = state
        .orchestrator
        .get_query_request(id)
        .await
        .map_err(into_http)?;
    Ok(Json(serde_json::to_value(request).map_err(internal)?))
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let filter = RequestFilter {
        agent_id: query.agent_id,
        user_id: query.user_id,
        status: query.status,
        entity: query.entity,
    };
    let mut page = Page::default();
    if let Some(take) = query.take {
        page.take = take;
    }
    if let Some(skip) = query.skip {
        page.skip = skip;
    }
    let result = state
        .orchestrator
        .list_query_requests(filter, page)
        .await
        .map_err(into_http)?;
    Ok(Json(serde_json::json!({
        "total": result.total,
        "items": serde_json::to_value(result.items).map_err(internal)?,
    })))
}

async fn decide_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let action = match body.decision {
        DecisionKind::Approve => ProcessAction::Approve {
            modified_params: body.modified_params,
        },
        DecisionKind::Reject => {
            let Some(reason) = body.reason else {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({ "error": "rejection requires a reason" })),
                ));
            };
            ProcessAction::Reject { reason }
        }
        DecisionKind::Escalate => ProcessAction::Escalate,
    };
    let updated = state
        .orchestrator
        .process_query_request(body.approver_id, id, action)
        .await
        .map_err(into_http)?;
    Ok(Json(serde_json::to_value(updated).map_err(internal)?))
}

fn into_http(err: OrchestratorError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        OrchestratorError::NoGrant | OrchestratorError::ValidationFailed(_) => {
            StatusCode::FORBIDDEN
        }
        OrchestratorError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::RequestNotPending { .. } => StatusCode::CONFLICT,
        OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match &err {
        OrchestratorError::ValidationFailed(errors) => serde_json::json!({
            "error": err.to_string(),
            "validation_errors": errors,
        }),
        _ => serde_json::json!({ "error": err.to_string() }),
    };
    (status, Json(body))
}

fn internal(err: serde_json::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}
