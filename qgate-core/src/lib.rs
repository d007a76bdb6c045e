//! The prompt-to-query orchestrator: end-to-end pipeline from an agent's
//! natural-language prompt to a persisted, correctly-staged query request.
//!
//! Pipeline: resolve grants -> quota fast-fail -> template match ->
//! generative fallback with bounded escalating retries -> sandbox
//! validation -> complexity classification -> atomic persist -> approval
//! hand-off or inline execution. Steps before persistence fail fast and
//! never leave a dangling record; once a request exists, only the approval
//! and execution collaborators move it, and every transition is audited.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use qgate_audit::{AuditEvent, AuditLog, AuditStage};
use qgate_classifier::{classify, reason_names, ClassifierConfig};
use qgate_grant::{GrantDirectory, GrantSnapshot};
use qgate_infer::{parse_candidate, render_context, build_system_prompt, QueryGenerator};
use qgate_sandbox::Sandbox;
use qgate_store::{
    Decision, DecisionRecord, Page, QueryLog, RequestFilter, RequestPage, RequestStore,
    StoreError,
};
use qgate_template::{QueryTemplate, TemplateMatcher};
use qgate_types::{
    QueryParams, QueryRequest, RequestOptions, RequestStatus, RequestTicket, SamplingParams,
    StructuredQuery, ValidationErrorKind,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("agent holds no active grant")]
    NoGrant,
    #[error("daily quota of {limit} queries exhausted")]
    QuotaExceeded { limit: u32 },
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("query rejected by sandbox")]
    ValidationFailed(Vec<ValidationErrorKind>),
    #[error("request is {status:?}, not awaiting a decision")]
    RequestNotPending { status: RequestStatus },
    #[error("request {0} not found")]
    NotFound(Uuid),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded { limit } => Self::QuotaExceeded { limit },
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::NotDecidable { status } => Self::RequestNotPending { status },
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Error)]
#[error("approval gateway error: {message}")]
pub struct GatewayError {
    pub message: String,
}

/// Registration with the external approval/escalation system.
/// Fire-and-forget: the orchestrator never blocks on human review, and a
/// submission failure leaves the request PENDING rather than failing the
/// caller.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    async fn submit(&self, request: &QueryRequest) -> Result<Uuid, GatewayError>;
}

/// Gateway for deployments without an approval system; pending requests
/// simply wait.
pub struct NullApprovalGateway;

#[async_trait]
impl ApprovalGateway for NullApprovalGateway {
    async fn submit(&self, _request: &QueryRequest) -> Result<Uuid, GatewayError> {
        Ok(Uuid::new_v4())
    }
}

#[derive(Debug, Error)]
#[error("execution error: {message}")]
pub struct ExecError {
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub result: serde_json::Value,
    pub row_count: Option<u64>,
}

/// The relational engine boundary. Implementations must re-resolve the
/// descriptor/grant pinned on `request.validation` rather than trusting
/// any in-memory copy from validation time.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, request: &QueryRequest) -> Result<ExecutionOutcome, ExecError>;
}

/// Executor for deployments without a relational backend.
pub struct NullQueryExecutor;

#[async_trait]
impl QueryExecutor for NullQueryExecutor {
    async fn execute(&self, _request: &QueryRequest) -> Result<ExecutionOutcome, ExecError> {
        Err(ExecError {
            message: "no execution backend configured".into(),
        })
    }
}

/// Demo/test executor: echoes the validated query instead of running it.
pub struct EchoExecutor;

#[async_trait]
impl QueryExecutor for EchoExecutor {
    async fn execute(&self, request: &QueryRequest) -> Result<ExecutionOutcome, ExecError> {
        Ok(ExecutionOutcome {
            result: serde_json::json!({ "echo": request.generated_query }),
            row_count: Some(0),
        })
    }
}

/// Which grant supplies the quota once a candidate is admitted.
///
/// Admission is a union check across grants; limiting is deliberately
/// asymmetric in the source system (most conservative wins). Both
/// interpretations are preserved behind this switch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QuotaPolicy {
    /// Minimum `max_queries_per_day` across all covering grants.
    #[default]
    MinAcrossCovering,
    /// The quota of the single grant that supplied admission.
    CoveringGrantOnly,
}

/// Decision applied by `process_query_request`.
#[derive(Clone, Debug)]
pub enum ProcessAction {
    Approve { modified_params: Option<QueryParams> },
    Reject { reason: String },
    Escalate,
}

pub struct Orchestrator {
    directory: Arc<dyn GrantDirectory>,
    matcher: Arc<dyn TemplateMatcher>,
    generator: Arc<dyn QueryGenerator>,
    store: Arc<dyn RequestStore>,
    approvals: Arc<dyn ApprovalGateway>,
    executor: Arc<dyn QueryExecutor>,
    audit: Arc<AuditLog>,
    templates: Vec<QueryTemplate>,
    sandbox: Sandbox,
    classifier: ClassifierConfig,
    quota_policy: QuotaPolicy,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<dyn GrantDirectory>,
        matcher: Arc<dyn TemplateMatcher>,
        generator: Arc<dyn QueryGenerator>,
        store: Arc<dyn RequestStore>,
        approvals: Arc<dyn ApprovalGateway>,
        executor: Arc<dyn QueryExecutor>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            directory,
            matcher,
            generator,
            store,
            approvals,
            executor,
            audit,
            templates: Vec::new(),
            sandbox: Sandbox::default(),
            classifier: ClassifierConfig::default(),
            quota_policy: QuotaPolicy::default(),
        }
    }

    pub fn with_templates(mut self, templates: Vec<QueryTemplate>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_quota_policy(mut self, policy: QuotaPolicy) -> Self {
        self.quota_policy = policy;
        self
    }

    /// Create a query request from a prompt.
    ///
    /// Returns once the request is persisted (and, for auto-approved
    /// requests, executed inline); the ticket reflects the persisted
    /// status at return time. Failures before persistence leave no record.
    pub async fn create_query_request(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        session_id: Option<Uuid>,
        prompt: &str,
        options: RequestOptions,
    ) -> Result<RequestTicket, OrchestratorError> {
        let grants = self.directory.active_grants(agent_id).await;
        if grants.is_empty() {
            return Err(OrchestratorError::NoGrant);
        }

        // Fast-fail before spending generation cost. The covering set is
        // unknowable before a candidate exists, so compare against the
        // largest quota any grant could supply; the authoritative
        // covering-set check happens race-free at insert time.
        let precheck_limit = grants
            .iter()
            .map(|g| g.grant.max_queries_per_day)
            .max()
            .unwrap_or(0);
        let window_start = qgate_store::quota_window_start(Utc::now());
        let used = self.store.count_since(agent_id, window_start).await;
        if used >= u64::from(precheck_limit) {
            return Err(OrchestratorError::QuotaExceeded {
                limit: precheck_limit,
            });
        }

        let (query, template_auto_approve) = match self
            .candidate_from_templates(prompt, &options)
            .await
        {
            Some((query, auto)) => (query, auto),
            None => (self.candidate_from_generator(prompt, &grants, &options).await?, false),
        };

        let verdict = self.sandbox.validate(&query, &grants);
        if !verdict.valid {
            return Err(OrchestratorError::ValidationFailed(verdict.errors));
        }

        let reasons = classify(&self.classifier, &query);
        let is_complex = !reasons.is_empty();

        let covering = self.sandbox.covering(&query, &grants);
        let requires_approval =
            covering.iter().any(|g| g.grant.requires_approval) || is_complex;

        let auto_approve = options.auto_approve || template_auto_approve;
        let status = if auto_approve && !requires_approval {
            RequestStatus::AutoApproved
        } else {
            RequestStatus::Pending
        };

        let quota_limit = self.quota_limit(&covering, verdict.covering_grant_id);
        let request = QueryRequest {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            session_id,
            prompt: prompt.to_string(),
            generated_query: query.summary(),
            entity: query.entity.clone(),
            action: query.action,
            params: query.params.clone(),
            status,
            validation: verdict,
            is_complex,
            requires_approval,
            approver_id: None,
            approved_at: None,
            rejection_reason: None,
            execution_result: None,
            execution_error: None,
            executed_at: None,
            created_at: Utc::now(),
        };
        self.store
            .insert_within_quota(request.clone(), quota_limit)
            .await?;

        self.audit_event(
            &request,
            AuditStage::RequestCreated,
            format!(
                "{} complexity[{}]",
                request.generated_query,
                reason_names(&reasons).join(",")
            ),
        );

        if requires_approval {
            // Fire-and-forget registration; an unreachable approval system
            // leaves the request PENDING.
            let _ = self.approvals.submit(&request).await;
            return Ok(ticket(&request));
        }

        if status == RequestStatus::AutoApproved {
            let executed = self.run_execution(request).await?;
            return Ok(ticket(&executed));
        }

        Ok(ticket(&request))
    }

    /// Apply an approval decision on behalf of `approver_id`.
    pub async fn process_query_request(
        &self,
        approver_id: Uuid,
        request_id: Uuid,
        action: ProcessAction,
    ) -> Result<QueryRequest, OrchestratorError> {
        // A reviewer-modified payload must not widen the query past the
        // agent's grants; re-validate before applying.
        if let ProcessAction::Approve {
            modified_params: Some(params),
        } = &action
        {
            let current = self.store.get(request_id).await?;
            if !current.status.is_decidable() {
                return Err(OrchestratorError::RequestNotPending {
                    status: current.status,
                });
            }
            let grants = self.directory.active_grants(current.agent_id).await;
            let modified = StructuredQuery {
                entity: current.entity.clone(),
                action: current.action,
                params: params.clone(),
            };
            let verdict = self.sandbox.validate(&modified, &grants);
            if !verdict.valid {
                return Err(OrchestratorError::ValidationFailed(verdict.errors));
            }
        }

        let decision = match action {
            ProcessAction::Approve { modified_params } => Decision::Approve { modified_params },
            ProcessAction::Reject { reason } => Decision::Reject { reason },
            ProcessAction::Escalate => Decision::Escalate,
        };
        let updated = self
            .store
            .apply_decision(
                request_id,
                DecisionRecord {
                    approver_id,
                    decision,
                },
            )
            .await?;

        self.audit_event(
            &updated,
            AuditStage::ApprovalDecision,
            match &updated.rejection_reason {
                Some(reason) => format!("{} ({reason})", updated.status.as_str()),
                None => updated.status.as_str().to_string(),
            },
        );

        if updated.status == RequestStatus::Approved {
            return self.run_execution(updated).await;
        }
        Ok(updated)
    }

    pub async fn get_query_request(&self, id: Uuid) -> Result<QueryRequest, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_query_requests(
        &self,
        filter: RequestFilter,
        page: Page,
    ) -> Result<RequestPage, OrchestratorError> {
        Ok(self.store.list(filter, page).await?)
    }

    /// Template fast path. Any miss (no match, unknown/inactive template,
    /// schema-violating extraction) falls through to generation.
    async fn candidate_from_templates(
        &self,
        prompt: &str,
        options: &RequestOptions,
    ) -> Option<(StructuredQuery, bool)> {
        if !options.use_templates || self.templates.is_empty() {
            return None;
        }
        let matched = self.matcher.match_prompt(prompt, &self.templates).await?;
        let template = self
            .templates
            .iter()
            .find(|t| t.id == matched.template_id && t.is_active)?;
        let query = template.fill(&matched.values).ok()?;
        Some((query, template.auto_approve))
    }

    /// Generative fallback with bounded retries; each retry escalates the
    /// sampling settings slightly.
    async fn candidate_from_generator(
        &self,
        prompt: &str,
        grants: &[GrantSnapshot],
        options: &RequestOptions,
    ) -> Result<StructuredQuery, OrchestratorError> {
        let mut descriptors: Vec<_> = grants.iter().map(|g| Arc::clone(&g.descriptor)).collect();
        descriptors.sort_by_key(|d| d.id);
        descriptors.dedup_by_key(|d| d.id);
        let system = build_system_prompt(&render_context(&descriptors));

        let mut last_error = String::from("no attempts made");
        for attempt in 0..=options.max_retries {
            let sampling = SamplingParams::for_attempt(attempt);
            match self.generator.generate(&system, prompt, sampling).await {
                Ok(raw) => match parse_candidate(&raw) {
                    Ok(query) => return Ok(query),
                    Err(err) => last_error = err.to_string(),
                },
                Err(err) => last_error = err.to_string(),
            }
        }
        Err(OrchestratorError::GenerationFailed(last_error))
    }

    fn quota_limit(&self, covering: &[&GrantSnapshot], covering_grant_id: Option<Uuid>) -> u32 {
        match self.quota_policy {
            QuotaPolicy::MinAcrossCovering => covering
                .iter()
                .map(|g| g.grant.max_queries_per_day)
                .min()
                .unwrap_or(0),
            QuotaPolicy::CoveringGrantOnly => covering
                .iter()
                .find(|g| Some(g.grant.id) == covering_grant_id)
                .map(|g| g.grant.max_queries_per_day)
                .unwrap_or(0),
        }
    }

    async fn run_execution(
        &self,
        request: QueryRequest,
    ) -> Result<QueryRequest, OrchestratorError> {
        let started_at = Utc::now();
        let timer = std::time::Instant::now();
        let outcome = self.executor.execute(&request).await;
        let duration_ms = timer.elapsed().as_millis() as u64;

        let (stored_outcome, row_count, ok, error) = match outcome {
            Ok(exec) => (Ok(exec.result), exec.row_count, true, None),
            Err(err) => (Err(err.message.clone()), None, false, Some(err.message)),
        };
        let updated = self
            .store
            .record_execution(request.id, stored_outcome)
            .await?;

        self.store
            .append_log(QueryLog {
                id: Uuid::new_v4(),
                request_id: request.id,
                entity: request.entity.clone(),
                action: request.action,
                started_at,
                duration_ms,
                row_count,
                ok,
                error: error.clone(),
            })
            .await;

        self.audit_event(
            &updated,
            AuditStage::ExecutionOutcome,
            error.unwrap_or_else(|| "ok".into()),
        );
        Ok(updated)
    }

    fn audit_event(&self, request: &QueryRequest, stage: AuditStage, detail: String) {
        // Audit failures must never fail the request path.
        let _ = self.audit.append(AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: request.id,
            agent_id: request.agent_id,
            stage,
            status: request.status.as_str().to_string(),
            detail,
            prev_hash: None,
            chain_hash: String::new(),
        });
    }
}

fn ticket(request: &QueryRequest) -> RequestTicket {
    RequestTicket {
        request_id: request.id,
        status: request.status,
        requires_approval: request.requires_approval,
    }
}
