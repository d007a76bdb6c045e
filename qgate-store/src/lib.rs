//! Request lifecycle store.
//!
//! Persists every `QueryRequest`, enforces the per-agent daily quota
//! atomically with insertion, applies approval decisions under the state
//! machine, and keeps the append-only `QueryLog` execution trace.
//!
//! The quota contract is the important part: count-then-insert happens
//! under one lock (or one transaction in a durable implementation), so two
//! concurrent requests from the same agent can never both observe the last
//! free slot.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use qgate_types::{QueryAction, QueryParams, QueryRequest, RequestStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("daily quota of {limit} queries exhausted")]
    QuotaExceeded { limit: u32 },
    #[error("request {0} not found")]
    NotFound(Uuid),
    #[error("request is {status:?}, not awaiting a decision")]
    NotDecidable { status: RequestStatus },
    #[error("illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
}

/// Approval-collaborator decision applied to a decidable request.
#[derive(Clone, Debug)]
pub enum Decision {
    /// Optionally carries a reviewer-modified parameter payload; the
    /// orchestrator re-validates it before handing it here.
    Approve { modified_params: Option<QueryParams> },
    Reject { reason: String },
    Escalate,
}

#[derive(Clone, Debug)]
pub struct DecisionRecord {
    pub approver_id: Uuid,
    pub decision: Decision,
}

/// Append-only execution trace row, one per execution attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryLog {
    pub id: Uuid,
    pub request_id: Uuid,
    pub entity: String,
    pub action: QueryAction,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub row_count: Option<u64>,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RequestFilter {
    pub agent_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub status: Option<RequestStatus>,
    pub entity: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub take: usize,
    pub skip: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { take: 50, skip: 0 }
    }
}

#[derive(Clone, Debug)]
pub struct RequestPage {
    pub items: Vec<QueryRequest>,
    pub total: usize,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Atomic quota check + insert: counts this agent's requests created
    /// in the rolling 24h window and inserts only if below `max_per_day`.
    async fn insert_within_quota(
        &self,
        request: QueryRequest,
        max_per_day: u32,
    ) -> Result<(), StoreError>;

    /// Requests created by the agent since `since` (quota prechecks).
    async fn count_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> u64;

    async fn get(&self, id: Uuid) -> Result<QueryRequest, StoreError>;

    /// Apply an approval decision. Fails with `NotDecidable` unless the
    /// request is still awaiting one (PENDING or ESCALATED).
    async fn apply_decision(
        &self,
        id: Uuid,
        record: DecisionRecord,
    ) -> Result<QueryRequest, StoreError>;

    /// Record the execution outcome of an approved request.
    async fn record_execution(
        &self,
        id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> Result<QueryRequest, StoreError>;

    async fn list(&self, filter: RequestFilter, page: Page) -> Result<RequestPage, StoreError>;

    async fn append_log(&self, log: QueryLog);

    async fn logs_for(&self, request_id: Uuid) -> Vec<QueryLog>;
}

/// The rolling window quota counting looks back over.
pub fn quota_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(24)
}

struct Inner {
    requests: HashMap<Uuid, QueryRequest>,
    order: Vec<Uuid>,
    logs: Vec<QueryLog>,
}

/// In-memory store. Not durable; the single mutex is what makes the
/// quota count+insert atomic per process.
pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                order: Vec::new(),
                logs: Vec::new(),
            }),
        }
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_decision_to(
    request: &mut QueryRequest,
    record: DecisionRecord,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if !request.status.is_decidable() {
        return Err(StoreError::NotDecidable {
            status: request.status,
        });
    }
    let target = match &record.decision {
        Decision::Approve { .. } => RequestStatus::Approved,
        Decision::Reject { .. } => RequestStatus::Rejected,
        Decision::Escalate => RequestStatus::Escalated,
    };
    if !request.status.can_transition(target) {
        return Err(StoreError::InvalidTransition {
            from: request.status,
            to: target,
        });
    }
    match record.decision {
        Decision::Approve { modified_params } => {
            if let Some(params) = modified_params {
                request.params = params;
                request.generated_query = request.query().summary();
            }
            request.status = RequestStatus::Approved;
            request.approver_id = Some(record.approver_id);
            request.approved_at = Some(now);
        }
        Decision::Reject { reason } => {
            request.status = RequestStatus::Rejected;
            request.approver_id = Some(record.approver_id);
            request.rejection_reason = Some(reason);
        }
        Decision::Escalate => {
            request.status = RequestStatus::Escalated;
        }
    }
    Ok(())
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert_within_quota(
        &self,
        request: QueryRequest,
        max_per_day: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let window_start = quota_window_start(Utc::now());
        let used = inner
            .requests
            .values()
            .filter(|r| r.agent_id == request.agent_id && r.created_at >= window_start)
            .count() as u32;
        if used >= max_per_day {
            return Err(StoreError::QuotaExceeded { limit: max_per_day });
        }
        inner.order.push(request.id);
        inner.requests.insert(request.id, request);
        Ok(())
    }

    async fn count_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .requests
            .values()
            .filter(|r| r.agent_id == agent_id && r.created_at >= since)
            .count() as u64
    }

    async fn get(&self, id: Uuid) -> Result<QueryRequest, StoreError> {
        let inner = self.inner.lock().await;
        inner.requests.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn apply_decision(
        &self,
        id: Uuid,
        record: DecisionRecord,
    ) -> Result<QueryRequest, StoreError> {
        let mut inner = self.inner.lock().await;
        let request = inner.requests.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_decision_to(request, record, Utc::now())?;
        Ok(request.clone())
    }

    async fn record_execution(
        &self,
        id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> Result<QueryRequest, StoreError> {
        let mut inner = self.inner.lock().await;
        let request = inner.requests.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let target = if outcome.is_ok() {
            RequestStatus::Executed
        } else {
            RequestStatus::Failed
        };
        if !request.status.can_transition(target) {
            return Err(StoreError::InvalidTransition {
                from: request.status,
                to: target,
            });
        }
        match outcome {
            Ok(result) => request.execution_result = Some(result),
            Err(error) => request.execution_error = Some(error),
        }
        request.status = target;
        request.executed_at = Some(Utc::now());
        Ok(request.clone())
    }

    async fn list(&self, filter: RequestFilter, page: Page) -> Result<RequestPage, StoreError> {
        let inner = self.inner.lock().await;
        let matching: Vec<&QueryRequest> = inner
            .order
            .iter()
            .filter_map(|id| inner.requests.get(id))
            .filter(|r| filter.agent_id.map(|a| r.agent_id == a).unwrap_or(true))
            .filter(|r| filter.user_id.map(|u| r.user_id == u).unwrap_or(true))
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| {
                filter
                    .entity
                    .as_deref()
                    .map(|e| r.entity == e)
                    .unwrap_or(true)
            })
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.skip)
            .take(page.take)
            .cloned()
            .collect();
        Ok(RequestPage { items, total })
    }

    async fn append_log(&self, log: QueryLog) {
        let mut inner = self.inner.lock().await;
        inner.logs.push(log);
    }

    async fn logs_for(&self, request_id: Uuid) -> Vec<QueryLog> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .iter()
            .filter(|l| l.request_id == request_id)
            .cloned()
            .collect()
    }
}
