//! Method dispatch: the single boundary where failures become error envelopes.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::state::ServerState;
use crate::error::RpcError;
use crate::eviction::EvictionStats;
use crate::protocol::methods::{
    BeginTrajectoryParams, DomainQueryParams, IdParams, NoParams, ProvideFeedbackParams,
    QueryPatternsParams, StoreKnowledgeParams, TagQueryParams, DEFAULT_LIMIT,
};
use crate::protocol::{Method, Request, Response};
use crate::storage::{normalize_domain, FlushOutcome, NewKnowledge, PatternQuery, Storage, StorageStats};
use crate::trajectory::{TrajectoryStats, TrajectoryTracker};

/// Daemon-level facts the dispatcher cannot see on its own.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonVitals {
    pub state: ServerState,
    pub address: Option<String>,
    pub connected_clients: usize,
    pub uptime_ms: u64,
    pub eviction: Option<EvictionStats>,
}

pub trait StatusSource: Send + Sync {
    fn vitals(&self) -> DaemonVitals;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_bytes: Option<u64>,
    pub estimated_bytes: usize,
}

/// The document returned by `getStatus`, `ping` and `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: ServerState,
    pub version: &'static str,
    pub address: Option<String>,
    pub connected_clients: usize,
    pub uptime_ms: u64,
    pub request_count: u64,
    pub memory: MemoryUsage,
    pub storage: StorageStats,
    pub trajectories: TrajectoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionStats>,
}

type Handler = fn(&Dispatcher, Method, Value) -> Result<Value, RpcError>;

pub struct Dispatcher {
    storage: Storage,
    trajectories: Arc<TrajectoryTracker>,
    status: Arc<dyn StatusSource>,
    requests: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        storage: Storage,
        trajectories: Arc<TrajectoryTracker>,
        status: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            storage,
            trajectories,
            status,
            requests: AtomicU64::new(0),
        }
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Validate a decoded document and answer it. Never fails.
    pub fn dispatch_value(&self, value: Value) -> Response {
        match Request::from_value(value) {
            Ok(request) => self.dispatch(request),
            Err((id, err)) => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "rejected envelope");
                Response::failure(id, &err)
            }
        }
    }

    pub fn dispatch(&self, request: Request) -> Response {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let Request {
            method, params, id, ..
        } = request;
        let params = if params.is_null() { json!({}) } else { params };

        let result = method
            .parse::<Method>()
            .and_then(|method| handler(method)(self, method, params));

        match result {
            Ok(value) => Response::success(id, value),
            Err(err) => {
                match &err {
                    RpcError::Storage(_) | RpcError::Internal(_) => {
                        tracing::error!(method = %method, error = %err, "request failed")
                    }
                    _ => tracing::debug!(method = %method, error = %err, "request rejected"),
                }
                Response::failure(id, &err)
            }
        }
    }

    pub fn status(&self) -> Result<StatusReport, RpcError> {
        let vitals = self.status.vitals();
        let storage = self.storage.stats().map_err(RpcError::Storage)?;
        let trajectory_bytes = self.trajectories.approx_bytes()?;
        Ok(StatusReport {
            state: vitals.state,
            version: env!("CARGO_PKG_VERSION"),
            address: vitals.address,
            connected_clients: vitals.connected_clients,
            uptime_ms: vitals.uptime_ms,
            request_count: self.request_count(),
            memory: MemoryUsage {
                resident_bytes: resident_bytes(),
                estimated_bytes: storage.approx_bytes + trajectory_bytes,
            },
            storage,
            trajectories: self.trajectories.stats()?,
            eviction: vitals.eviction,
        })
    }
}

fn handler(method: Method) -> Handler {
    match method {
        Method::StoreKnowledge => store_knowledge,
        Method::GetKnowledge => get_knowledge,
        Method::GetKnowledgeByDomain => get_knowledge_by_domain,
        Method::GetKnowledgeByTags => get_knowledge_by_tags,
        Method::DeleteKnowledge => delete_knowledge,
        Method::ProvideFeedback => provide_feedback,
        Method::QueryPatterns => query_patterns,
        Method::BeginTrajectory => begin_trajectory,
        Method::Flush => flush,
        Method::GetStatus => get_status,
        Method::Ping => ping,
        Method::DescribeMethods => describe_methods,
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(format!("failed to encode result: {e}")))
}

fn store_knowledge(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: StoreKnowledgeParams = method.parse_params(params)?;
    if normalize_domain(&p.domain).is_empty() {
        return Err(RpcError::invalid_params(method.as_str(), "domain must contain at least one segment"));
    }
    let entry = d
        .storage
        .lock()
        .and_then(|mut engine| {
            engine.store_knowledge(NewKnowledge {
                content: p.content,
                domain: p.domain,
                category: p.category,
                tags: p.tags.unwrap_or_default(),
                quality: p.quality,
                metadata: p.metadata,
            })
        })
        .map_err(RpcError::Storage)?;
    Ok(json!({ "id": entry.id, "stored": true }))
}

fn get_knowledge(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: IdParams = method.parse_params(params)?;
    let entry = d
        .storage
        .lock()
        .map_err(RpcError::Storage)?
        .get_knowledge(&p.id);
    Ok(json!({ "entry": to_value(&entry)? }))
}

fn get_knowledge_by_domain(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: DomainQueryParams = method.parse_params(params)?;
    let entries = d.storage.lock().map_err(RpcError::Storage)?.knowledge_by_domain(
        &p.domain,
        p.include_subdomains.unwrap_or(true),
        p.limit.unwrap_or(DEFAULT_LIMIT),
    );
    Ok(json!({ "count": entries.len(), "entries": to_value(&entries)? }))
}

fn get_knowledge_by_tags(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: TagQueryParams = method.parse_params(params)?;
    let entries = d.storage.lock().map_err(RpcError::Storage)?.knowledge_by_tags(
        &p.tags,
        p.match_all.unwrap_or(false),
        p.limit.unwrap_or(DEFAULT_LIMIT),
    );
    Ok(json!({ "count": entries.len(), "entries": to_value(&entries)? }))
}

fn delete_knowledge(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: IdParams = method.parse_params(params)?;
    let deleted = d
        .storage
        .lock()
        .map_err(RpcError::Storage)?
        .delete_knowledge(&p.id);
    Ok(json!({ "deleted": deleted }))
}

fn provide_feedback(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: ProvideFeedbackParams = method.parse_params(params)?;
    let entry = d
        .storage
        .lock()
        .and_then(|mut engine| {
            engine.append_feedback(&p.trajectory_id, p.quality, p.outcome, p.feedback)
        })
        .map_err(RpcError::Storage)?;
    // The feedback is already stored; a tracker failure only affects `trajectoryCompleted`.
    let completed = match d.trajectories.complete(&p.trajectory_id, entry.outcome) {
        Ok(completed) => completed,
        Err(e) => {
            tracing::warn!(
                trajectory = %p.trajectory_id,
                error = %format!("{e:#}"),
                "feedback stored but trajectory not completed"
            );
            false
        }
    };
    Ok(json!({ "stored": true, "id": entry.id, "trajectoryCompleted": completed }))
}

fn query_patterns(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: QueryPatternsParams = method.parse_params(params)?;
    let patterns = d
        .storage
        .lock()
        .map_err(RpcError::Storage)?
        .query_patterns(&PatternQuery {
            query: p.query,
            domain: p.domain,
            category: p.category,
            min_quality: p.min_quality,
            limit: p.limit.unwrap_or(DEFAULT_LIMIT),
        });
    Ok(json!({ "count": patterns.len(), "patterns": to_value(&patterns)? }))
}

fn begin_trajectory(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let p: BeginTrajectoryParams = method.parse_params(params)?;
    let trajectory = d.trajectories.begin(p.trajectory_id, p.label)?;
    Ok(json!({ "trajectoryId": trajectory.id, "startedAt": trajectory.started_at }))
}

fn flush(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let _: NoParams = method.parse_params(params)?;
    let outcome = d.storage.flush().map_err(RpcError::Storage)?;
    Ok(json!({ "flushed": outcome == FlushOutcome::Written }))
}

fn get_status(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let _: NoParams = method.parse_params(params)?;
    to_value(&d.status()?)
}

fn ping(d: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let mut status = get_status(d, method, params)?;
    if let Value::Object(map) = &mut status {
        map.insert("pong".into(), Value::Bool(true));
    }
    Ok(status)
}

fn describe_methods(_: &Dispatcher, method: Method, params: Value) -> Result<Value, RpcError> {
    let _: NoParams = method.parse_params(params)?;
    let methods: Vec<Value> = Method::ALL
        .iter()
        .map(|m| {
            json!({
                "name": m.as_str(),
                "mutates": m.is_mutation(),
                "params": m.params_schema(),
            })
        })
        .collect();
    Ok(json!({ "methods": methods }))
}

/// Resident set size of this process, where the platform exposes it.
#[cfg(target_os = "linux")]
pub fn resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_bytes() -> Option<u64> {
    None
}
