use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{ListParams, LogParams};
use kube::{Api, Client};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::classify;
use crate::clients::{ExecutorClient, ReflexionClient};
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{
    ContainerStatusSummary, ExecuteRequest, ExecutionStatus, FeedbackRequest, K8sContext, PodRef,
    ProcessRequest,
};

/* ============================= DEDUP ============================= */

/// Tracks which pod instances currently have an incident in flight.
///
/// Keyed on (namespace, name, uid) so a pod recreated under the same name
/// is a new subject. Entries age out so an abandoned incident cannot pin
/// a pod forever.
pub struct DedupSet {
    inner: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Claim a pod for processing. Returns false if it is already claimed
    /// and the claim has not expired.
    pub async fn insert_if_absent(&self, pod: &PodRef) -> bool {
        let key = pod.key();
        {
            let read = self.inner.read().await;
            if let Some(at) = read.get(&key)
                && at.elapsed() < self.ttl
            {
                return false;
            }
        }
        let mut write = self.inner.write().await;
        match write.get(&key) {
            Some(at) if at.elapsed() < self.ttl => false,
            _ => {
                write.insert(key, Instant::now());
                true
            }
        }
    }

    /// Release a pod after a verified success so a re-failure of the same
    /// uid is picked up again.
    pub async fn remove(&self, pod: &PodRef) {
        self.inner.write().await.remove(&pod.key());
    }

    pub async fn purge_expired(&self) -> usize {
        let mut write = self.inner.write().await;
        let before = write.len();
        write.retain(|_, at| at.elapsed() < self.ttl);
        before - write.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/* ============================= CONTEXT GATHERING ============================= */

/// Pod spec snapshot with server-managed bookkeeping stripped; what the
/// planner needs to reason about, nothing it could not have written.
pub fn sanitize_pod(pod: &Pod) -> Value {
    let mut spec = serde_json::to_value(&pod.spec).unwrap_or(Value::Null);
    if let Some(map) = spec.as_object_mut() {
        for field in ["nodeName", "serviceAccount", "dnsPolicy", "schedulerName"] {
            map.remove(field);
        }
    }

    json!({
        "metadata": {
            "name": pod.metadata.name,
            "namespace": pod.metadata.namespace,
            "labels": pod.metadata.labels,
        },
        "containers": spec.get("containers").cloned().unwrap_or(Value::Null),
        "initContainers": spec.get("initContainers").cloned().unwrap_or(Value::Null),
        "spec": spec,
    })
}

pub fn summarize_statuses(pod: &Pod) -> Vec<ContainerStatusSummary> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| {
                    let waiting = cs
                        .state
                        .as_ref()
                        .and_then(|s| s.waiting.as_ref())
                        .and_then(|w| w.reason.clone());
                    let terminated = cs.state.as_ref().and_then(|s| s.terminated.as_ref());
                    ContainerStatusSummary {
                        name: cs.name.clone(),
                        waiting_reason: waiting,
                        terminated_reason: terminated.and_then(|t| t.reason.clone()),
                        exit_code: terminated.map(|t| t.exit_code),
                        restart_count: cs.restart_count,
                        ready: cs.ready,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Best-effort context: spec snapshot always, events and logs only if the
/// cluster cooperates. Fetch failures are logged and shrugged off.
pub async fn gather_context(client: &Client, pod: &Pod, cfg: &Config) -> K8sContext {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or_default();

    let events = match fetch_events(client, namespace, name, cfg.event_limit).await {
        Ok(events) => events,
        Err(e) => {
            warn!(pod = name, error = %e, "event_fetch_failed");
            Vec::new()
        }
    };

    let logs = match fetch_log_tail(client, namespace, name, cfg.log_tail_lines).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(pod = name, error = %e, "log_fetch_failed");
            Vec::new()
        }
    };

    K8sContext {
        pod_spec: sanitize_pod(pod),
        events,
        logs,
        container_statuses: summarize_statuses(pod),
    }
}

async fn fetch_events(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    limit: u32,
) -> Result<Vec<String>> {
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default()
        .fields(&format!(
            "involvedObject.name={pod_name},involvedObject.namespace={namespace}"
        ))
        .limit(limit);

    let list = events.list(&params).await?;
    Ok(list
        .items
        .iter()
        .map(|e| {
            format!(
                "[{}] {}: {}",
                e.type_.as_deref().unwrap_or("Normal"),
                e.reason.as_deref().unwrap_or("Unknown"),
                e.message.as_deref().unwrap_or("")
            )
        })
        .collect())
}

async fn fetch_log_tail(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    tail_lines: i64,
) -> Result<Vec<String>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = LogParams {
        tail_lines: Some(tail_lines),
        ..Default::default()
    };

    let raw = pods.logs(pod_name, &params).await?;
    Ok(raw.lines().map(String::from).collect())
}

/* ============================= ORCHESTRATION ============================= */

pub struct WatcherContext {
    pub kube: Client,
    pub reflexion: ReflexionClient,
    pub executor: ExecutorClient,
    pub dedup: DedupSet,
    pub cfg: Config,
    pub dry_run: bool,
}

/// What one incident ended as, for metrics and dedup bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentOutcome {
    Resolved,
    Unresolved(ExecutionStatus),
    HumanRequired,
    Abandoned(String),
}

/// List pods in scope and return the ones eligible for an incident:
/// failing and not already claimed by the dedup set.
pub async fn find_eligible(ctx: &WatcherContext, namespace: Option<&str>) -> Result<Vec<Pod>> {
    let pods: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(ctx.kube.clone(), ns),
        None => Api::all(ctx.kube.clone()),
    };

    let list = pods.list(&ListParams::default()).await?;
    let now = Utc::now();

    let mut eligible = Vec::new();
    for pod in list {
        let health = classify::classify_pod(&pod, now, ctx.cfg.pending_grace_seconds);
        let Some(category) = health.failing_category() else {
            continue;
        };

        let pod_ref = pod_ref_of(&pod);
        if ctx.dedup.insert_if_absent(&pod_ref).await {
            info!(
                namespace = %pod_ref.namespace,
                pod = %pod_ref.name,
                uid = %pod_ref.uid,
                category = %category,
                "incident_detected"
            );
            eligible.push(pod);
        }
    }

    Ok(eligible)
}

pub fn pod_ref_of(pod: &Pod) -> PodRef {
    PodRef::new(
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default(),
        pod.metadata.uid.as_deref().unwrap_or_default(),
    )
}

/// Drive one incident end to end: submit, execute, feed back.
///
/// Transport failures abandon the incident with the dedup entry retained
/// (the TTL reclaims it); an execution failure is not retried — the
/// reflection on failure is the learning mechanism.
pub async fn handle_incident(ctx: &WatcherContext, pod: &Pod) -> IncidentOutcome {
    let pod_ref = pod_ref_of(pod);
    let health = classify::classify_pod(pod, Utc::now(), ctx.cfg.pending_grace_seconds);
    let category = match health.failing_category() {
        Some(c) => c,
        None => return IncidentOutcome::Abandoned("pod no longer failing".to_string()),
    };

    let context = gather_context(&ctx.kube, pod, &ctx.cfg).await;

    let process_request = ProcessRequest {
        pod_name: pod_ref.name.clone(),
        namespace: pod_ref.namespace.clone(),
        pod_uid: pod_ref.uid.clone(),
        error_type: category.to_string(),
        real_k8s_data: context,
        workflow_id: None,
    };

    let response = match ctx.reflexion.process(&process_request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(pod = %pod_ref, error = %e, "incident_submission_failed");
            return IncidentOutcome::Abandoned(format!("reflexion unreachable: {e}"));
        }
    };

    if response.requires_human_intervention {
        warn!(
            pod = %pod_ref,
            workflow_id = %response.workflow_id,
            summary = %response.reflexion_summary,
            "human_intervention_required"
        );
        return IncidentOutcome::HumanRequired;
    }

    let Some(plan) = response.plan else {
        info!(
            pod = %pod_ref,
            workflow_id = %response.workflow_id,
            summary = %response.reflexion_summary,
            "no_plan_returned"
        );
        return IncidentOutcome::Abandoned("no plan returned".to_string());
    };

    let execute_request = ExecuteRequest {
        pod_name: pod_ref.name.clone(),
        namespace: pod_ref.namespace.clone(),
        error_type: category.to_string(),
        commands: plan,
        dry_run: ctx.dry_run,
        timeout: Some(ctx.cfg.command_timeout_seconds),
    };

    let report = match ctx.executor.execute(&execute_request).await {
        Ok(report) => report,
        Err(e) => {
            warn!(pod = %pod_ref, error = %e, "executor_unreachable");
            return IncidentOutcome::Abandoned(format!("executor unreachable: {e}"));
        }
    };

    let feedback = FeedbackRequest {
        workflow_id: response.workflow_id.clone(),
        pod_name: pod_ref.name.clone(),
        namespace: pod_ref.namespace.clone(),
        error_type: category.to_string(),
        strategy_used: response.final_strategy.strategy_id.clone(),
        execution_result: report.to_result(),
    };

    if let Err(e) = ctx.reflexion.feedback(&feedback).await {
        warn!(pod = %pod_ref, error = %e, "feedback_delivery_failed");
        return IncidentOutcome::Abandoned(format!("feedback failed: {e}"));
    }

    info!(
        pod = %pod_ref,
        workflow_id = %response.workflow_id,
        status = %report.status,
        "incident_completed"
    );

    if report.status == ExecutionStatus::Success {
        ctx.dedup.remove(&pod_ref).await;
        IncidentOutcome::Resolved
    } else {
        IncidentOutcome::Unresolved(report.status)
    }
}
