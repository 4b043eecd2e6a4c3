#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
    Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use kube_mender::error::{MenderError, Result};
use kube_mender::llm::{ChatRequest, LlmClient};
use kube_mender::protocol::{
    ContainerStatusSummary, ExecutionResult, ExecutionStatus, FeedbackRequest, K8sContext,
    ProcessRequest,
};

/* ============================= POD BUILDERS ============================= */

pub fn make_test_pod(name: &str, namespace: &str, uid: &str, image: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            creation_timestamp: Some(Time(Utc::now() - Duration::seconds(600))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                restart_count: 0,
                ready: phase == "Running",
                image: image.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn with_waiting_reason(mut pod: Pod, reason: &str) -> Pod {
    if let Some(statuses) = pod
        .status
        .as_mut()
        .and_then(|s| s.container_statuses.as_mut())
        && let Some(cs) = statuses.first_mut()
    {
        cs.ready = false;
        cs.state = Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    pod
}

pub fn with_terminated(mut pod: Pod, reason: Option<&str>, exit_code: i32) -> Pod {
    if let Some(statuses) = pod
        .status
        .as_mut()
        .and_then(|s| s.container_statuses.as_mut())
        && let Some(cs) = statuses.first_mut()
    {
        cs.ready = false;
        cs.state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: reason.map(String::from),
                exit_code,
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    pod
}

pub fn with_age_seconds(mut pod: Pod, age_seconds: i64) -> Pod {
    pod.metadata.creation_timestamp = Some(Time(Utc::now() - Duration::seconds(age_seconds)));
    pod
}

/* ============================= REQUEST BUILDERS ============================= */

pub fn make_process_request(
    pod_name: &str,
    uid: &str,
    error_type: &str,
    image: &str,
) -> ProcessRequest {
    ProcessRequest {
        pod_name: pod_name.to_string(),
        namespace: "default".to_string(),
        pod_uid: uid.to_string(),
        error_type: error_type.to_string(),
        real_k8s_data: K8sContext {
            pod_spec: serde_json::json!({
                "containers": [{"name": "main", "image": image}]
            }),
            events: vec![format!("[Warning] Failed: pulling image \"{image}\"")],
            logs: vec![],
            container_statuses: vec![ContainerStatusSummary {
                name: "main".to_string(),
                waiting_reason: waiting_reason_for(error_type),
                terminated_reason: terminated_reason_for(error_type),
                exit_code: exit_code_for(error_type),
                restart_count: 3,
                ready: false,
            }],
        },
        workflow_id: None,
    }
}

fn waiting_reason_for(error_type: &str) -> Option<String> {
    match error_type {
        "image-pull-failure" => Some("ImagePullBackOff".to_string()),
        "crash-loop" => Some("CrashLoopBackOff".to_string()),
        "invalid-image-name" => Some("InvalidImageName".to_string()),
        _ => None,
    }
}

fn terminated_reason_for(error_type: &str) -> Option<String> {
    match error_type {
        "oom-kill" => Some("OOMKilled".to_string()),
        _ => None,
    }
}

fn exit_code_for(error_type: &str) -> Option<i32> {
    match error_type {
        "oom-kill" => Some(137),
        "crash-loop" => Some(1),
        _ => None,
    }
}

pub fn make_feedback(workflow_id: &str, status: ExecutionStatus) -> FeedbackRequest {
    let (success_count, failure_count) = match status {
        ExecutionStatus::Success => (3, 0),
        ExecutionStatus::Partial => (2, 1),
        ExecutionStatus::Failure => (0, 3),
    };
    FeedbackRequest {
        workflow_id: workflow_id.to_string(),
        pod_name: "web-1".to_string(),
        namespace: "default".to_string(),
        error_type: "image-pull-failure".to_string(),
        strategy_used: "llm-only".to_string(),
        execution_result: ExecutionResult {
            success: status == ExecutionStatus::Success,
            partial_success: status == ExecutionStatus::Partial,
            total_commands: 3,
            success_count,
            failure_count,
            status,
            commands: vec![],
        },
    }
}

/* ============================= SCRIPTED LLM ============================= */

/// Pops canned responses in order; once exhausted, repeats the fallback
/// or fails like an unreachable provider.
pub struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    fallback: Option<String>,
    pub prompts_seen: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            fallback: None,
            prompts_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn repeating(response: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            fallback: Some(response.to_string()),
            prompts_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn last_prompt(&self) -> String {
        self.prompts_seen
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn prompt_containing(&self, needle: &str) -> Option<String> {
        self.prompts_seen
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.contains(needle))
            .cloned()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        self.prompts_seen
            .lock()
            .unwrap()
            .push(format!("{}\n{}", request.system, request.user));

        let popped = self.responses.lock().unwrap().pop();
        match popped {
            Some(r) => Ok(r),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| MenderError::Llm("script exhausted".to_string())),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// A plan-or-reflection response usable for both call sites.
pub const CANNED_PLAN: &str = r#"{
    "backup_commands": ["kubectl get pod web-1 -n default -o yaml"],
    "fix_commands": ["kubectl delete pod web-1 -n default",
                     "kubectl run web-1 --image=nginx:latest -n default"],
    "validation_commands": ["kubectl get pod web-1 -n default"],
    "approach": "recreate the pod with a known-good image tag",
    "reflection": "recreating with nginx:latest resolved the pull failure",
    "lessons": ["nginx:latest is a safe fallback tag",
                "image pull backoff clears after pod recreation"]
}"#;
