use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::process::Command;
use tracing::{info, warn};

use crate::classify::{self, ErrorCategory, PodHealth};
use crate::error::Result;
use crate::protocol::{
    CommandPlan, CommandResult, CommandTag, ExecuteRequest, ExecutionReport, ExecutionStatus,
};
use crate::safety;

/* ============================= OPTIONS ============================= */

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub dry_run: bool,
}

/* ============================= COMMAND EXECUTION ============================= */

/// Run one plan in declared order: backup → fix → validation. A failed
/// command never stops the remaining ones; validation after a failed fix
/// is exactly what reveals the partial state. Rollback commands are never
/// executed here.
pub async fn run_plan(plan: &CommandPlan, opts: &ExecOptions) -> Vec<CommandResult> {
    let groups: [(CommandTag, &[String]); 3] = [
        (CommandTag::Backup, &plan.backup_commands),
        (CommandTag::Fix, &plan.fix_commands),
        (CommandTag::Validation, &plan.validation_commands),
    ];

    let mut results = Vec::with_capacity(plan.total_commands());
    for (tag, commands) in groups {
        for command in commands {
            results.push(run_command(command, tag, opts).await);
        }
    }
    results
}

async fn run_command(command: &str, tag: CommandTag, opts: &ExecOptions) -> CommandResult {
    let executed_at = Utc::now();

    // Last line of defense; the planner filters too, but an executor must
    // not trust its caller.
    if let Some(rule) = safety::check_command(command) {
        warn!(command, rule, "command_blocked");
        return CommandResult {
            command: command.to_string(),
            tag: CommandTag::Blocked,
            success: false,
            output: String::new(),
            error: format!("blocked by safety filter: {rule}"),
            duration: 0.0,
            executed_at,
        };
    }

    if opts.dry_run {
        return CommandResult {
            command: command.to_string(),
            tag,
            success: true,
            output: "[dry-run] command not executed".to_string(),
            error: String::new(),
            duration: 0.0,
            executed_at,
        };
    }

    let started = Instant::now();
    let mut child = Command::new("sh");
    child
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(opts.timeout, child.output()).await {
        Ok(Ok(output)) => {
            let success = output.status.success();
            CommandResult {
                command: command.to_string(),
                tag,
                success,
                output: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
                error: if success {
                    String::new()
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                    if stderr.is_empty() {
                        format!("exit code {}", output.status.code().unwrap_or(-1))
                    } else {
                        stderr
                    }
                },
                duration: started.elapsed().as_secs_f64(),
                executed_at,
            }
        }
        Ok(Err(e)) => CommandResult {
            command: command.to_string(),
            tag,
            success: false,
            output: String::new(),
            error: format!("spawn failed: {e}"),
            duration: started.elapsed().as_secs_f64(),
            executed_at,
        },
        Err(_) => CommandResult {
            command: command.to_string(),
            tag,
            success: false,
            output: String::new(),
            error: format!("timed out after {:?}", opts.timeout),
            duration: started.elapsed().as_secs_f64(),
            executed_at,
        },
    }
}

/* ============================= VERIFICATION ============================= */

/// What an independent cluster read says about the target pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodObservation {
    RunningReady,
    RunningNotReady,
    Failing(ErrorCategory),
    Missing,
}

/// Ground-truth check seam; swapped for a canned observer in tests.
#[async_trait]
pub trait ClusterVerifier: Send + Sync {
    async fn observe(&self, namespace: &str, pod_name: &str) -> Result<PodObservation>;
}

pub struct KubeVerifier {
    client: Client,
    pending_grace_seconds: i64,
}

impl KubeVerifier {
    pub fn new(client: Client, pending_grace_seconds: i64) -> Self {
        Self {
            client,
            pending_grace_seconds,
        }
    }
}

#[async_trait]
impl ClusterVerifier for KubeVerifier {
    async fn observe(&self, namespace: &str, pod_name: &str) -> Result<PodObservation> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let pod = match pods.get(pod_name).await {
            Ok(pod) => pod,
            // A same-name replacement would be found by this get; a 404
            // really means no pod answers to the name anymore.
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(PodObservation::Missing),
            Err(e) => return Err(e.into()),
        };

        match classify::classify_pod(&pod, Utc::now(), self.pending_grace_seconds) {
            PodHealth::Failing(category) => Ok(PodObservation::Failing(category)),
            PodHealth::PendingWithinGrace => Ok(PodObservation::RunningNotReady),
            PodHealth::Healthy => {
                let running = pod.status.as_ref().and_then(|s| s.phase.as_deref())
                    == Some("Running");
                let all_ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .map(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
                    .unwrap_or(false);

                if running && all_ready {
                    Ok(PodObservation::RunningReady)
                } else {
                    Ok(PodObservation::RunningNotReady)
                }
            }
        }
    }
}

/* ============================= STATUS DERIVATION ============================= */

/// Decide the overall status from command results plus the independent
/// cluster read. Exit codes alone are never a success signal.
pub fn derive_status(
    results: &[CommandResult],
    observation: PodObservation,
    original_category: ErrorCategory,
) -> ExecutionStatus {
    let fix: Vec<&CommandResult> = results
        .iter()
        .filter(|r| r.tag == CommandTag::Fix)
        .collect();
    let fix_ok = fix.iter().filter(|r| r.success).count();
    let all_fix_ok = !fix.is_empty() && fix_ok == fix.len();
    let all_fix_failed = !fix.is_empty() && fix_ok == 0;

    match observation {
        PodObservation::Missing => ExecutionStatus::Failure,
        PodObservation::Failing(category) if category == original_category => {
            ExecutionStatus::Failure
        }
        PodObservation::Failing(_) => {
            // A different failure than we started with: the commands did
            // something, but the pod is not healthy. Downgrade.
            if all_fix_failed {
                ExecutionStatus::Failure
            } else {
                ExecutionStatus::Partial
            }
        }
        PodObservation::RunningReady => {
            if fix.is_empty() || all_fix_ok {
                ExecutionStatus::Success
            } else {
                // Pod recovered despite failed commands (e.g. kubelet
                // restarted it); do not claim full credit.
                ExecutionStatus::Partial
            }
        }
        PodObservation::RunningNotReady => {
            if all_fix_failed {
                ExecutionStatus::Failure
            } else {
                ExecutionStatus::Partial
            }
        }
    }
}

/* ============================= HTTP SURFACE ============================= */

#[derive(Clone)]
pub struct ExecutorState {
    pub verifier: Arc<dyn ClusterVerifier>,
    pub default_timeout: Duration,
    pub dry_run: bool,
}

pub fn build_executor_router(state: ExecutorState) -> Router {
    Router::new()
        .route("/execute-commands", post(execute_handler))
        .with_state(state)
}

async fn execute_handler(
    State(state): State<ExecutorState>,
    payload: axum::extract::Json<ExecuteRequest>,
) -> impl IntoResponse {
    let request = payload.0;
    if request.pod_name.is_empty() || request.namespace.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({"error": "pod_name and namespace are required"})),
        );
    }

    let report = execute(&state, &request).await;
    (StatusCode::OK, axum::Json(serde_json::to_value(&report).unwrap_or_default()))
}

/// Run the plan, then verify against the cluster.
pub async fn execute(state: &ExecutorState, request: &ExecuteRequest) -> ExecutionReport {
    let opts = ExecOptions {
        timeout: request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(state.default_timeout),
        dry_run: request.dry_run || state.dry_run,
    };

    info!(
        pod = %request.pod_name,
        namespace = %request.namespace,
        commands = request.commands.total_commands(),
        dry_run = opts.dry_run,
        "execution_started"
    );

    let results = run_plan(&request.commands, &opts).await;
    let success_count = results.iter().filter(|r| r.success).count();
    let failure_count = results.len() - success_count;

    let status = if opts.dry_run {
        // Nothing touched the cluster; report on the echo alone.
        if failure_count == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Partial
        }
    } else {
        let observation = match state
            .verifier
            .observe(&request.namespace, &request.pod_name)
            .await
        {
            Ok(observation) => observation,
            Err(e) => {
                warn!(error = %e, "verification_read_failed");
                PodObservation::Missing
            }
        };
        derive_status(
            &results,
            observation,
            ErrorCategory::parse(&request.error_type),
        )
    };

    info!(
        pod = %request.pod_name,
        status = %status,
        success_count,
        failure_count,
        "execution_finished"
    );

    ExecutionReport {
        status,
        total_commands: results.len(),
        success_count,
        failure_count,
        commands: results,
    }
}
