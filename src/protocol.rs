use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::safety::BlockedCommand;

/* ============================= POD IDENTITY ============================= */

/// Identity of one pod instance. The uid distinguishes a pod that was
/// deleted and recreated under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodRef {
    pub fn new(namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Canonical form used in logs and dedup keys: "namespace/name/uid".
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.name, self.uid)
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/* ============================= INCIDENT SUBMISSION ============================= */

/// Condensed view of one container status, carried with the incident so
/// the Reflexion side can analyze without a cluster round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatusSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(default)]
    pub ready: bool,
}

/// Cluster context gathered by the Watcher at detection time. Events and
/// logs are best-effort and may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K8sContext {
    #[serde(default)]
    pub pod_spec: serde_json::Value,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatusSummary>,
}

/// Watcher → Reflexion: submit one incident for analysis and planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub pod_name: String,
    pub namespace: String,
    #[serde(default)]
    pub pod_uid: String,
    pub error_type: String,
    pub real_k8s_data: K8sContext,
    /// When supplied, the call is idempotent on this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

impl ProcessRequest {
    pub fn pod_ref(&self) -> PodRef {
        PodRef::new(&self.namespace, &self.pod_name, &self.pod_uid)
    }
}

/// Strategy portion of the process response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    #[serde(rename = "type")]
    pub strategy_type: String,
    pub strategy_id: String,
    pub confidence: f64,
    pub source: String,
}

/// Reflexion → Watcher: the remediation decision for one incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub workflow_id: String,
    pub final_strategy: StrategySummary,
    pub plan: Option<CommandPlan>,
    pub requires_human_intervention: bool,
    /// Seconds spent in analyze → plan.
    pub resolution_time: f64,
    pub reflexion_summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_commands: Vec<BlockedCommand>,
}

/* ============================= PLANS ============================= */

/// A remediation plan: three ordered command lists, optionally a YAML
/// manifest for fixes that cannot be expressed imperatively, and rollback
/// commands preserved for operator inspection (never auto-executed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPlan {
    #[serde(default)]
    pub backup_commands: Vec<String>,
    #[serde(default)]
    pub fix_commands: Vec<String>,
    #[serde(default)]
    pub validation_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

impl CommandPlan {
    pub fn total_commands(&self) -> usize {
        self.backup_commands.len() + self.fix_commands.len() + self.validation_commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_commands() == 0 && self.manifest.is_none()
    }
}

/* ============================= EXECUTION ============================= */

/// Watcher → Executor: run one plan against the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub pod_name: String,
    pub namespace: String,
    pub error_type: String,
    pub commands: CommandPlan,
    #[serde(default)]
    pub dry_run: bool,
    /// Per-command timeout override, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failure,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Which list a command came from. `Blocked` marks commands the danger
/// filter refused; dispatch in the executor is over this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTag {
    Backup,
    Fix,
    Validation,
    Blocked,
}

/// Outcome of one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub tag: CommandTag,
    pub success: bool,
    pub output: String,
    pub error: String,
    /// Seconds.
    pub duration: f64,
    pub executed_at: DateTime<Utc>,
}

/// Executor → Watcher: the full execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub total_commands: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub commands: Vec<CommandResult>,
}

impl ExecutionReport {
    pub fn to_result(&self) -> ExecutionResult {
        ExecutionResult {
            success: self.status == ExecutionStatus::Success,
            partial_success: self.status == ExecutionStatus::Partial,
            total_commands: self.total_commands,
            success_count: self.success_count,
            failure_count: self.failure_count,
            status: self.status,
            commands: self.commands.clone(),
        }
    }
}

/* ============================= FEEDBACK ============================= */

/// Execution outcome as transferred back to Reflexion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub partial_success: bool,
    pub total_commands: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub status: ExecutionStatus,
    pub commands: Vec<CommandResult>,
}

/// Watcher → Reflexion: close the loop on one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub workflow_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub error_type: String,
    pub strategy_used: String,
    pub execution_result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub ok: bool,
    pub workflow_id: String,
}

/* ============================= MEMORY READS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<serde_json::Value>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodesResponse {
    pub episodes: Vec<serde_json::Value>,
    pub total_episodes: usize,
    /// Fraction of the episode cap currently used.
    pub memory_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub ok: bool,
    pub removed: usize,
}
