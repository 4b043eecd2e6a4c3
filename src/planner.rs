use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decision::Selection;
use crate::diagnostics::Diagnosis;
use crate::error::{MenderError, Result};
use crate::llm::{ChatRequest, LlmClient, complete_json};
use crate::protocol::{CommandPlan, ExecutionResult, ProcessRequest};
use crate::safety::{self, BlockedCommand};

const MAX_EVENT_LINES: usize = 10;
const MAX_LOG_LINES: usize = 20;

/* ============================= OUTPUT ============================= */

#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: CommandPlan,
    /// One-line description of the approach, used if this LLM-only plan
    /// later becomes a learned strategy.
    pub approach: Option<String>,
    pub blocked: Vec<BlockedCommand>,
    /// How many lessons were injected into the prompt.
    pub lessons_used: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub text: String,
    pub lessons: Vec<String>,
}

/* ============================= PLANNER ============================= */

/// Turns (category, context, strategy, lessons) into a concrete command
/// plan via the LLM, inside the safety envelope.
pub struct CommandPlanner {
    llm: Arc<dyn LlmClient>,
}

impl CommandPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn plan(
        &self,
        request: &ProcessRequest,
        diagnosis: &Diagnosis,
        selection: &Selection,
        lessons: &[String],
    ) -> Result<PlannerOutput> {
        let prompt = build_plan_prompt(request, diagnosis, selection, lessons);
        let value = complete_json(self.llm.as_ref(), &prompt).await?;

        let plan: CommandPlan = serde_json::from_value(value.clone())
            .map_err(|e| MenderError::Permanent(format!("plan did not match schema: {e}")))?;

        if let Some(manifest) = &plan.manifest {
            serde_yaml::from_str::<serde_yaml::Value>(manifest)
                .map_err(|e| MenderError::Permanent(format!("plan manifest is not valid yaml: {e}")))?;
        }

        let approach = value["approach"].as_str().map(String::from);
        let (filtered, blocked) = safety::filter_plan(&plan);

        if !blocked.is_empty() {
            warn!(
                pod = %request.pod_name,
                blocked = blocked.len(),
                "plan_commands_blocked"
            );
        }

        info!(
            pod = %request.pod_name,
            fix_commands = filtered.fix_commands.len(),
            lessons = lessons.len(),
            "plan_generated"
        );

        Ok(PlannerOutput {
            plan: filtered,
            approach,
            blocked,
            lessons_used: lessons.len(),
        })
    }

    /// Post-execution self-assessment. The LLM writes the reflection; if
    /// it is unreachable the fallback still produces a usable episode.
    pub async fn reflect(
        &self,
        request: &ProcessRequest,
        plan: &CommandPlan,
        execution: &ExecutionResult,
    ) -> Reflection {
        let prompt = build_reflect_prompt(request, plan, execution);

        let mut reflection = match complete_json(self.llm.as_ref(), &prompt).await {
            Ok(value) => {
                let text = value["reflection"]
                    .as_str()
                    .unwrap_or("no reflection text returned")
                    .to_string();
                let lessons = value["lessons"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                Reflection { text, lessons }
            }
            Err(e) => {
                warn!(error = %e, "reflection_llm_failed_using_fallback");
                fallback_reflection(request, execution)
            }
        };

        if reflection.lessons.is_empty() {
            reflection.lessons = fallback_reflection(request, execution).lessons;
        }

        // Commands succeeding while the cluster still shows a failing pod
        // is exactly the signal future plans must know about.
        if commands_diverge_from_cluster(execution) && !reflection.text.contains("diverge") {
            write!(
                reflection.text,
                " Note: all fix commands exited 0 yet the verified status was {}; \
                 command exit codes diverged from observed cluster state.",
                execution.status
            )
            .ok();
        }

        reflection
    }
}

fn commands_diverge_from_cluster(execution: &ExecutionResult) -> bool {
    execution.failure_count == 0
        && execution.total_commands > 0
        && execution.status != crate::protocol::ExecutionStatus::Success
}

/* ============================= PROMPTS ============================= */

fn build_plan_prompt(
    request: &ProcessRequest,
    diagnosis: &Diagnosis,
    selection: &Selection,
    lessons: &[String],
) -> ChatRequest {
    let system = "You are a Kubernetes remediation planner. Given a failing pod, \
produce a JSON object with exactly these keys: \
\"backup_commands\" (read-only kubectl snapshots), \
\"fix_commands\" (imperative kubectl changes), \
\"validation_commands\" (read-only post-fix checks), \
optional \"rollback_commands\", optional \"manifest\" (a YAML document plus a \
kubectl apply command in fix_commands when the fix cannot be imperative), and \
\"approach\" (one short sentence naming the approach). \
Each command is a single shell-invocable kubectl string. \
Never delete namespaces, nodes, or persistent volumes; never exec into \
containers or nodes; never remove files recursively.";

    let mut user = String::new();
    let _ = writeln!(user, "Failing pod: {}/{}", request.namespace, request.pod_name);
    let _ = writeln!(user, "Error category: {}", request.error_type);
    let _ = writeln!(
        user,
        "Diagnosis ({}, confidence {:.2}): {}",
        if diagnosis.external { "external" } else { "synthesized" },
        diagnosis.confidence,
        diagnosis.summary
    );
    for finding in &diagnosis.findings {
        let _ = writeln!(user, "  - {finding}");
    }

    if let Some(strategy) = &selection.strategy {
        let _ = writeln!(user, "\nSelected strategy: {}", strategy.description);
        let _ = writeln!(user, "Strategy parameters: {}", strategy.parameters);
        let _ = writeln!(
            user,
            "Apply this strategy to the current pod; adapt names and values."
        );
    } else {
        let _ = writeln!(
            user,
            "\nNo applicable learned strategy; design the fix from first principles."
        );
    }

    if !lessons.is_empty() {
        let _ = writeln!(user, "\nLESSONS FROM PAST EXPERIENCES:");
        for lesson in lessons {
            let _ = writeln!(user, "  - {lesson}");
        }
    }

    let events = &request.real_k8s_data.events;
    if !events.is_empty() {
        let _ = writeln!(user, "\nRecent events:");
        for event in events.iter().take(MAX_EVENT_LINES) {
            let _ = writeln!(user, "  {event}");
        }
    }

    let logs = &request.real_k8s_data.logs;
    if !logs.is_empty() {
        let _ = writeln!(user, "\nContainer log tail:");
        for line in logs.iter().take(MAX_LOG_LINES) {
            let _ = writeln!(user, "  {line}");
        }
    }

    if !request.real_k8s_data.pod_spec.is_null() {
        let _ = writeln!(
            user,
            "\nPod spec:\n{}",
            serde_json::to_string_pretty(&request.real_k8s_data.pod_spec).unwrap_or_default()
        );
    }

    ChatRequest::new(system, user)
}

fn build_reflect_prompt(
    request: &ProcessRequest,
    plan: &CommandPlan,
    execution: &ExecutionResult,
) -> ChatRequest {
    let system = "You are reviewing the outcome of an automated Kubernetes \
remediation. Return a JSON object with \"reflection\" (a short paragraph on \
what happened and why) and \"lessons\" (a list of short declarative strings a \
future planner should know). Be concrete: name images, limits, and commands.";

    let mut user = String::new();
    let _ = writeln!(
        user,
        "Pod {}/{}, category {}, verified status: {}",
        request.namespace, request.pod_name, request.error_type, execution.status
    );
    let _ = writeln!(user, "Fix commands:");
    for cmd in &plan.fix_commands {
        let _ = writeln!(user, "  {cmd}");
    }
    let _ = writeln!(user, "Per-command results:");
    for result in &execution.commands {
        let _ = writeln!(
            user,
            "  [{}] {} -> {}",
            serde_json::to_string(&result.tag).unwrap_or_default(),
            result.command,
            if result.success { "ok" } else { result.error.as_str() }
        );
    }

    ChatRequest::new(system, user)
}

/// Deterministic reflection used when the LLM cannot be reached; keeps
/// the episode informative enough to learn from.
fn fallback_reflection(request: &ProcessRequest, execution: &ExecutionResult) -> Reflection {
    let text = format!(
        "Automated remediation of {}/{} ({}) finished with status {}: \
         {}/{} commands succeeded.",
        request.namespace,
        request.pod_name,
        request.error_type,
        execution.status,
        execution.success_count,
        execution.total_commands,
    );

    let lesson = match execution.status {
        crate::protocol::ExecutionStatus::Success => format!(
            "the applied fix resolved {} for this workload",
            request.error_type
        ),
        crate::protocol::ExecutionStatus::Partial => format!(
            "the fix for {} left the pod only partially recovered; validate readiness explicitly",
            request.error_type
        ),
        crate::protocol::ExecutionStatus::Failure => format!(
            "the attempted fix did not resolve {}; a different approach is needed",
            request.error_type
        ),
    };

    Reflection {
        text,
        lessons: vec![lesson],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::llm::ScriptedLlm;
    use crate::memory::LLM_ONLY_SENTINEL;
    use crate::protocol::{ExecutionStatus, K8sContext};

    fn request() -> ProcessRequest {
        ProcessRequest {
            pod_name: "web-1".to_string(),
            namespace: "default".to_string(),
            pod_uid: "u1".to_string(),
            error_type: ErrorCategory::ImagePullFailure.to_string(),
            real_k8s_data: K8sContext::default(),
            workflow_id: None,
        }
    }

    fn diagnosis() -> Diagnosis {
        Diagnosis {
            category: ErrorCategory::ImagePullFailure,
            summary: "image tag does not exist".to_string(),
            confidence: 0.8,
            findings: vec![],
            external: false,
        }
    }

    fn sentinel_selection() -> Selection {
        Selection {
            strategy_id: LLM_ONLY_SENTINEL.to_string(),
            strategy: None,
            explored: false,
            rationale: "no strategies".to_string(),
        }
    }

    fn execution(status: ExecutionStatus, failures: usize) -> ExecutionResult {
        ExecutionResult {
            success: status == ExecutionStatus::Success,
            partial_success: status == ExecutionStatus::Partial,
            total_commands: 2,
            success_count: 2 - failures,
            failure_count: failures,
            status,
            commands: vec![],
        }
    }

    #[tokio::test]
    async fn test_plan_parses_and_filters() {
        let llm = ScriptedLlm::new(vec![
            r#"{"backup_commands": ["kubectl get pod web-1 -o yaml"],
                "fix_commands": ["kubectl delete namespace default",
                                 "kubectl delete pod web-1 -n default"],
                "validation_commands": ["kubectl get pod web-1 -n default"],
                "approach": "recreate with a valid tag"}"#,
        ]);
        let planner = CommandPlanner::new(llm);

        let out = planner
            .plan(&request(), &diagnosis(), &sentinel_selection(), &[])
            .await
            .unwrap();

        assert_eq!(out.plan.fix_commands, vec!["kubectl delete pod web-1 -n default"]);
        assert_eq!(out.blocked.len(), 1);
        assert_eq!(out.approach.as_deref(), Some("recreate with a valid tag"));
    }

    #[tokio::test]
    async fn test_plan_tolerates_missing_lists() {
        let llm = ScriptedLlm::new(vec![r#"{"fix_commands": ["kubectl delete pod web-1"]}"#]);
        let planner = CommandPlanner::new(llm);

        let out = planner
            .plan(&request(), &diagnosis(), &sentinel_selection(), &[])
            .await
            .unwrap();
        assert!(out.plan.backup_commands.is_empty());
        assert!(out.plan.validation_commands.is_empty());
        assert_eq!(out.plan.fix_commands.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_plan_fails_after_strict_retry() {
        let llm = ScriptedLlm::new(vec!["not json at all", "still not json"]);
        let planner = CommandPlanner::new(llm);

        let err = planner
            .plan(&request(), &diagnosis(), &sentinel_selection(), &[])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_prompt_contains_lessons_section() {
        let lessons = vec![
            "pin explicit image tags".to_string(),
            "check registry credentials first".to_string(),
            "nginx:latest is a safe fallback".to_string(),
        ];
        let prompt = build_plan_prompt(&request(), &diagnosis(), &sentinel_selection(), &lessons);
        assert!(prompt.user.contains("LESSONS FROM PAST EXPERIENCES"));
        for lesson in &lessons {
            assert!(prompt.user.contains(lesson));
        }
    }

    #[tokio::test]
    async fn test_reflection_fallback_carries_a_lesson() {
        let llm = ScriptedLlm::new(vec![]);
        let planner = CommandPlanner::new(llm);

        let reflection = planner
            .reflect(
                &request(),
                &CommandPlan::default(),
                &execution(ExecutionStatus::Failure, 2),
            )
            .await;
        assert!(!reflection.lessons.is_empty());
        assert!(reflection.text.contains("failure"));
    }

    #[tokio::test]
    async fn test_reflection_mentions_cluster_divergence() {
        let llm = ScriptedLlm::new(vec![
            r#"{"reflection": "commands ran fine", "lessons": ["verify readiness"]}"#,
        ]);
        let planner = CommandPlanner::new(llm);

        let reflection = planner
            .reflect(
                &request(),
                &CommandPlan::default(),
                &execution(ExecutionStatus::Partial, 0),
            )
            .await;
        assert!(reflection.text.contains("diverged"));
    }
}
