use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::ErrorCategory;
use crate::config::Config;
use crate::decision::{DecisionEngine, Selection};
use crate::diagnostics::{Diagnosis, DiagnosticAdapter};
use crate::error::{MenderError, Result};
use crate::llm::LlmClient;
use crate::memory::{LLM_ONLY_SENTINEL, Memory, NewEpisode};
use crate::planner::{CommandPlanner, PlannerOutput, Reflection};
use crate::protocol::{
    ExecutionStatus, FeedbackRequest, ProcessRequest, ProcessResponse, StrategySummary,
};

/* ============================= STATES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowState {
    Created,
    Analyzing,
    Selecting,
    Planning,
    AwaitingExecution,
    FeedbackReceived,
    Reflecting,
    Persisting,
    Closed,
    FailedTransient,
    FailedPermanent,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Analyzing => "analyzing",
            WorkflowState::Selecting => "selecting",
            WorkflowState::Planning => "planning",
            WorkflowState::AwaitingExecution => "awaiting-execution",
            WorkflowState::FeedbackReceived => "feedback-received",
            WorkflowState::Reflecting => "reflecting",
            WorkflowState::Persisting => "persisting",
            WorkflowState::Closed => "closed",
            WorkflowState::FailedTransient => "failed-transient",
            WorkflowState::FailedPermanent => "failed-permanent",
        }
    }
}

/* ============================= WORKFLOW ============================= */

/// Per-incident state, kept in memory across the awaiting-execution pause
/// so feedback arriving later still has the full context.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub state: WorkflowState,
    pub request: ProcessRequest,
    pub category: ErrorCategory,
    pub created_at: DateTime<Utc>,
    pub diagnosis: Option<Diagnosis>,
    pub selection: Option<Selection>,
    pub planned: Option<PlannerOutput>,
    pub reflection: Option<Reflection>,
    pub tags: Vec<String>,
    pub cancelled: bool,
    /// Response snapshot returned on idempotent resubmission.
    pub response: Option<ProcessResponse>,
}

impl Workflow {
    fn new(id: String, request: ProcessRequest) -> Self {
        let category = ErrorCategory::parse(&request.error_type);
        Self {
            id,
            state: WorkflowState::Created,
            category,
            tags: request_tags(&request, category),
            request,
            created_at: Utc::now(),
            diagnosis: None,
            selection: None,
            planned: None,
            reflection: None,
            cancelled: false,
            response: None,
        }
    }

    fn transition(&mut self, next: WorkflowState) {
        info!(
            workflow_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            pod = %self.request.pod_name,
            namespace = %self.request.namespace,
            "workflow_transition"
        );
        self.state = next;
    }
}

/// Contextual tags for episode retrieval, derived from what the Watcher
/// shipped: category, namespace, images, exit codes, waiting reasons.
fn request_tags(request: &ProcessRequest, category: ErrorCategory) -> Vec<String> {
    let mut tags = vec![
        format!("category:{}", category),
        format!("namespace:{}", request.namespace),
    ];

    if let Some(containers) = request.real_k8s_data.pod_spec["containers"].as_array() {
        for c in containers {
            if let Some(image) = c["image"].as_str() {
                tags.push(format!("image:{image}"));
            }
        }
    }

    for cs in &request.real_k8s_data.container_statuses {
        if let Some(code) = cs.exit_code {
            tags.push(format!("exit-code:{code}"));
        }
        if let Some(reason) = cs.waiting_reason.as_deref() {
            tags.push(format!("reason:{reason}"));
        }
    }

    tags.sort();
    tags.dedup();
    tags
}

/* ============================= ENGINE ============================= */

/// Drives each incident through analyze → select → plan, parks it, and on
/// feedback runs reflect → persist. Each workflow id is a single-writer
/// entity; concurrent calls on the same id serialize on its mutex.
pub struct WorkflowEngine {
    memory: Arc<Memory>,
    planner: CommandPlanner,
    decision: DecisionEngine,
    diagnostics: DiagnosticAdapter,
    cfg: Config,
    workflows: Mutex<HashMap<String, Arc<Mutex<Workflow>>>>,
    open_by_pod: Mutex<HashMap<String, String>>,
}

impl WorkflowEngine {
    pub fn new(
        memory: Arc<Memory>,
        llm: Arc<dyn LlmClient>,
        diagnostics: DiagnosticAdapter,
        cfg: Config,
    ) -> Self {
        Self {
            planner: CommandPlanner::new(llm),
            decision: DecisionEngine::new(cfg.exploration_rate, cfg.confidence_floor),
            memory,
            diagnostics,
            cfg,
            workflows: Mutex::new(HashMap::new()),
            open_by_pod: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open_count(&self) -> usize {
        self.open_by_pod.lock().await.len()
    }

    /// Submit one incident. Idempotent: resubmission for a pod uid with an
    /// in-flight workflow (or an explicit workflow id) returns the original
    /// response without creating a second workflow.
    pub async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse> {
        if request.pod_name.is_empty() || request.namespace.is_empty() {
            return Err(MenderError::Permanent(
                "pod_name and namespace are required".to_string(),
            ));
        }

        if let Some(existing) = self.find_open(&request).await {
            let wf = existing.lock().await;
            if let Some(response) = &wf.response {
                info!(workflow_id = %wf.id, "incident_resubmitted_returning_parked_workflow");
                return Ok(response.clone());
            }
        }

        let id = request
            .workflow_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let wf = Arc::new(Mutex::new(Workflow::new(id.clone(), request.clone())));

        // Take the per-workflow lock before publishing it, so a racing
        // resubmission blocks until the response snapshot exists.
        let mut guard = wf.lock().await;
        {
            self.workflows.lock().await.insert(id.clone(), wf.clone());
            self.open_by_pod
                .lock()
                .await
                .insert(request.pod_ref().key(), id.clone());
        }

        let budget = Duration::from_secs(self.cfg.workflow_budget_seconds);

        let response = match tokio::time::timeout(budget, self.drive_to_parked(&mut guard)).await {
            Ok(result) => result,
            Err(_) => {
                guard.cancelled = true;
                warn!(
                    workflow_id = %guard.id,
                    state = guard.state.as_str(),
                    "workflow_budget_exceeded"
                );
                self.fail(&mut guard, WorkflowState::FailedTransient, "workflow budget exceeded")
                    .await
            }
        };

        guard.response = Some(response.clone());
        Ok(response)
    }

    async fn find_open(&self, request: &ProcessRequest) -> Option<Arc<Mutex<Workflow>>> {
        let id = if let Some(id) = &request.workflow_id {
            Some(id.clone())
        } else {
            self.open_by_pod
                .lock()
                .await
                .get(&request.pod_ref().key())
                .cloned()
        };
        let id = id?;
        self.workflows.lock().await.get(&id).cloned()
    }

    /// analyze → select → plan, ending parked at awaiting-execution or in
    /// a failure state. Never returns Err: failures become a response the
    /// Watcher can act on.
    async fn drive_to_parked(&self, wf: &mut Workflow) -> ProcessResponse {
        wf.transition(WorkflowState::Analyzing);
        let diagnosis = self.diagnostics.analyze(&wf.request).await;
        // The analyzer may refine the watcher's coarse classification.
        wf.category = diagnosis.category;
        wf.diagnosis = Some(diagnosis);

        wf.transition(WorkflowState::Selecting);
        let strategies = match self.memory.strategies_for(wf.category) {
            Ok(s) => s,
            Err(e) => {
                warn!(workflow_id = %wf.id, error = %e, "strategy_lookup_failed");
                Vec::new()
            }
        };
        let mut rng = StdRng::from_entropy();
        let selection = self.decision.select(&strategies, &mut rng);
        wf.selection = Some(selection.clone());

        wf.transition(WorkflowState::Planning);
        let lessons = self
            .memory
            .lessons_for(wf.category, &wf.tags, self.cfg.similar_episode_limit)
            .unwrap_or_default();

        let diagnosis = wf.diagnosis.clone().unwrap_or_else(|| Diagnosis {
            category: wf.category,
            summary: String::new(),
            confidence: 0.0,
            findings: vec![],
            external: false,
        });

        let planned = match self
            .planner
            .plan(&wf.request, &diagnosis, &selection, &lessons)
            .await
        {
            Ok(planned) => planned,
            Err(e) if !e.is_transient() => {
                // One recovery attempt under an alternate strategy, then give up.
                warn!(workflow_id = %wf.id, error = %e, "plan_structural_failure_retrying_alternate");
                let alternate = self.alternate_selection(&selection, &strategies);
                match self
                    .planner
                    .plan(&wf.request, &diagnosis, &alternate, &lessons)
                    .await
                {
                    Ok(planned) => {
                        wf.selection = Some(alternate);
                        planned
                    }
                    Err(e) => {
                        warn!(workflow_id = %wf.id, error = %e, "plan_failed_permanently");
                        return self
                            .fail(wf, WorkflowState::FailedPermanent, "planner output unusable")
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(workflow_id = %wf.id, error = %e, "plan_failed_transient");
                return self
                    .fail(wf, WorkflowState::FailedTransient, "llm unreachable")
                    .await;
            }
        };

        wf.planned = Some(planned.clone());
        wf.transition(WorkflowState::AwaitingExecution);

        ProcessResponse {
            workflow_id: wf.id.clone(),
            final_strategy: summarize_selection(wf.selection.as_ref()),
            plan: Some(planned.plan),
            requires_human_intervention: false,
            resolution_time: elapsed_seconds(wf.created_at),
            reflexion_summary: format!(
                "{}; {}",
                wf.diagnosis
                    .as_ref()
                    .map(|d| d.summary.as_str())
                    .unwrap_or("no diagnosis"),
                wf.selection
                    .as_ref()
                    .map(|s| s.rationale.as_str())
                    .unwrap_or("no selection")
            ),
            blocked_commands: planned.blocked,
        }
    }

    /// Swap sentinel for the best concrete strategy, or vice versa.
    fn alternate_selection(
        &self,
        failed: &Selection,
        strategies: &[crate::memory::Strategy],
    ) -> Selection {
        if failed.is_sentinel() {
            if let Some(best) = strategies.first() {
                return Selection {
                    strategy_id: best.id.clone(),
                    strategy: Some(best.clone()),
                    explored: false,
                    rationale: format!("alternate after planner failure: '{}'", best.description),
                };
            }
        }
        Selection {
            strategy_id: LLM_ONLY_SENTINEL.to_string(),
            strategy: None,
            explored: false,
            rationale: "alternate after planner failure: fresh generation".to_string(),
        }
    }

    async fn fail(
        &self,
        wf: &mut Workflow,
        state: WorkflowState,
        reason: &str,
    ) -> ProcessResponse {
        wf.transition(state);
        // No feedback will arrive for this workflow; free the pod slot.
        self.open_by_pod
            .lock()
            .await
            .remove(&wf.request.pod_ref().key());

        ProcessResponse {
            workflow_id: wf.id.clone(),
            final_strategy: summarize_selection(wf.selection.as_ref()),
            plan: None,
            requires_human_intervention: state == WorkflowState::FailedPermanent,
            resolution_time: elapsed_seconds(wf.created_at),
            reflexion_summary: reason.to_string(),
            blocked_commands: vec![],
        }
    }

    /// Attach an execution report and run the reflect → persist tail.
    pub async fn feedback(&self, request: FeedbackRequest) -> Result<()> {
        let wf = {
            let workflows = self.workflows.lock().await;
            workflows.get(&request.workflow_id).cloned()
        }
        .ok_or_else(|| {
            MenderError::Permanent(format!("unknown workflow id {}", request.workflow_id))
        })?;

        let mut wf = wf.lock().await;

        if wf.state == WorkflowState::Closed {
            info!(workflow_id = %wf.id, "feedback_for_closed_workflow_ignored");
            return Ok(());
        }
        if wf.state != WorkflowState::AwaitingExecution {
            return Err(MenderError::Permanent(format!(
                "workflow {} is in state {}, not awaiting execution",
                wf.id,
                wf.state.as_str()
            )));
        }

        wf.transition(WorkflowState::FeedbackReceived);
        let execution = request.execution_result;

        wf.transition(WorkflowState::Reflecting);
        let plan = wf
            .planned
            .as_ref()
            .map(|p| p.plan.clone())
            .unwrap_or_default();
        let reflection = self.planner.reflect(&wf.request, &plan, &execution).await;
        wf.reflection = Some(reflection.clone());

        wf.transition(WorkflowState::Persisting);
        let mut tags = wf.tags.clone();
        if plan.fix_commands.is_empty() && execution.status == ExecutionStatus::Success {
            tags.push("no-op verification".to_string());
        }

        let episode = NewEpisode {
            id: wf.id.clone(),
            category: wf.category,
            namespace: wf.request.namespace.clone(),
            pod_name: wf.request.pod_name.clone(),
            pod_uid: wf.request.pod_uid.clone(),
            strategy_id: wf
                .selection
                .as_ref()
                .map(|s| s.strategy_id.clone())
                .unwrap_or_else(|| LLM_ONLY_SENTINEL.to_string()),
            strategy_description: wf.planned.as_ref().and_then(|p| p.approach.clone()),
            plan,
            outcome: execution.status,
            resolution_seconds: elapsed_seconds(wf.created_at),
            execution,
            reflection: reflection.text,
            lessons: reflection.lessons,
            tags,
        };

        if let Err(e) = self.memory.record_episode(&episode) {
            // The commit is atomic; nothing partial was written.
            warn!(
                workflow_id = %wf.id,
                error = %e,
                "episode_commit_failed_completed_without_learning"
            );
        }

        wf.transition(WorkflowState::Closed);
        self.open_by_pod
            .lock()
            .await
            .remove(&wf.request.pod_ref().key());
        Ok(())
    }
}

fn summarize_selection(selection: Option<&Selection>) -> StrategySummary {
    match selection.and_then(|s| s.strategy.as_ref()) {
        Some(strategy) => StrategySummary {
            strategy_type: strategy.description.clone(),
            strategy_id: strategy.id.clone(),
            confidence: strategy.confidence,
            source: strategy.source.as_str().to_string(),
        },
        None => StrategySummary {
            strategy_type: "llm-generated".to_string(),
            strategy_id: LLM_ONLY_SENTINEL.to_string(),
            confidence: 0.0,
            source: "llm".to_string(),
        },
    }
}

fn elapsed_seconds(since: DateTime<Utc>) -> f64 {
    (Utc::now() - since).num_milliseconds() as f64 / 1000.0
}
