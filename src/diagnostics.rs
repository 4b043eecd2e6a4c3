use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::classify::ErrorCategory;
use crate::protocol::{ContainerStatusSummary, ProcessRequest};

/// Synthesized analyses never claim more than this.
const SYNTHESIZED_CONFIDENCE_CAP: f64 = 0.85;
/// External, LLM-augmented analyses never claim more than this.
const EXTERNAL_CONFIDENCE_CAP: f64 = 0.98;

/* ============================= RESULT ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: ErrorCategory,
    pub summary: String,
    pub confidence: f64,
    pub findings: Vec<String>,
    /// True when the external diagnostic binary produced the analysis.
    pub external: bool,
}

/* ============================= ADAPTER ============================= */

/// Wraps an external diagnostic binary invoked with a JSON-output flag.
/// When the binary is absent, fails, or has nothing to say about the
/// target pod, the adapter synthesizes a best-effort analysis from the
/// container statuses carried with the incident.
pub struct DiagnosticAdapter {
    binary: Option<String>,
    timeout: Duration,
}

impl DiagnosticAdapter {
    pub fn new(binary: Option<String>, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub async fn analyze(&self, request: &ProcessRequest) -> Diagnosis {
        if let Some(binary) = &self.binary {
            match self.run_external(binary, request).await {
                Some(diagnosis) => return diagnosis,
                None => {
                    debug!(
                        namespace = %request.namespace,
                        pod = %request.pod_name,
                        "external_diagnosis_unavailable"
                    );
                }
            }
        }

        synthesize(request)
    }

    async fn run_external(&self, binary: &str, request: &ProcessRequest) -> Option<Diagnosis> {
        let mut child = Command::new(binary);
        child
            .arg("analyze")
            .arg("--namespace")
            .arg(&request.namespace)
            .arg("--output")
            .arg("json")
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, child.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                warn!(binary, error = %e, "diagnostic_binary_spawn_failed");
                return None;
            }
            Err(_) => {
                warn!(binary, "diagnostic_binary_timeout");
                return None;
            }
        };

        if !output.status.success() {
            warn!(binary, code = ?output.status.code(), "diagnostic_binary_nonzero_exit");
            return None;
        }

        let parsed: Value = serde_json::from_slice(&output.stdout).ok()?;
        correlate(&parsed, &request.namespace, &request.pod_name)
    }
}

/// Find the finding for our pod in the binary's report, matched on
/// `namespace/name`.
fn correlate(report: &Value, namespace: &str, pod_name: &str) -> Option<Diagnosis> {
    let findings = report.get("findings")?.as_array()?;

    let target = findings.iter().find(|f| {
        let ns = f["namespace"].as_str().unwrap_or_default();
        let name = f["pod"].as_str().or_else(|| f["name"].as_str()).unwrap_or_default();
        ns == namespace && name == pod_name
    })?;

    let category = target["category"]
        .as_str()
        .or_else(|| target["error_type"].as_str())
        .map(ErrorCategory::parse)
        .unwrap_or(ErrorCategory::Unknown);

    let summary = target["summary"]
        .as_str()
        .or_else(|| target["analysis"].as_str())
        .unwrap_or("external diagnostic matched this pod")
        .to_string();

    let confidence = target["confidence"]
        .as_f64()
        .unwrap_or(EXTERNAL_CONFIDENCE_CAP)
        .min(EXTERNAL_CONFIDENCE_CAP);

    let details = target["details"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Some(Diagnosis {
        category,
        summary,
        confidence,
        findings: details,
        external: true,
    })
}

/* ============================= SYNTHESIS ============================= */

/// Best-effort analysis from the statuses the Watcher shipped with the
/// incident. Deliberately conservative confidence.
fn synthesize(request: &ProcessRequest) -> Diagnosis {
    let declared = ErrorCategory::parse(&request.error_type);
    let statuses = &request.real_k8s_data.container_statuses;

    let (category, summary) = statuses
        .iter()
        .find_map(status_hypothesis)
        .unwrap_or_else(|| {
            (
                declared,
                format!("no container-level signal; trusting watcher classification {declared}"),
            )
        });

    // Agreement between the watcher's classification and the status-level
    // signal is worth more than either alone.
    let confidence: f64 = if category == declared { 0.8 } else { 0.6 };

    let mut findings: Vec<String> = statuses.iter().map(describe_status).collect();
    if !request.real_k8s_data.events.is_empty() {
        findings.push(format!(
            "{} recent events captured",
            request.real_k8s_data.events.len()
        ));
    }

    Diagnosis {
        category,
        summary,
        confidence: confidence.min(SYNTHESIZED_CONFIDENCE_CAP),
        findings,
        external: false,
    }
}

fn status_hypothesis(cs: &ContainerStatusSummary) -> Option<(ErrorCategory, String)> {
    if let Some(reason) = cs.waiting_reason.as_deref() {
        let category = match reason {
            "ImagePullBackOff" | "ErrImagePull" => ErrorCategory::ImagePullFailure,
            "InvalidImageName" => ErrorCategory::InvalidImageName,
            "CrashLoopBackOff" => ErrorCategory::CrashLoop,
            "CreateContainerConfigError" => ErrorCategory::ConfigError,
            _ => return None,
        };
        return Some((
            category,
            format!("container '{}' waiting with reason {}", cs.name, reason),
        ));
    }

    if let Some(reason) = cs.terminated_reason.as_deref() {
        if reason == "OOMKilled" {
            return Some((
                ErrorCategory::OomKill,
                format!("container '{}' terminated by the OOM killer", cs.name),
            ));
        }
    }

    match cs.exit_code {
        Some(137) => Some((
            ErrorCategory::OomKill,
            format!("container '{}' exited 137 (SIGKILL, likely OOM)", cs.name),
        )),
        Some(code) if code != 0 => Some((
            ErrorCategory::CrashLoop,
            format!("container '{}' exited {}", cs.name, code),
        )),
        _ => None,
    }
}

fn describe_status(cs: &ContainerStatusSummary) -> String {
    let state = cs
        .waiting_reason
        .as_deref()
        .map(|r| format!("waiting ({r})"))
        .or_else(|| {
            cs.terminated_reason
                .as_deref()
                .map(|r| format!("terminated ({r})"))
        })
        .unwrap_or_else(|| "running".to_string());

    format!(
        "container '{}': {}, restarts {}, ready {}",
        cs.name, state, cs.restart_count, cs.ready
    )
}
