use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use serde::{Deserialize, Serialize};

/* ============================= CATEGORIES ============================= */

/// Closed set of failure categories the remediation loop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ImagePullFailure,
    CrashLoop,
    OomKill,
    PendingSchedule,
    InvalidImageName,
    ConfigError,
    InitContainerFailure,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::ImagePullFailure,
        ErrorCategory::CrashLoop,
        ErrorCategory::OomKill,
        ErrorCategory::PendingSchedule,
        ErrorCategory::InvalidImageName,
        ErrorCategory::ConfigError,
        ErrorCategory::InitContainerFailure,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ImagePullFailure => "image-pull-failure",
            ErrorCategory::CrashLoop => "crash-loop",
            ErrorCategory::OomKill => "oom-kill",
            ErrorCategory::PendingSchedule => "pending-schedule",
            ErrorCategory::InvalidImageName => "invalid-image-name",
            ErrorCategory::ConfigError => "config-error",
            ErrorCategory::InitContainerFailure => "init-container-failure",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognized maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "image-pull-failure" => ErrorCategory::ImagePullFailure,
            "crash-loop" => ErrorCategory::CrashLoop,
            "oom-kill" => ErrorCategory::OomKill,
            "pending-schedule" => ErrorCategory::PendingSchedule,
            "invalid-image-name" => ErrorCategory::InvalidImageName,
            "config-error" => ErrorCategory::ConfigError,
            "init-container-failure" => ErrorCategory::InitContainerFailure,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= HEALTH ============================= */

/// Outcome of classifying a single pod at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodHealth {
    Healthy,
    /// Pending, but younger than the scheduling grace period.
    PendingWithinGrace,
    Failing(ErrorCategory),
}

impl PodHealth {
    pub fn failing_category(&self) -> Option<ErrorCategory> {
        match self {
            PodHealth::Failing(c) => Some(*c),
            _ => None,
        }
    }
}

/* ============================= CLASSIFICATION ============================= */

/// Classify a pod from phase, container statuses, init-container statuses,
/// and age.
///
/// Precedence, most specific first:
/// 1. Init-container failures (their own category).
/// 2. Waiting reasons on app containers (ImagePullBackOff, CrashLoopBackOff, …).
/// 3. Terminated reasons (OOMKilled wins over the exit-code heuristic).
/// 4. Terminated exit codes (137 → oom-kill, other non-zero → crash-loop).
/// 5. Phase: Pending past the grace period → pending-schedule; Failed → unknown.
pub fn classify_pod(pod: &Pod, now: DateTime<Utc>, grace_seconds: i64) -> PodHealth {
    let status = match &pod.status {
        Some(s) => s,
        None => return PodHealth::Healthy,
    };

    if let Some(init_statuses) = &status.init_container_statuses
        && init_statuses.iter().any(init_container_failed)
    {
        return PodHealth::Failing(ErrorCategory::InitContainerFailure);
    }

    if let Some(statuses) = &status.container_statuses {
        for cs in statuses {
            if let Some(category) = classify_container(cs) {
                return PodHealth::Failing(category);
            }
        }
    }

    match status.phase.as_deref() {
        Some("Pending") => {
            let age_seconds = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| now.signed_duration_since(t.0).num_seconds())
                .unwrap_or(i64::MAX);

            if age_seconds < grace_seconds {
                PodHealth::PendingWithinGrace
            } else {
                PodHealth::Failing(ErrorCategory::PendingSchedule)
            }
        }
        Some("Failed") => PodHealth::Failing(ErrorCategory::Unknown),
        _ => PodHealth::Healthy,
    }
}

fn classify_container(cs: &ContainerStatus) -> Option<ErrorCategory> {
    if let Some(state) = &cs.state {
        if let Some(waiting) = &state.waiting {
            match waiting.reason.as_deref() {
                Some("ImagePullBackOff") | Some("ErrImagePull") => {
                    return Some(ErrorCategory::ImagePullFailure);
                }
                Some("InvalidImageName") => return Some(ErrorCategory::InvalidImageName),
                Some("CrashLoopBackOff") => return Some(ErrorCategory::CrashLoop),
                Some("CreateContainerConfigError") | Some("CreateContainerError") => {
                    return Some(ErrorCategory::ConfigError);
                }
                _ => {}
            }
        }

        if let Some(terminated) = &state.terminated {
            // The stated reason wins over the exit-code heuristic.
            match terminated.reason.as_deref() {
                Some("OOMKilled") => return Some(ErrorCategory::OomKill),
                Some("Error") if terminated.exit_code != 0 => {
                    return Some(ErrorCategory::CrashLoop);
                }
                _ => {}
            }
            match terminated.exit_code {
                0 => {}
                137 => return Some(ErrorCategory::OomKill),
                _ => return Some(ErrorCategory::CrashLoop),
            }
        }
    }

    None
}

fn init_container_failed(cs: &ContainerStatus) -> bool {
    if let Some(state) = &cs.state {
        if let Some(waiting) = &state.waiting
            && matches!(
                waiting.reason.as_deref(),
                Some("CrashLoopBackOff")
                    | Some("Error")
                    | Some("ImagePullBackOff")
                    | Some("ErrImagePull")
                    | Some("CreateContainerConfigError")
            )
        {
            return true;
        }
        if let Some(terminated) = &state.terminated {
            return terminated.exit_code != 0;
        }
    }
    false
}

/* ============================= CONTEXT TAGS ============================= */

/// Short contextual tags attached to an episode, used later as the
/// similarity signal for retrieval (image name, exit code, namespace).
pub fn context_tags(pod: &Pod, category: ErrorCategory) -> Vec<String> {
    let mut tags = vec![format!("category:{}", category)];

    if let Some(ns) = pod.metadata.namespace.as_deref() {
        tags.push(format!("namespace:{}", ns));
    }

    if let Some(spec) = &pod.spec {
        for c in &spec.containers {
            if let Some(image) = c.image.as_deref() {
                tags.push(format!("image:{}", image));
            }
        }
    }

    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                tags.push(format!("exit-code:{}", terminated.exit_code));
            }
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref())
                && let Some(reason) = waiting.reason.as_deref()
            {
                tags.push(format!("reason:{}", reason));
            }
        }
    }

    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn base_pod(phase: &str, age_seconds: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(Utc::now() - Duration::seconds(age_seconds))),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn with_waiting(mut pod: Pod, reason: &str) -> Pod {
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    fn with_terminated(mut pod: Pod, reason: Option<&str>, exit_code: i32) -> Pod {
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    reason: reason.map(|r| r.to_string()),
                    exit_code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn test_running_pod_is_healthy() {
        let pod = base_pod("Running", 600);
        assert_eq!(classify_pod(&pod, Utc::now(), 60), PodHealth::Healthy);
    }

    #[test]
    fn test_pending_within_grace_is_not_a_failure() {
        let pod = base_pod("Pending", 30);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::PendingWithinGrace
        );
    }

    #[test]
    fn test_pending_past_grace_is_pending_schedule() {
        let pod = base_pod("Pending", 120);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::PendingSchedule)
        );
    }

    #[test]
    fn test_image_pull_backoff() {
        let pod = with_waiting(base_pod("Pending", 600), "ImagePullBackOff");
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::ImagePullFailure)
        );
    }

    #[test]
    fn test_oom_reason_wins_over_exit_code() {
        // Exit code 1 would be crash-loop, but the OOMKilled reason wins.
        let pod = with_terminated(base_pod("Running", 600), Some("OOMKilled"), 1);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::OomKill)
        );
    }

    #[test]
    fn test_exit_137_without_reason_is_oom() {
        let pod = with_terminated(base_pod("Running", 600), None, 137);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::OomKill)
        );
    }

    #[test]
    fn test_nonzero_exit_is_crash_loop() {
        let pod = with_terminated(base_pod("Running", 600), None, 1);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::CrashLoop)
        );
    }

    #[test]
    fn test_init_container_failure_is_distinct() {
        let mut pod = base_pod("Pending", 600);
        pod.status.as_mut().unwrap().init_container_statuses = Some(vec![ContainerStatus {
            name: "init".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 1,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert_eq!(
            classify_pod(&pod, Utc::now(), 60),
            PodHealth::Failing(ErrorCategory::InitContainerFailure)
        );
    }

    #[test]
    fn test_category_round_trips_through_strings() {
        for cat in ErrorCategory::ALL {
            assert_eq!(ErrorCategory::parse(cat.as_str()), cat);
        }
        assert_eq!(ErrorCategory::parse("weird"), ErrorCategory::Unknown);
    }
}
