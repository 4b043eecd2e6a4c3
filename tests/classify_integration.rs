mod common;

use chrono::Utc;
use common::{make_test_pod, with_age_seconds, with_terminated, with_waiting_reason};
use kube_mender::classify::{ErrorCategory, PodHealth, classify_pod, context_tags};

// ══════════════════════════════════════════════════════════════════
// Classification integration tests (no cluster required)
//
// Exercises the detection boundary behaviors: pending grace, reason
// precedence over exit codes, init containers, and context tags.
// ══════════════════════════════════════════════════════════════════

const GRACE: i64 = 60;

#[test]
fn test_running_ready_pod_is_healthy() {
    let pod = make_test_pod("web-1", "default", "u1", "nginx:1.25", "Running");
    assert_eq!(classify_pod(&pod, Utc::now(), GRACE), PodHealth::Healthy);
}

#[test]
fn test_succeeded_pod_is_healthy() {
    let pod = make_test_pod("job-1", "default", "u1", "busybox:1.36", "Succeeded");
    assert_eq!(classify_pod(&pod, Utc::now(), GRACE), PodHealth::Healthy);
}

// ── Pending grace boundary ──

#[test]
fn test_pending_under_grace_is_not_enqueued() {
    let pod = with_age_seconds(
        make_test_pod("web-1", "default", "u1", "nginx:1.25", "Pending"),
        30,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::PendingWithinGrace
    );
}

#[test]
fn test_pending_at_grace_is_pending_schedule() {
    let pod = with_age_seconds(
        make_test_pod("web-1", "default", "u1", "nginx:1.25", "Pending"),
        60,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::PendingSchedule)
    );
}

// ── Waiting reasons ──

#[test]
fn test_image_pull_backoff_classified() {
    let pod = with_waiting_reason(
        make_test_pod("web-1", "default", "u1", "nginx:no-such-tag", "Pending"),
        "ImagePullBackOff",
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::ImagePullFailure)
    );
}

#[test]
fn test_invalid_image_name_is_distinct_from_pull_failure() {
    let pod = with_waiting_reason(
        make_test_pod("web-1", "default", "u1", "NGINX::bad", "Pending"),
        "InvalidImageName",
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::InvalidImageName)
    );
}

#[test]
fn test_crash_loop_backoff_classified() {
    let pod = with_waiting_reason(
        make_test_pod("bad-cmd", "default", "u1", "busybox:1.36", "Running"),
        "CrashLoopBackOff",
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::CrashLoop)
    );
}

#[test]
fn test_config_error_classified() {
    let pod = with_waiting_reason(
        make_test_pod("web-1", "default", "u1", "nginx:1.25", "Pending"),
        "CreateContainerConfigError",
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::ConfigError)
    );
}

// ── Terminated reason precedence ──

#[test]
fn test_oom_reason_beats_exit_code_heuristic() {
    // Exit code 137 with an explicit OOMKilled reason: the reason wins
    // (and they agree here); a non-137 code with the reason still wins.
    let pod = with_terminated(
        make_test_pod("svc-2", "default", "u1", "svc:1.0", "Running"),
        Some("OOMKilled"),
        137,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::OomKill)
    );

    let pod = with_terminated(
        make_test_pod("svc-2", "default", "u1", "svc:1.0", "Running"),
        Some("OOMKilled"),
        2,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::OomKill)
    );
}

#[test]
fn test_exit_137_without_reason_uses_heuristic() {
    let pod = with_terminated(
        make_test_pod("svc-2", "default", "u1", "svc:1.0", "Running"),
        None,
        137,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::OomKill)
    );
}

#[test]
fn test_plain_nonzero_exit_is_crash_loop() {
    let pod = with_terminated(
        make_test_pod("bad-cmd", "default", "u1", "busybox:1.36", "Running"),
        Some("Error"),
        1,
    );
    assert_eq!(
        classify_pod(&pod, Utc::now(), GRACE),
        PodHealth::Failing(ErrorCategory::CrashLoop)
    );
}

// ── Context tags ──

#[test]
fn test_context_tags_cover_image_namespace_and_category() {
    let pod = with_waiting_reason(
        make_test_pod("web-1", "production", "u1", "nginx:no-such-tag", "Pending"),
        "ImagePullBackOff",
    );
    let tags = context_tags(&pod, ErrorCategory::ImagePullFailure);

    assert!(tags.contains(&"category:image-pull-failure".to_string()));
    assert!(tags.contains(&"namespace:production".to_string()));
    assert!(tags.contains(&"image:nginx:no-such-tag".to_string()));
    assert!(tags.contains(&"reason:ImagePullBackOff".to_string()));
}
