use serde::{Deserialize, Serialize};

/* ============================= TUNABLES ============================= */

/// Runtime tunables shared by both services.
///
/// Every field has a baked-in default and an environment override
/// (`MENDER_<SCREAMING_FIELD>`). Service addresses and credentials are
/// CLI flags (see `cli.rs`); this struct carries the numeric knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Probability of bypassing learned strategies (epsilon).
    pub exploration_rate: f64,
    /// Minimum best-strategy confidence before exploitation is allowed.
    pub confidence_floor: f64,
    /// Weight of observed success rate in the confidence update.
    pub confidence_alpha: f64,
    /// Recency half-life, in days, for the confidence update.
    pub recency_half_life_days: f64,

    /// Episode store cap; the oldest 10% are evicted past this.
    pub episode_cap: usize,
    /// How many similar episodes feed the planner prompt.
    pub similar_episode_limit: usize,

    /// Max events captured per incident.
    pub event_limit: u32,
    /// Max log lines captured per incident.
    pub log_tail_lines: i64,
    /// Pending pods younger than this are not treated as failures.
    pub pending_grace_seconds: i64,

    pub worker_count: usize,
    pub poll_interval_seconds: u64,
    pub command_timeout_seconds: u64,
    /// Wall-clock budget for analyze..plan, exclusive of the
    /// awaiting-execution pause.
    pub workflow_budget_seconds: u64,
    pub llm_timeout_seconds: u64,
    /// Dedup entries age out after this long.
    pub dedup_ttl_seconds: u64,
    /// Grace period for in-flight work on shutdown.
    pub drain_timeout_seconds: u64,

    /// Cluster API pacing.
    pub cluster_qps: u32,
    pub cluster_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exploration_rate: 0.2,
            confidence_floor: 0.5,
            confidence_alpha: 0.7,
            recency_half_life_days: 14.0,
            episode_cap: 5000,
            similar_episode_limit: 5,
            event_limit: 50,
            log_tail_lines: 50,
            pending_grace_seconds: 60,
            worker_count: 3,
            poll_interval_seconds: 10,
            command_timeout_seconds: 60,
            workflow_budget_seconds: 120,
            llm_timeout_seconds: 30,
            dedup_ttl_seconds: 3600,
            drain_timeout_seconds: 10,
            cluster_qps: 100,
            cluster_burst: 200,
        }
    }
}

impl Config {
    /// Defaults overlaid with any `MENDER_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        override_f64(&mut cfg.exploration_rate, "MENDER_EXPLORATION_RATE");
        override_f64(&mut cfg.confidence_floor, "MENDER_CONFIDENCE_FLOOR");
        override_f64(&mut cfg.confidence_alpha, "MENDER_CONFIDENCE_ALPHA");
        override_f64(
            &mut cfg.recency_half_life_days,
            "MENDER_RECENCY_HALF_LIFE_DAYS",
        );
        override_parse(&mut cfg.episode_cap, "MENDER_EPISODE_CAP");
        override_parse(&mut cfg.similar_episode_limit, "MENDER_SIMILAR_EPISODES");
        override_parse(&mut cfg.event_limit, "MENDER_EVENT_LIMIT");
        override_parse(&mut cfg.log_tail_lines, "MENDER_LOG_TAIL_LINES");
        override_parse(&mut cfg.pending_grace_seconds, "MENDER_PENDING_GRACE");
        override_parse(&mut cfg.worker_count, "MENDER_WORKERS");
        override_parse(&mut cfg.poll_interval_seconds, "MENDER_POLL_INTERVAL");
        override_parse(&mut cfg.command_timeout_seconds, "MENDER_COMMAND_TIMEOUT");
        override_parse(&mut cfg.workflow_budget_seconds, "MENDER_WORKFLOW_BUDGET");
        override_parse(&mut cfg.llm_timeout_seconds, "MENDER_LLM_TIMEOUT");
        override_parse(&mut cfg.dedup_ttl_seconds, "MENDER_DEDUP_TTL");
        override_parse(&mut cfg.drain_timeout_seconds, "MENDER_DRAIN_TIMEOUT");
        override_parse(&mut cfg.cluster_qps, "MENDER_CLUSTER_QPS");
        override_parse(&mut cfg.cluster_burst, "MENDER_CLUSTER_BURST");
        cfg
    }
}

fn override_f64(slot: &mut f64, var: &str) {
    if let Ok(raw) = std::env::var(var)
        && let Ok(v) = raw.parse::<f64>()
    {
        *slot = v;
    }
}

fn override_parse<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var)
        && let Ok(v) = raw.parse::<T>()
    {
        *slot = v;
    }
}
