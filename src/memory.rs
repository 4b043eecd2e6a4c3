use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::classify::ErrorCategory;
use crate::config::Config;
use crate::error::{MenderError, Result};
use crate::protocol::{CommandPlan, ExecutionResult, ExecutionStatus};

/// Reserved strategy id meaning "no learned strategy — plan from scratch".
pub const LLM_ONLY_SENTINEL: &str = "llm-only";

/* ============================= RECORDS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategySource {
    Seeded,
    Learned,
}

impl StrategySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategySource::Seeded => "seeded",
            StrategySource::Learned => "learned",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "seeded" => StrategySource::Seeded,
            _ => StrategySource::Learned,
        }
    }
}

/// A reusable remediation template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub category: ErrorCategory,
    pub description: String,
    pub confidence: f64,
    pub usage_count: u32,
    pub success_count: u32,
    pub source: StrategySource,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// One completed incident, as retrieved for prompting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub category: ErrorCategory,
    pub namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    pub strategy_id: String,
    pub plan: CommandPlan,
    pub execution: Option<ExecutionResult>,
    pub outcome: ExecutionStatus,
    pub resolution_seconds: f64,
    pub reflection: String,
    pub lessons: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the workflow hands over at the single commit point.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub id: String,
    pub category: ErrorCategory,
    pub namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    pub strategy_id: String,
    /// Short human description of the approach, used when a successful
    /// LLM-only episode is promoted into a learned strategy.
    pub strategy_description: Option<String>,
    pub plan: CommandPlan,
    pub execution: ExecutionResult,
    pub outcome: ExecutionStatus,
    pub resolution_seconds: f64,
    pub reflection: String,
    pub lessons: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRow {
    pub category: String,
    pub strategy_id: String,
    pub day: String,
    pub attempts: u32,
    pub successes: u32,
    pub mean_resolution_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    pub episodes: u32,
    pub successes: u32,
    pub success_rate: f64,
    pub learning_velocity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub strategy_count: usize,
    pub episode_count: usize,
    pub episode_cap: usize,
    pub memory_utilization: f64,
    pub categories: HashMap<String, CategoryStats>,
}

/* ============================= CONFIDENCE ============================= */

/// Confidence update: `clamp(0, 1, α·success_rate + (1−α)·recency)` with
/// `recency = e^(−Δdays / half_life)`.
///
/// The success rate uses add-one smoothing (`successes / (usage + 1)`) so
/// a single lucky episode does not saturate a strategy at 1.0 and repeat
/// successes still move the number.
pub fn updated_confidence(
    alpha: f64,
    successes: u32,
    usage: u32,
    days_since_success: f64,
    half_life_days: f64,
) -> f64 {
    let success_rate = f64::from(successes) / f64::from(usage + 1);
    let recency = (-days_since_success.max(0.0) / half_life_days).exp();
    (alpha * success_rate + (1.0 - alpha) * recency).clamp(0.0, 1.0)
}

/* ============================= STORE ============================= */

/// Durable memory: strategies, episodes, and performance aggregates in one
/// SQLite database. Writes for an episode happen in a single transaction;
/// a failed commit leaves no partial state.
pub struct Memory {
    conn: Mutex<Connection>,
    alpha: f64,
    half_life_days: f64,
    episode_cap: usize,
}

impl Memory {
    pub fn open(path: &Path, cfg: &Config) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, cfg)
    }

    pub fn open_in_memory(cfg: &Config) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, cfg)
    }

    fn with_connection(conn: Connection, cfg: &Config) -> Result<Self> {
        let memory = Self {
            conn: Mutex::new(conn),
            alpha: cfg.confidence_alpha,
            half_life_days: cfg.recency_half_life_days,
            episode_cap: cfg.episode_cap,
        };
        memory.migrate()?;
        Ok(memory)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MenderError::Permanent("memory store mutex poisoned".to_string()))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                id              TEXT PRIMARY KEY,
                category        TEXT NOT NULL,
                description     TEXT NOT NULL,
                confidence      REAL NOT NULL,
                usage_count     INTEGER NOT NULL DEFAULT 0,
                success_count   INTEGER NOT NULL DEFAULT 0,
                source          TEXT NOT NULL,
                parameters      TEXT NOT NULL DEFAULT '{}',
                created_at      TEXT NOT NULL,
                last_used_at    TEXT,
                last_success_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_strategies_cat_desc
                ON strategies(category, description);
            CREATE TABLE IF NOT EXISTS episodes (
                id                 TEXT PRIMARY KEY,
                category           TEXT NOT NULL,
                namespace          TEXT NOT NULL,
                pod_name           TEXT NOT NULL,
                pod_uid            TEXT NOT NULL,
                strategy_id        TEXT NOT NULL,
                plan_json          TEXT NOT NULL,
                execution_json     TEXT NOT NULL,
                outcome            TEXT NOT NULL,
                resolution_seconds REAL NOT NULL,
                reflection         TEXT NOT NULL,
                lessons_json       TEXT NOT NULL,
                tags_json          TEXT NOT NULL,
                created_at         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_category
                ON episodes(category, created_at);
            CREATE TABLE IF NOT EXISTS performance (
                category                 TEXT NOT NULL,
                strategy_id              TEXT NOT NULL,
                day                      TEXT NOT NULL,
                attempts                 INTEGER NOT NULL DEFAULT 0,
                successes                INTEGER NOT NULL DEFAULT 0,
                total_resolution_seconds REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (category, strategy_id, day)
            );",
        )?;
        Ok(())
    }

    pub fn healthy(&self) -> bool {
        self.conn()
            .and_then(|c| {
                c.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(MenderError::from)
            })
            .is_ok()
    }

    /* ------------------------- seeding ------------------------- */

    /// Install the baseline strategy per well-known category. Idempotent:
    /// re-running never duplicates a (category, description) pair.
    pub fn seed_defaults(&self) -> Result<usize> {
        let seeds: [(ErrorCategory, &str, serde_json::Value); 5] = [
            (
                ErrorCategory::ImagePullFailure,
                "delete the pod and recreate it with a known-good image tag",
                json!({"fallback_tag": "latest", "verify": "kubectl get pod"}),
            ),
            (
                ErrorCategory::OomKill,
                "raise the container memory limit and restart the pod",
                json!({"memory_limit": "256Mi"}),
            ),
            (
                ErrorCategory::CrashLoop,
                "inspect logs, then restart the pod with an increased initial delay",
                json!({"initial_delay_seconds": 30}),
            ),
            (
                ErrorCategory::PendingSchedule,
                "lower resource requests so the scheduler can place the pod",
                json!({"cpu_request": "100m", "memory_request": "128Mi"}),
            ),
            (
                ErrorCategory::ConfigError,
                "recreate the pod after correcting the referenced config object",
                json!({}),
            ),
        ];

        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        let mut inserted = 0usize;
        for (category, description, parameters) in seeds {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO strategies
                    (id, category, description, confidence, usage_count, success_count,
                     source, parameters, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, 0, 'seeded', ?5, ?6)",
                params![
                    format!("seed-{}", category),
                    category.as_str(),
                    description,
                    0.6_f64,
                    parameters.to_string(),
                    now,
                ],
            )?;
            inserted += changed;
        }
        Ok(inserted)
    }

    /* ------------------------- strategies ------------------------- */

    pub fn strategies_for(&self, category: ErrorCategory) -> Result<Vec<Strategy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, description, confidence, usage_count, success_count,
                    source, parameters, created_at, last_used_at, last_success_at
             FROM strategies WHERE category = ?1 ORDER BY confidence DESC",
        )?;
        let rows = stmt.query_map([category.as_str()], row_to_strategy)?;
        collect_rows(rows)
    }

    pub fn all_strategies(&self) -> Result<Vec<Strategy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, description, confidence, usage_count, success_count,
                    source, parameters, created_at, last_used_at, last_success_at
             FROM strategies ORDER BY confidence DESC",
        )?;
        let rows = stmt.query_map([], row_to_strategy)?;
        collect_rows(rows)
    }

    pub fn strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, category, description, confidence, usage_count, success_count,
                    source, parameters, created_at, last_used_at, last_success_at
             FROM strategies WHERE id = ?1",
            [id],
            row_to_strategy,
        )
        .optional()
        .map_err(MenderError::from)
    }

    pub fn strategy_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM strategies", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /* ------------------------- episodes ------------------------- */

    pub fn episode_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn recent_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, namespace, pod_name, pod_uid, strategy_id, plan_json,
                    execution_json, outcome, resolution_seconds, reflection, lessons_json,
                    tags_json, created_at
             FROM episodes ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_episode)?;
        collect_rows(rows)
    }

    /// Episodes of the same category ranked by tag overlap, then recency.
    pub fn similar_episodes(
        &self,
        category: ErrorCategory,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let candidates = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, category, namespace, pod_name, pod_uid, strategy_id, plan_json,
                        execution_json, outcome, resolution_seconds, reflection, lessons_json,
                        tags_json, created_at
                 FROM episodes WHERE category = ?1 ORDER BY created_at DESC LIMIT 200",
            )?;
            let rows = stmt.query_map([category.as_str()], row_to_episode)?;
            collect_rows(rows)?
        };

        let mut scored: Vec<(usize, Episode)> = candidates
            .into_iter()
            .map(|ep| {
                let overlap = ep.tags.iter().filter(|t| tags.contains(t)).count();
                (overlap, ep)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });

        Ok(scored.into_iter().take(limit).map(|(_, ep)| ep).collect())
    }

    /// De-duplicated lessons from the most similar episodes, newest first.
    pub fn lessons_for(
        &self,
        category: ErrorCategory,
        tags: &[String],
        episode_limit: usize,
    ) -> Result<Vec<String>> {
        let episodes = self.similar_episodes(category, tags, episode_limit)?;
        let mut seen = std::collections::HashSet::new();
        let mut lessons = Vec::new();
        for ep in episodes {
            for lesson in ep.lessons {
                if seen.insert(lesson.clone()) {
                    lessons.push(lesson);
                }
            }
        }
        Ok(lessons)
    }

    pub fn utilization(&self) -> Result<f64> {
        Ok(self.episode_count()? as f64 / self.episode_cap.max(1) as f64)
    }

    /* ------------------------- the commit point ------------------------- */

    /// Persist one completed incident: episode row, strategy counters and
    /// confidence, performance aggregate, and episode eviction, all in one
    /// transaction. Any failure rolls the whole episode back.
    pub fn record_episode(&self, ep: &NewEpisode) -> Result<()> {
        let now = Utc::now();
        let succeeded = ep.outcome == ExecutionStatus::Success;

        let mut guard = self.conn()?;
        let tx = guard.transaction()?;

        tx.execute(
            "INSERT INTO episodes
                (id, category, namespace, pod_name, pod_uid, strategy_id, plan_json,
                 execution_json, outcome, resolution_seconds, reflection, lessons_json,
                 tags_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                ep.id,
                ep.category.as_str(),
                ep.namespace,
                ep.pod_name,
                ep.pod_uid,
                ep.strategy_id,
                serde_json::to_string(&ep.plan).unwrap_or_default(),
                serde_json::to_string(&ep.execution).unwrap_or_default(),
                ep.outcome.to_string(),
                ep.resolution_seconds,
                ep.reflection,
                serde_json::to_string(&ep.lessons).unwrap_or_default(),
                serde_json::to_string(&ep.tags).unwrap_or_default(),
                now.to_rfc3339(),
            ],
        )?;

        if ep.strategy_id == LLM_ONLY_SENTINEL {
            if succeeded {
                self.promote_learned_strategy(&tx, ep, now)?;
            }
        } else {
            self.touch_strategy(&tx, &ep.strategy_id, succeeded, now)?;
        }

        tx.execute(
            "INSERT INTO performance (category, strategy_id, day, attempts, successes,
                                      total_resolution_seconds)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT (category, strategy_id, day) DO UPDATE SET
                attempts = attempts + 1,
                successes = successes + ?4,
                total_resolution_seconds = total_resolution_seconds + ?5",
            params![
                ep.category.as_str(),
                ep.strategy_id,
                now.format("%Y-%m-%d").to_string(),
                i64::from(succeeded),
                ep.resolution_seconds,
            ],
        )?;

        self.evict_within(&tx)?;

        tx.commit()?;
        Ok(())
    }

    /// Update an existing strategy's counters and confidence.
    fn touch_strategy(
        &self,
        tx: &rusqlite::Transaction<'_>,
        strategy_id: &str,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let row = tx
            .query_row(
                "SELECT usage_count, success_count, last_success_at, created_at
                 FROM strategies WHERE id = ?1",
                [strategy_id],
                |r| {
                    Ok((
                        r.get::<_, u32>(0)?,
                        r.get::<_, u32>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((usage, successes, last_success_at, created_at)) = row else {
            // Strategy was cleared mid-flight; the episode still stands.
            warn!(strategy_id, "strategy_missing_during_update");
            return Ok(());
        };

        let usage = usage + 1;
        let successes = successes + u32::from(succeeded);

        let reference = if succeeded {
            now
        } else {
            last_success_at
                .as_deref()
                .and_then(parse_ts)
                .unwrap_or_else(|| parse_ts(&created_at).unwrap_or(now))
        };
        let days_since_success = (now - reference).num_seconds() as f64 / 86_400.0;

        let confidence = updated_confidence(
            self.alpha,
            successes,
            usage,
            days_since_success,
            self.half_life_days,
        );

        tx.execute(
            "UPDATE strategies SET
                usage_count = ?1,
                success_count = ?2,
                confidence = ?3,
                last_used_at = ?4,
                last_success_at = COALESCE(?5, last_success_at)
             WHERE id = ?6",
            params![
                usage,
                successes,
                confidence,
                now.to_rfc3339(),
                succeeded.then(|| now.to_rfc3339()),
                strategy_id,
            ],
        )?;
        Ok(())
    }

    /// First observation of a novel successful LLM-only pattern becomes a
    /// learned strategy. Re-observing the same (category, description)
    /// updates the existing row instead of duplicating it.
    fn promote_learned_strategy(
        &self,
        tx: &rusqlite::Transaction<'_>,
        ep: &NewEpisode,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let description = ep
            .strategy_description
            .clone()
            .or_else(|| ep.plan.fix_commands.first().cloned())
            .unwrap_or_else(|| format!("llm-generated fix for {}", ep.category));

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM strategies WHERE category = ?1 AND description = ?2",
                params![ep.category.as_str(), description],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return self.touch_strategy(tx, &id, true, now);
        }

        let id = format!("learned-{}", uuid::Uuid::new_v4());
        let confidence = updated_confidence(self.alpha, 1, 1, 0.0, self.half_life_days);
        let parameters = json!({
            "fix_commands": ep.plan.fix_commands,
            "validation_commands": ep.plan.validation_commands,
        });

        tx.execute(
            "INSERT INTO strategies
                (id, category, description, confidence, usage_count, success_count,
                 source, parameters, created_at, last_used_at, last_success_at)
             VALUES (?1, ?2, ?3, ?4, 1, 1, 'learned', ?5, ?6, ?6, ?6)",
            params![
                id,
                ep.category.as_str(),
                description,
                confidence,
                parameters.to_string(),
                now.to_rfc3339(),
            ],
        )?;

        info!(
            strategy_id = %id,
            category = %ep.category,
            "strategy_learned"
        );
        Ok(())
    }

    /// Past the cap, drop the oldest 10% in the same transaction.
    fn evict_within(&self, tx: &rusqlite::Transaction<'_>) -> Result<()> {
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?;
        if (count as usize) <= self.episode_cap {
            return Ok(());
        }

        let to_delete = (self.episode_cap / 10).max(1) as i64;
        let removed = tx.execute(
            "DELETE FROM episodes WHERE id IN (
                SELECT id FROM episodes ORDER BY created_at ASC LIMIT ?1
             )",
            [to_delete],
        )?;
        info!(removed, "episodes_evicted");
        Ok(())
    }

    /* ------------------------- performance ------------------------- */

    pub fn performance_since(&self, days: u32) -> Result<Vec<PerformanceRow>> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days)))
            .format("%Y-%m-%d")
            .to_string();

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT category, strategy_id, day, attempts, successes, total_resolution_seconds
             FROM performance WHERE day >= ?1 ORDER BY day DESC",
        )?;
        let rows = stmt.query_map([cutoff], |r| {
            let attempts: u32 = r.get(3)?;
            let total: f64 = r.get(5)?;
            Ok(PerformanceRow {
                category: r.get(0)?,
                strategy_id: r.get(1)?,
                day: r.get(2)?,
                attempts,
                successes: r.get(4)?,
                mean_resolution_seconds: if attempts > 0 {
                    total / f64::from(attempts)
                } else {
                    0.0
                },
            })
        })?;
        collect_rows(rows)
    }

    /// Slope of the success indicator over the last `window` episodes of a
    /// category. Positive means the loop is getting better at this class
    /// of failure. Dashboard signal only, never a decision input.
    pub fn learning_velocity(&self, category: ErrorCategory, window: usize) -> Result<f64> {
        let outcomes: Vec<f64> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT outcome FROM episodes WHERE category = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![category.as_str(), window as i64], |r| {
                r.get::<_, String>(0)
            })?;
            collect_rows(rows)?
                .into_iter()
                .rev()
                .map(|o| if o == "success" { 1.0 } else { 0.0 })
                .collect()
        };

        Ok(slope(&outcomes))
    }

    pub fn statistics(&self) -> Result<MemoryStatistics> {
        let mut categories = HashMap::new();
        {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT category,
                        COUNT(*),
                        SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END)
                 FROM episodes GROUP BY category",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, u32>(2)?,
                ))
            })?;
            for row in collect_rows(rows)? {
                let (category, episodes, successes) = row;
                categories.insert(
                    category,
                    CategoryStats {
                        episodes,
                        successes,
                        success_rate: if episodes > 0 {
                            f64::from(successes) / f64::from(episodes)
                        } else {
                            0.0
                        },
                        learning_velocity: 0.0,
                    },
                );
            }
        }

        for (name, stats) in categories.iter_mut() {
            stats.learning_velocity =
                self.learning_velocity(ErrorCategory::parse(name), 20)?;
        }

        Ok(MemoryStatistics {
            strategy_count: self.strategy_count()?,
            episode_count: self.episode_count()?,
            episode_cap: self.episode_cap,
            memory_utilization: self.utilization()?,
            categories,
        })
    }

    /* ------------------------- manual wipes ------------------------- */

    pub fn clear_strategies(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM strategies", [])?)
    }

    pub fn clear_episodes(&self) -> Result<usize> {
        let conn = self.conn()?;
        let episodes = conn.execute("DELETE FROM episodes", [])?;
        conn.execute("DELETE FROM performance", [])?;
        Ok(episodes)
    }

    pub fn clear_all(&self) -> Result<usize> {
        Ok(self.clear_strategies()? + self.clear_episodes()?)
    }
}

/* ============================= ROW MAPPING ============================= */

fn row_to_strategy(r: &rusqlite::Row<'_>) -> rusqlite::Result<Strategy> {
    let category: String = r.get(1)?;
    let parameters: String = r.get(7)?;
    let created_at: String = r.get(8)?;
    let last_used_at: Option<String> = r.get(9)?;
    let last_success_at: Option<String> = r.get(10)?;
    let source: String = r.get(6)?;

    Ok(Strategy {
        id: r.get(0)?,
        category: ErrorCategory::parse(&category),
        description: r.get(2)?,
        confidence: r.get(3)?,
        usage_count: r.get(4)?,
        success_count: r.get(5)?,
        source: StrategySource::parse(&source),
        parameters: serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        last_used_at: last_used_at.as_deref().and_then(parse_ts),
        last_success_at: last_success_at.as_deref().and_then(parse_ts),
    })
}

fn row_to_episode(r: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let category: String = r.get(1)?;
    let plan_json: String = r.get(6)?;
    let execution_json: String = r.get(7)?;
    let outcome: String = r.get(8)?;
    let lessons_json: String = r.get(11)?;
    let tags_json: String = r.get(12)?;
    let created_at: String = r.get(13)?;

    Ok(Episode {
        id: r.get(0)?,
        category: ErrorCategory::parse(&category),
        namespace: r.get(2)?,
        pod_name: r.get(3)?,
        pod_uid: r.get(4)?,
        strategy_id: r.get(5)?,
        plan: serde_json::from_str(&plan_json).unwrap_or_default(),
        execution: serde_json::from_str(&execution_json).ok(),
        outcome: match outcome.as_str() {
            "success" => ExecutionStatus::Success,
            "partial" => ExecutionStatus::Partial,
            _ => ExecutionStatus::Failure,
        },
        resolution_seconds: r.get(9)?,
        reflection: r.get(10)?,
        lessons: serde_json::from_str(&lessons_json).unwrap_or_default(),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Least-squares slope of y over index positions.
fn slope(ys: &[f64]) -> f64 {
    let n = ys.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n_f;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    if var == 0.0 { 0.0 } else { cov / var }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> Memory {
        Memory::open_in_memory(&Config::default()).unwrap()
    }

    fn episode(category: ErrorCategory, strategy_id: &str, outcome: ExecutionStatus) -> NewEpisode {
        NewEpisode {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            namespace: "default".to_string(),
            pod_name: "web-1".to_string(),
            pod_uid: "u1".to_string(),
            strategy_id: strategy_id.to_string(),
            strategy_description: Some("pin image tag and recreate".to_string()),
            plan: CommandPlan {
                fix_commands: vec!["kubectl delete pod web-1".to_string()],
                validation_commands: vec!["kubectl get pod web-1".to_string()],
                ..Default::default()
            },
            execution: ExecutionResult {
                success: outcome == ExecutionStatus::Success,
                partial_success: outcome == ExecutionStatus::Partial,
                total_commands: 2,
                success_count: 2,
                failure_count: 0,
                status: outcome,
                commands: vec![],
            },
            outcome,
            resolution_seconds: 4.2,
            reflection: "worked".to_string(),
            lessons: vec!["pin explicit image tags".to_string()],
            tags: vec!["image:nginx:latest".to_string(), "namespace:default".to_string()],
        }
    }

    #[test]
    fn test_seeding_is_idempotent() {
        let m = mem();
        let first = m.seed_defaults().unwrap();
        let second = m.seed_defaults().unwrap();
        assert!(first >= 5);
        assert_eq!(second, 0);
        assert_eq!(m.strategy_count().unwrap(), first);
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        for (s, u, d) in [(0, 0, 0.0), (1, 1, 0.0), (10, 10, 100.0), (3, 9, 7.0)] {
            let c = updated_confidence(0.7, s, u, d, 14.0);
            assert!((0.0..=1.0).contains(&c), "confidence {c} out of range");
        }
    }

    #[test]
    fn test_confidence_rises_with_repeat_success() {
        let one = updated_confidence(0.7, 1, 1, 0.0, 14.0);
        let two = updated_confidence(0.7, 2, 2, 0.0, 14.0);
        let three = updated_confidence(0.7, 3, 3, 0.0, 14.0);
        assert!(two > one);
        assert!(three > two);
    }

    #[test]
    fn test_confidence_decays_with_staleness() {
        let fresh = updated_confidence(0.7, 2, 4, 0.0, 14.0);
        let stale = updated_confidence(0.7, 2, 4, 28.0, 14.0);
        assert!(stale < fresh);
    }

    #[test]
    fn test_success_updates_strategy_counters() {
        let m = mem();
        m.seed_defaults().unwrap();
        let seed = m.strategies_for(ErrorCategory::ImagePullFailure).unwrap()[0].clone();

        m.record_episode(&episode(
            ErrorCategory::ImagePullFailure,
            &seed.id,
            ExecutionStatus::Success,
        ))
        .unwrap();

        let after = m.strategy(&seed.id).unwrap().unwrap();
        assert_eq!(after.usage_count, seed.usage_count + 1);
        assert_eq!(after.success_count, seed.success_count + 1);
        assert!(after.last_success_at.is_some());
        assert!(after.success_count <= after.usage_count);
    }

    #[test]
    fn test_failure_increments_usage_only_and_lowers_confidence() {
        let m = mem();
        m.seed_defaults().unwrap();
        let seed = m.strategies_for(ErrorCategory::CrashLoop).unwrap()[0].clone();

        m.record_episode(&episode(
            ErrorCategory::CrashLoop,
            &seed.id,
            ExecutionStatus::Failure,
        ))
        .unwrap();

        let after = m.strategy(&seed.id).unwrap().unwrap();
        assert_eq!(after.usage_count, seed.usage_count + 1);
        assert_eq!(after.success_count, seed.success_count);
        assert!(after.confidence < seed.confidence);
    }

    #[test]
    fn test_llm_only_success_promotes_learned_strategy() {
        let m = mem();
        m.record_episode(&episode(
            ErrorCategory::OomKill,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Success,
        ))
        .unwrap();

        let learned = m.strategies_for(ErrorCategory::OomKill).unwrap();
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].source, StrategySource::Learned);
        assert_eq!(learned[0].usage_count, 1);
        assert_eq!(learned[0].success_count, 1);
    }

    #[test]
    fn test_llm_only_failure_promotes_nothing() {
        let m = mem();
        m.record_episode(&episode(
            ErrorCategory::OomKill,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Failure,
        ))
        .unwrap();
        assert!(m.strategies_for(ErrorCategory::OomKill).unwrap().is_empty());
    }

    #[test]
    fn test_repeat_promotion_updates_instead_of_duplicating() {
        let m = mem();
        for _ in 0..2 {
            m.record_episode(&episode(
                ErrorCategory::OomKill,
                LLM_ONLY_SENTINEL,
                ExecutionStatus::Success,
            ))
            .unwrap();
        }
        let learned = m.strategies_for(ErrorCategory::OomKill).unwrap();
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].usage_count, 2);
    }

    #[test]
    fn test_similar_episodes_rank_by_tag_overlap() {
        let m = mem();

        let mut close = episode(
            ErrorCategory::ImagePullFailure,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Failure,
        );
        close.tags = vec!["image:nginx:broken".to_string(), "namespace:default".to_string()];
        m.record_episode(&close).unwrap();

        let mut far = episode(
            ErrorCategory::ImagePullFailure,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Failure,
        );
        far.tags = vec!["image:redis:7".to_string(), "namespace:cache".to_string()];
        m.record_episode(&far).unwrap();

        let hits = m
            .similar_episodes(
                ErrorCategory::ImagePullFailure,
                &["image:nginx:broken".to_string()],
                5,
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tags, close.tags);
    }

    #[test]
    fn test_lessons_are_deduplicated() {
        let m = mem();
        for _ in 0..3 {
            m.record_episode(&episode(
                ErrorCategory::ImagePullFailure,
                LLM_ONLY_SENTINEL,
                ExecutionStatus::Success,
            ))
            .unwrap();
        }
        let lessons = m
            .lessons_for(ErrorCategory::ImagePullFailure, &[], 5)
            .unwrap();
        assert_eq!(lessons, vec!["pin explicit image tags".to_string()]);
    }

    #[test]
    fn test_eviction_drops_oldest_tenth() {
        let mut cfg = Config::default();
        cfg.episode_cap = 20;
        let m = Memory::open_in_memory(&cfg).unwrap();

        for _ in 0..21 {
            m.record_episode(&episode(
                ErrorCategory::CrashLoop,
                LLM_ONLY_SENTINEL,
                ExecutionStatus::Failure,
            ))
            .unwrap();
        }

        // 21st insert tipped past the cap: 10% of 20 = 2 evicted.
        assert_eq!(m.episode_count().unwrap(), 19);
    }

    #[test]
    fn test_performance_rows_aggregate_by_day() {
        let m = mem();
        m.seed_defaults().unwrap();
        let seed = m.strategies_for(ErrorCategory::OomKill).unwrap()[0].clone();

        m.record_episode(&episode(ErrorCategory::OomKill, &seed.id, ExecutionStatus::Success))
            .unwrap();
        m.record_episode(&episode(ErrorCategory::OomKill, &seed.id, ExecutionStatus::Failure))
            .unwrap();

        let rows = m.performance_since(1).unwrap();
        let row = rows
            .iter()
            .find(|r| r.strategy_id == seed.id)
            .expect("performance row exists");
        assert_eq!(row.attempts, 2);
        assert_eq!(row.successes, 1);
        assert!(row.mean_resolution_seconds > 0.0);
    }

    #[test]
    fn test_learning_velocity_positive_on_improvement() {
        let m = mem();
        for outcome in [
            ExecutionStatus::Failure,
            ExecutionStatus::Failure,
            ExecutionStatus::Success,
            ExecutionStatus::Success,
        ] {
            m.record_episode(&episode(ErrorCategory::OomKill, LLM_ONLY_SENTINEL, outcome))
                .unwrap();
        }
        let v = m.learning_velocity(ErrorCategory::OomKill, 20).unwrap();
        assert!(v > 0.0);
    }

    #[test]
    fn test_clear_then_repopulate() {
        let m = mem();
        m.seed_defaults().unwrap();
        m.record_episode(&episode(
            ErrorCategory::OomKill,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Success,
        ))
        .unwrap();

        m.clear_all().unwrap();
        assert_eq!(m.strategy_count().unwrap(), 0);
        assert_eq!(m.episode_count().unwrap(), 0);

        m.record_episode(&episode(
            ErrorCategory::OomKill,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Success,
        ))
        .unwrap();
        assert_eq!(m.episode_count().unwrap(), 1);
        assert_eq!(m.strategy_count().unwrap(), 1);
    }

    #[test]
    fn test_statistics_summarize_categories() {
        let m = mem();
        m.record_episode(&episode(
            ErrorCategory::OomKill,
            LLM_ONLY_SENTINEL,
            ExecutionStatus::Success,
        ))
        .unwrap();

        let stats = m.statistics().unwrap();
        assert_eq!(stats.episode_count, 1);
        let oom = stats.categories.get("oom-kill").unwrap();
        assert_eq!(oom.episodes, 1);
        assert_eq!(oom.success_rate, 1.0);
    }
}
