use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::sync::{Semaphore, broadcast};
use tokio::{signal, time};
use tracing::{info, warn};

use kube_mender::clients::{ExecutorClient, ReflexionClient};
use kube_mender::config::Config;
use kube_mender::executor::{ExecutorState, KubeVerifier, build_executor_router};
use kube_mender::watcher::{DedupSet, IncidentOutcome, WatcherContext, find_eligible, handle_incident};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static INCIDENTS_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("incidents_detected_total", "Total failing pods enqueued")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static INCIDENTS_RESOLVED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "incidents_resolved_total",
        "Total incidents with verified success",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static INCIDENTS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "incidents_failed_total",
        "Total incidents ending in partial or failed remediation",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static INCIDENTS_ABANDONED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "incidents_abandoned_total",
        "Total incidents abandoned on transport failure or operator handoff",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static DEDUP_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("dedup_entries", "Pod identities currently claimed by the dedup set")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= ENTRY ============================= */

pub async fn run(
    namespace: Option<String>,
    reflexion_url: String,
    executor_addr: String,
    interval: u64,
    workers: usize,
    dry_run: bool,
) -> Result<()> {
    println!("Starting pod watcher...\n");
    info!("watcher_starting");

    let mut cfg = Config::from_env();
    cfg.poll_interval_seconds = interval;
    cfg.worker_count = workers.max(1);

    print!("  Cluster connection .......... ");
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Reflexion service ........... ");
    let reflexion = ReflexionClient::new(&reflexion_url, Duration::from_secs(30))
        .context("Invalid Reflexion URL")?;
    match reflexion.health().await {
        Ok(health) => println!("OK (status: {})", health["status"].as_str().unwrap_or("unknown")),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Reflexion service unreachable at {}: {}", reflexion_url, e);
        }
    }

    print!("  Executor socket ............. ");
    let addr: SocketAddr = executor_addr
        .parse()
        .context("Invalid executor address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Executor socket unavailable on {addr}"))?;
    println!("http://{addr}");

    let executor = ExecutorClient::new(&format!("http://{addr}"), Duration::from_secs(600))
        .context("Invalid executor URL")?;

    println!("  Watched namespace ........... {}", namespace.as_deref().unwrap_or("(all)"));
    println!("  Workers ..................... {}", cfg.worker_count);
    println!("  Poll interval ............... {}s", cfg.poll_interval_seconds);
    if dry_run {
        println!("  Dry run ..................... enabled (commands are echoed, not executed)");
    }
    println!();
    println!("  Available endpoints:");
    println!("    POST /execute-commands .... Plan execution endpoint");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe (503 until first poll)");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Pod watcher running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let ctx = Arc::new(WatcherContext {
        kube: client.clone(),
        reflexion,
        executor,
        dedup: DedupSet::new(Duration::from_secs(cfg.dedup_ttl_seconds)),
        cfg: cfg.clone(),
        dry_run,
    });

    let ready = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let executor_state = ExecutorState {
        verifier: Arc::new(KubeVerifier::new(client, cfg.pending_grace_seconds)),
        default_timeout: Duration::from_secs(cfg.command_timeout_seconds),
        dry_run,
    };

    let http_shutdown = shutdown_tx.subscribe();
    let http_ready = ready.clone();
    let http_handle = tokio::spawn(async move {
        serve_http(listener, executor_state, http_ready, http_shutdown).await
    });

    let workers_sem = Arc::new(Semaphore::new(cfg.worker_count));
    let poll_ctx = ctx.clone();
    let poll_ready = ready.clone();
    let poll_sem = workers_sem.clone();
    let poll_shutdown = shutdown_tx.subscribe();
    let poll_handle = tokio::spawn(async move {
        poll_loop(poll_ctx, namespace, poll_sem, poll_ready, poll_shutdown).await
    });

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping pod watcher...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = poll_handle.await?;

    // Let in-flight incidents finish, up to the drain budget.
    let drain = time::timeout(
        Duration::from_secs(cfg.drain_timeout_seconds),
        workers_sem.acquire_many(cfg.worker_count as u32),
    )
    .await;
    if drain.is_err() {
        warn!("drain_timeout_in_flight_incidents_abandoned");
    }

    let _ = http_handle.await?;

    info!("watcher_stopped");
    println!("Pod watcher stopped.");
    Ok(())
}

/* ============================= POLL LOOP ============================= */

async fn poll_loop(
    ctx: Arc<WatcherContext>,
    namespace: Option<String>,
    workers: Arc<Semaphore>,
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = time::interval(Duration::from_secs(ctx.cfg.poll_interval_seconds));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("poll_loop_shutdown");
                return Ok(());
            }

            _ = ticker.tick() => {
                let purged = ctx.dedup.purge_expired().await;
                if purged > 0 {
                    info!(purged, "dedup_entries_expired");
                }

                let eligible = match find_eligible(&ctx, namespace.as_deref()).await {
                    Ok(pods) => pods,
                    Err(e) => {
                        warn!(error = %e, "pod_list_failed");
                        continue;
                    }
                };

                ready.store(true, Ordering::Relaxed);
                DEDUP_ENTRIES.set(ctx.dedup.len().await as i64);

                for pod in eligible {
                    INCIDENTS_DETECTED.inc();

                    let permit = match workers.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return Ok(()),
                    };

                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let outcome = handle_incident(&ctx, &pod).await;
                        match outcome {
                            IncidentOutcome::Resolved => INCIDENTS_RESOLVED.inc(),
                            IncidentOutcome::Unresolved(_) => INCIDENTS_FAILED.inc(),
                            IncidentOutcome::HumanRequired
                            | IncidentOutcome::Abandoned(_) => INCIDENTS_ABANDONED.inc(),
                        }
                        DEDUP_ENTRIES.set(ctx.dedup.len().await as i64);
                        drop(permit);
                    });
                }
            }
        }
    }
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(state: ExecutorState, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .merge(build_executor_router(state))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::Relaxed) {
                        (StatusCode::OK, "READY")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
                    }
                }
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn serve_http(
    listener: tokio::net::TcpListener,
    state: ExecutorState,
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(state, ready);

    info!(addr = %listener.local_addr()?, "executor_http_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}
