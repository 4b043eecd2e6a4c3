use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::signal;
use tracing::info;

use kube_mender::api::{AppState, build_router};
use kube_mender::config::Config;
use kube_mender::diagnostics::DiagnosticAdapter;
use kube_mender::llm::HttpLlmClient;
use kube_mender::memory::Memory;
use kube_mender::workflow::WorkflowEngine;

pub async fn run(
    addr: String,
    db_path: String,
    llm_base_url: String,
    llm_api_key: Option<String>,
    llm_model: String,
    diagnostic_bin: Option<String>,
    no_seed: bool,
) -> Result<()> {
    println!("Starting Reflexion service...\n");
    info!("reflexion_starting");

    let cfg = Config::from_env();

    print!("  Memory database ............. ");
    let memory = match Memory::open(Path::new(&db_path), &cfg) {
        Ok(memory) => {
            println!("OK ({db_path})");
            Arc::new(memory)
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot open memory database at {}: {}", db_path, e);
        }
    };

    print!("  Seeded strategies ........... ");
    if no_seed {
        println!("skipped (--no-seed)");
    } else {
        let inserted = memory
            .seed_defaults()
            .context("Failed to seed baseline strategies")?;
        println!("OK ({inserted} new, {} total)", memory.strategy_count()?);
    }

    print!("  LLM provider ................ ");
    let api_key = llm_api_key.unwrap_or_default();
    if api_key.is_empty() {
        println!("WARN (no API key set; planning will fail until MENDER_LLM_API_KEY is provided)");
    } else {
        println!("OK ({llm_model} at {llm_base_url})");
    }
    let llm = Arc::new(
        HttpLlmClient::new(
            &llm_base_url,
            &api_key,
            &llm_model,
            Duration::from_secs(cfg.llm_timeout_seconds),
        )
        .context("Failed to build LLM client")?,
    );

    print!("  Diagnostic binary ........... ");
    match &diagnostic_bin {
        Some(bin) => println!("OK ({bin})"),
        None => println!("none (synthesized analysis only)"),
    }
    let diagnostics = DiagnosticAdapter::new(diagnostic_bin, Duration::from_secs(30));

    let socket: SocketAddr = addr.parse().context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("Cannot bind Reflexion service on {socket}"))?;

    println!("  HTTP server ................. http://{socket}");
    println!();
    println!("  Available endpoints:");
    println!("    POST   /process-with-k8s-data .. Incident submission");
    println!("    POST   /execution-feedback ..... Execution feedback");
    println!("    GET    /memory/strategies ...... Strategy store");
    println!("    GET    /memory/episodes ........ Episodic memory");
    println!("    GET    /memory/performance ..... Aggregate counters");
    println!("    GET    /memory/statistics ...... Combined summary");
    println!("    DELETE /memory/clear ........... Wipe all memory");
    println!("    GET    /health ................. Dependency status");
    println!();
    println!("Reflexion service running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let engine = Arc::new(WorkflowEngine::new(
        memory.clone(),
        llm.clone(),
        diagnostics,
        cfg,
    ));

    let state = AppState {
        engine,
        memory,
        llm,
    };

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let app = build_router(state);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping Reflexion service...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    server.await??;

    info!("reflexion_stopped");
    println!("Reflexion service stopped.");
    Ok(())
}
