use std::time::Duration;

use anyhow::{Context, Result};

use crate::cli::MemoryAction;
use kube_mender::clients::ReflexionClient;

pub async fn run(reflexion_url: String, action: MemoryAction) -> Result<()> {
    let client = ReflexionClient::new(&reflexion_url, Duration::from_secs(10))
        .context("Invalid Reflexion URL")?;

    match action {
        MemoryAction::Stats => {
            let stats = client
                .statistics()
                .await
                .context("Failed to fetch memory statistics")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        MemoryAction::Strategies => {
            let response = client
                .strategies()
                .await
                .context("Failed to fetch strategies")?;

            println!(
                "{:<14} {:<22} {:<10} {:<8} {:<8} {:<50}",
                "CATEGORY", "ID", "CONF", "USED", "WINS", "DESCRIPTION"
            );
            println!("{}", "-".repeat(115));

            for s in &response.strategies {
                println!(
                    "{:<14} {:<22} {:<10.2} {:<8} {:<8} {:<50}",
                    s["category"].as_str().unwrap_or("?"),
                    truncate(s["id"].as_str().unwrap_or("?"), 22),
                    s["confidence"].as_f64().unwrap_or(0.0),
                    s["usage_count"].as_u64().unwrap_or(0),
                    s["success_count"].as_u64().unwrap_or(0),
                    truncate(s["description"].as_str().unwrap_or(""), 50),
                );
            }
            println!("\nTotal: {} strategies", response.total_count);
        }

        MemoryAction::Episodes { limit } => {
            let response = client
                .episodes(limit)
                .await
                .context("Failed to fetch episodes")?;

            println!(
                "{:<14} {:<20} {:<30} {:<10} {:<10}",
                "CATEGORY", "NAMESPACE", "POD", "OUTCOME", "SECONDS"
            );
            println!("{}", "-".repeat(86));

            for e in &response.episodes {
                println!(
                    "{:<14} {:<20} {:<30} {:<10} {:<10.1}",
                    e["category"].as_str().unwrap_or("?"),
                    e["namespace"].as_str().unwrap_or("?"),
                    e["pod_name"].as_str().unwrap_or("?"),
                    e["outcome"].as_str().unwrap_or("?"),
                    e["resolution_seconds"].as_f64().unwrap_or(0.0),
                );
            }
            println!(
                "\nTotal: {} episodes ({:.0}% of cap)",
                response.total_episodes,
                response.memory_utilization * 100.0
            );
        }

        MemoryAction::Performance { days } => {
            let performance = client
                .performance(days)
                .await
                .context("Failed to fetch performance counters")?;
            println!("{}", serde_json::to_string_pretty(&performance)?);
        }

        MemoryAction::Clear { target, yes } => {
            if !yes {
                anyhow::bail!("Refusing to wipe memory without --yes");
            }
            let response = client
                .clear(&target)
                .await
                .context("Failed to clear memory")?;
            println!("Cleared {} rows ({})", response.removed, target);
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
