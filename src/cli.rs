use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-mender")]
#[command(about = "Autonomous Kubernetes pod remediation with reflexion-style learning")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and peer service reachability
    Check {
        /// Also probe the Reflexion service
        #[arg(long, env = "MENDER_REFLEXION_URL")]
        reflexion_url: Option<String>,
    },

    /// Start the pod watcher: detection, execution, orchestration
    Watch {
        /// Namespace to watch; omit to watch all namespaces
        #[arg(long, env = "MENDER_NAMESPACE")]
        namespace: Option<String>,

        /// Base URL of the Reflexion service
        #[arg(
            long,
            env = "MENDER_REFLEXION_URL",
            default_value = "http://127.0.0.1:8090"
        )]
        reflexion_url: String,

        /// Listen address for the local command executor
        #[arg(long, env = "MENDER_EXECUTOR_ADDR", default_value = "127.0.0.1:8091")]
        executor_addr: String,

        /// Poll interval in seconds
        #[arg(long, env = "MENDER_POLL_INTERVAL", default_value_t = 10)]
        interval: u64,

        /// Concurrent incident workers
        #[arg(long, env = "MENDER_WORKERS", default_value_t = 3)]
        workers: usize,

        /// Echo commands instead of executing them
        #[arg(long, env = "MENDER_DRY_RUN")]
        dry_run: bool,
    },

    /// Start the Reflexion service: workflow engine, planner, memory
    Serve {
        /// Listen address
        #[arg(long, env = "MENDER_SERVE_ADDR", default_value = "0.0.0.0:8090")]
        addr: String,

        /// SQLite database path for strategies, episodes, and performance
        #[arg(long, env = "MENDER_DB_PATH", default_value = "mender-memory.db")]
        db_path: String,

        /// Chat-completions API base URL
        #[arg(
            long,
            env = "MENDER_LLM_BASE_URL",
            default_value = "https://api.openai.com/v1"
        )]
        llm_base_url: String,

        /// API key for the LLM provider
        #[arg(long, env = "MENDER_LLM_API_KEY")]
        llm_api_key: Option<String>,

        /// Model identifier
        #[arg(long, env = "MENDER_LLM_MODEL", default_value = "gpt-4o-mini")]
        llm_model: String,

        /// External diagnostic binary consulted during analysis
        #[arg(long, env = "MENDER_DIAGNOSTIC_BIN")]
        diagnostic_bin: Option<String>,

        /// Skip installing the seeded baseline strategies
        #[arg(long, env = "MENDER_NO_SEED")]
        no_seed: bool,
    },

    /// Inspect or wipe the Reflexion memory over HTTP
    Memory {
        #[arg(
            long,
            env = "MENDER_REFLEXION_URL",
            default_value = "http://127.0.0.1:8090"
        )]
        reflexion_url: String,

        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
pub enum MemoryAction {
    /// Combined memory statistics
    Stats,

    /// List recorded strategies
    Strategies,

    /// List recent episodes
    Episodes {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Aggregate performance counters
    Performance {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Wipe memory (strategies, episodes, or everything)
    Clear {
        /// What to clear: all, strategies, or episodes
        #[arg(long, default_value = "all")]
        target: String,

        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}
