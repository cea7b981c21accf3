//! Binary entry point: loads configuration, wires every component crate
//! together, and runs the HTTP server plus the scheduler and sub-agent
//! background loops until shutdown.

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, JobsCommands, MemoryCommands};
use fern_archive::ArchivalObserver;
use fern_embeddings::{EmbeddingsClient, HttpEmbeddingsClient, StubEmbeddingsClient};
use fern_llm::{stub::EchoLlmClient, LlmClient};
use fern_memory::MemoryStore;
use fern_registry::SessionRegistry;
use fern_scheduler::{JobScheduler, SchedulerConfig};
use fern_search::SearchEngine;
use fern_storage::Store;
use fern_subagent::{SubagentConfig, SubagentExecutor};
use fern_watchdog::{Watchdog, WatchdogConfig};
use fern_webhook::{AppState, WebhookConfig};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Host configuration, environment-variable driven per spec §6. Every
/// recognised option has a typed field and a documented default.
struct Config {
    host: String,
    port: u16,
    webhook_base_url: Option<String>,
    github_webhook_secret: Option<String>,
    github_default_branch: String,
    storage_path: PathBuf,
    model_provider: String,
    model_name: String,
    openai_api_key: Option<String>,
    archive: fern_archive::ArchiveConfig,
    embedding_model: String,
    auto_memory: fern_webhook::AutoMemoryConfig,
    scheduler_enabled: bool,
    scheduler: SchedulerConfig,
    subagent_enabled: bool,
    subagent: SubagentConfig,
    watchdog: WatchdogConfig,
    agent_turn_timeout_ms: Option<u64>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080),
            webhook_base_url: std::env::var("WEBHOOK_BASE_URL").ok().filter(|s| !s.is_empty()),
            // Not named in spec §6's recognised-option list (which only
            // covers the host-level options); carried anyway so the GitHub
            // webhook route is actually usable without code changes.
            github_webhook_secret: std::env::var("GITHUB_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            github_default_branch: env_string("GITHUB_DEFAULT_BRANCH", "main"),
            storage_path: std::env::var("STORAGE_PATH").map(PathBuf::from).unwrap_or_else(|_| default_storage_path()),
            model_provider: env_string("MODEL_PROVIDER", "echo"),
            model_name: env_string("MODEL_NAME", "echo-1"),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            archive: fern_archive::ArchiveConfig {
                chunk_threshold: env_parse("CHUNK_TOKEN_THRESHOLD", 25_000),
                chunk_min: env_parse("CHUNK_TOKEN_MIN", 15_000),
                chunk_max: env_parse("CHUNK_TOKEN_MAX", 40_000),
            },
            // SUMMARISATION_MODEL / MAX_SUMMARY_TOKENS select the
            // summarisation prompt budget; the reasoning loop itself is a
            // black box (see `build_llm`), so these are read for forward
            // compatibility with a real provider but otherwise unused here.
            embedding_model: env_string("EMBEDDING_MODEL", "text-embedding-3-small"),
            auto_memory: fern_webhook::AutoMemoryConfig {
                enabled: env_parse("AUTO_MEMORY_ENABLED", false),
                top_k: env_parse::<usize>("AUTO_MEMORY_TOP_K", 5).min(10),
                min_relevance: env_parse("AUTO_MEMORY_MIN_RELEVANCE", 0.0_f64).clamp(0.0, 1.0),
                max_chars: env_parse("AUTO_MEMORY_MAX_CHARS", 2000),
                thread_scoped: env_parse("AUTO_MEMORY_THREAD_SCOPED", false),
            },
            scheduler_enabled: env_parse("SCHEDULER_ENABLED", true),
            scheduler: SchedulerConfig {
                poll_interval_ms: env_parse("SCHEDULER_POLL_INTERVAL_MS", 60_000),
                max_concurrent_jobs: env_parse("SCHEDULER_MAX_CONCURRENT", 3),
            },
            subagent_enabled: env_parse("SUBAGENT_ENABLED", true),
            subagent: SubagentConfig {
                max_concurrent_tasks: env_parse("SUBAGENT_MAX_CONCURRENT", 3),
            },
            watchdog: WatchdogConfig {
                max_llm_failures: env_parse("WATCHDOG_MAX_LLM_FAILURES", 5),
                max_scheduler_failures: env_parse("WATCHDOG_MAX_SCHEDULER_FAILURES", 10),
            },
            agent_turn_timeout_ms: std::env::var("AGENT_TURN_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn default_storage_path() -> PathBuf {
    dirs::data_dir().map(|d| d.join("fern")).unwrap_or_else(|| PathBuf::from("./fern-data"))
}

fn watchdog_state_path() -> PathBuf {
    std::env::temp_dir().join("fern-watchdog-state")
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(fmt::layer()).with(filter).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match &cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Migrate { path } => run_migrate(config, path.clone()).await,
        Commands::Memory { command } => run_memory(config, command).await,
        Commands::Jobs { command } => run_jobs(config, command).await,
    };

    if let Err(err) = &result {
        tracing::error!(error = %err, "fern exited with a fatal error");
        if matches!(cli.command, Commands::Serve) {
            bump_watchdog_on_fatal_startup_failure();
        }
        std::process::exit(1);
    }
    result
}

/// A fatal start-up failure still counts against the persisted LLM
/// watchdog counter (spec §6 "Exit codes"), so repeated crash-loop restarts
/// are visible across process lifetimes even though the failure itself
/// happened before the watchdog was constructed.
fn bump_watchdog_on_fatal_startup_failure() {
    let watchdog = Watchdog::open(watchdog_state_path(), WatchdogConfig::default(), Box::new(|_| {}));
    watchdog.record_llm_failure();
}

fn build_embeddings(config: &Config) -> Arc<dyn EmbeddingsClient> {
    match &config.openai_api_key {
        Some(key) => Arc::new(HttpEmbeddingsClient::new(
            "https://api.openai.com/v1",
            Some(key.clone()),
            config.embedding_model.clone(),
        )),
        None => {
            tracing::warn!("OPENAI_API_KEY not set, embeddings fall back to an unseeded stub client");
            Arc::new(StubEmbeddingsClient::new(8))
        }
    }
}

fn build_llm(config: &Config) -> Arc<dyn LlmClient> {
    // The reasoning loop itself is a black box outside this system's scope
    // (spec §1): the bundled client is an in-memory stub. MODEL_PROVIDER /
    // MODEL_NAME are still parsed and logged so a future real provider
    // plugs into the same `LlmClient` seam without touching callers.
    tracing::info!(provider = %config.model_provider, model = %config.model_name, "reasoning loop is an in-memory stub in this build");
    Arc::new(EchoLlmClient::new())
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    let store = Store::open(config.storage_path.as_path())
        .await
        .with_context(|| format!("opening store at {}", config.storage_path.display()))?;

    let legacy_path = config.storage_path.join("summaries.jsonl");
    let embeddings = build_embeddings(&config);
    let report = fern_storage::migrate_legacy_jsonl(&store, &legacy_path, {
        let embeddings = embeddings.clone();
        move |texts| {
            let embeddings = embeddings.clone();
            async move {
                let mut out = Vec::with_capacity(texts.len());
                for text in &texts {
                    out.push(embeddings.embed(text).await.unwrap_or_default());
                }
                Ok(out)
            }
        }
    })
    .await?;
    if report.migrated > 0 || report.skipped_malformed > 0 {
        tracing::info!(migrated = report.migrated, skipped = report.skipped_malformed, "legacy summary log migrated");
    }

    let llm = build_llm(&config);
    let registry = Arc::new(SessionRegistry::new(store.clone(), llm.clone()));
    let memory = Arc::new(MemoryStore::new(store.clone(), embeddings.clone()));
    let search = Arc::new(SearchEngine::new(store.clone(), embeddings.clone()));
    let archive = Arc::new(ArchivalObserver::with_config(
        store.clone(),
        embeddings.clone(),
        llm.clone(),
        config.storage_path.clone(),
        config.archive,
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let watchdog_shutdown_tx = shutdown_tx.clone();
    let watchdog = Arc::new(Watchdog::open(
        watchdog_state_path(),
        config.watchdog,
        Box::new(move |reason: &str| {
            tracing::error!(reason, "watchdog threshold crossed, signalling shutdown");
            let _ = watchdog_shutdown_tx.send(());
        }),
    ));

    let scheduler = Arc::new(
        JobScheduler::with_config(store.clone(), llm.clone(), config.scheduler).with_watchdog(watchdog.clone()),
    );
    if config.scheduler_enabled {
        let recovered = scheduler.recover_stale_jobs().await?;
        if recovered > 0 {
            tracing::info!(recovered, "reset stale running jobs to pending on boot");
        }
        let scheduler_loop = scheduler.clone();
        let scheduler_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            scheduler_loop.run_forever(scheduler_shutdown).await;
        });
    }

    let subagent = Arc::new(SubagentExecutor::with_config(store.clone(), llm.clone(), config.subagent));
    if config.subagent_enabled {
        let recovered = subagent.recover_stale_tasks().await?;
        if recovered > 0 {
            tracing::info!(recovered, "marked stale running sub-agent tasks as failed on boot");
        }
    }

    // Reaching this point means every component above constructed cleanly;
    // a failure count left over from a previous crash loop no longer applies.
    watchdog.reset_llm_failures();

    let webhook_config = WebhookConfig {
        public_base_url: config.webhook_base_url.clone(),
        github_secret: config.github_webhook_secret.clone(),
        github_default_branch: config.github_default_branch.clone(),
        auto_memory: config.auto_memory,
        turn_timeout: config.agent_turn_timeout_ms.map(Duration::from_millis),
        ..WebhookConfig::default()
    };

    let state = Arc::new(AppState {
        store: store.clone(),
        llm: llm.clone(),
        registry: registry.clone(),
        memory: memory.clone(),
        search: search.clone(),
        archive: archive.clone(),
        channel_sender: Arc::new(fern_webhook::LoggingChannelSender),
        watchdog: watchdog.clone(),
        config: webhook_config,
    });

    let app = fern_webhook::router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "fern listening");

    let mut server_shutdown = shutdown_tx.subscribe();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = server_shutdown.recv() => {}
            }
        })
        .await;

    let _ = shutdown_tx.send(());
    subagent.shutdown();
    serve_result.map_err(anyhow::Error::from)
}

async fn run_migrate(config: Config, path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = Store::open(config.storage_path.as_path()).await?;
    let embeddings = build_embeddings(&config);
    let legacy_path = path.unwrap_or_else(|| config.storage_path.join("summaries.jsonl"));

    let report = fern_storage::migrate_legacy_jsonl(&store, &legacy_path, move |texts| {
        let embeddings = embeddings.clone();
        async move {
            let mut out = Vec::with_capacity(texts.len());
            for text in &texts {
                out.push(embeddings.embed(text).await.unwrap_or_default());
            }
            Ok(out)
        }
    })
    .await?;

    println!("migrated: {}", report.migrated);
    println!("skipped (malformed): {}", report.skipped_malformed);
    Ok(())
}

async fn run_memory(config: Config, command: &MemoryCommands) -> anyhow::Result<()> {
    let store = Store::open(config.storage_path.as_path()).await?;
    let embeddings = build_embeddings(&config);
    let memory = MemoryStore::new(store, embeddings);

    match command {
        MemoryCommands::Add { content, r#type, tags } => {
            let saved = memory.add(r#type.into_memory_type(), content, tags.clone()).await?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        MemoryCommands::List { r#type, limit } => {
            let memories = memory.list(r#type.map(|t| t.into_memory_type()), *limit).await?;
            println!("{}", serde_json::to_string_pretty(&memories)?);
        }
    }
    Ok(())
}

async fn run_jobs(config: Config, command: &JobsCommands) -> anyhow::Result<()> {
    let store = Store::open(config.storage_path.as_path()).await?;
    match command {
        JobsCommands::List { status } => {
            let jobs = store.list_jobs(status.clone()).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
    }
    Ok(())
}
