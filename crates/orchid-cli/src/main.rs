mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use orchid_core::auth::AuthManager;
use orchid_core::config::EngineConfig;
use orchid_core::execution::emission::{build_producer, Emitter};
use orchid_core::execution::step::StepDeps;
use orchid_core::expressions::template::Templater;
use orchid_core::expressions::ExpressionCache;
use orchid_core::http::HttpRequestor;
use orchid_core::lock::DistributedLock;
use orchid_core::queue::Processor;
use orchid_core::ratelimit::RateLimiter;
use orchid_core::scheduler::Scheduler;
use orchid_core::streams::JobStream;

use config::OrchidConfig;

#[derive(Parser)]
#[command(name = "orchid", about = "Plan-driven HTTP polling orchestrator")]
struct Cli {
    /// Database URL (overrides ORCHID_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an orchid config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/orchid")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the orchid database (creates it if missing, runs migrations)
    DbInit,
    /// Run the Processor worker loop against the job queue
    Worker,
    /// Run the Scheduler loop that publishes due plan executions
    Scheduler,
    /// Plan management (offline, no database required)
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Dead-letter queue inspection and replay
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Parse and lint a plan definition file, reporting depth/fanout/retry
    /// shape without touching a database.
    Validate {
        /// Path to the plan definition (.toml or .json)
        file: String,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered jobs for a tenant, most recent first
    List {
        /// Tenant ID to list dead letters for
        tenant_id: String,
        /// Maximum rows to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Re-publish a dead-lettered job onto the job queue, then delete the row
    Replay {
        /// Dead letter ID to replay
        id: String,
    },
}

/// Execute `orchid init`: write a config file pointing at `db_url`.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_owned() },
        redis: config::RedisSection::default(),
        kafka: config::KafkaSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  redis.url = {}", cfg.redis.url);
    println!("  kafka.bootstrap_servers = {}", cfg.kafka.bootstrap_servers);
    println!();
    println!("Next: run `orchid db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `orchid db-init`: create the database if missing, then migrate.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = OrchidConfig::resolve(cli_db_url)?;

    println!("Initializing orchid database...");

    orchid_db::pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = orchid_db::pool::create_pool(&resolved.db_config).await?;
    let migrations_path = orchid_db::pool::default_migrations_path();
    orchid_db::pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = orchid_db::pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("orchid db-init complete.");
    Ok(())
}

/// Build the full [`StepDeps`] graph: one Postgres pool, one Redis
/// connection manager shared across the rate limiter/lock/auth cache, a
/// Kafka producer, and an HTTP client. Shared by `worker` and (via the
/// Scheduler's own lock/stream deps) `scheduler`.
async fn build_step_deps(pool: sqlx::PgPool, redis_url: &str, kafka_bootstrap_servers: &str, engine_config: &EngineConfig) -> Result<StepDeps> {
    let redis_conn = config::connect_redis(redis_url).await?;

    let templater = Templater::new(ExpressionCache::new());
    let rate_limiter = RateLimiter::new(redis_conn.clone());
    let http = HttpRequestor::new(reqwest::Client::new());
    let auth = AuthManager::new(pool.clone(), redis_conn.clone());

    let producer = build_producer(kafka_bootstrap_servers).context("failed to build Kafka producer")?;
    let emitter = Emitter::new(producer, engine_config.kafka_response_topic.clone(), engine_config.kafka_error_topic.clone());

    Ok(StepDeps { templater, rate_limiter, http, auth, emitter, db: pool })
}

/// Execute `orchid worker`: run the Processor loop until Ctrl-C.
async fn cmd_worker(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = OrchidConfig::resolve(cli_db_url)?;
    let engine_config = Arc::new(EngineConfig::from_env());

    let db_pool = orchid_db::pool::create_pool(&resolved.db_config).await?;
    let redis_conn = config::connect_redis(&resolved.redis_url).await?;
    let stream = JobStream::new(redis_conn);
    let step_deps = build_step_deps(db_pool.clone(), &resolved.redis_url, &resolved.kafka_bootstrap_servers, &engine_config).await?;

    let processor = Arc::new(Processor::new(db_pool.clone(), stream, step_deps, engine_config));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining processor");
        shutdown.cancel();
    });

    processor.run(cancel).await?;
    db_pool.close().await;
    Ok(())
}

/// Execute `orchid scheduler`: run the Scheduler loop until Ctrl-C.
async fn cmd_scheduler(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = OrchidConfig::resolve(cli_db_url)?;
    let engine_config = Arc::new(EngineConfig::from_env());

    let db_pool = orchid_db::pool::create_pool(&resolved.db_config).await?;
    let lock_conn = config::connect_redis(&resolved.redis_url).await?;
    let stream_conn = config::connect_redis(&resolved.redis_url).await?;

    let lock = DistributedLock::new(lock_conn);
    let stream = JobStream::new(stream_conn);
    let scheduler = Scheduler::new(db_pool.clone(), lock, stream, engine_config);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, stopping scheduler");
        shutdown.cancel();
    });

    scheduler.run(cancel).await;
    db_pool.close().await;
    Ok(())
}

/// Execute `orchid plan validate`: parse the file and print a short
/// summary of its shape. Never touches the network or a database.
fn cmd_plan_validate(file: &str) -> Result<()> {
    let path = std::path::Path::new(file);
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read {file}"))?;
    let plan = config::parse_plan_definition(&contents, path)?;

    fn count_nodes(step: &orchid_core::execution::types::Step, depth: u32, max_depth: &mut u32) -> usize {
        *max_depth = (*max_depth).max(depth);
        1 + step.sub_steps.iter().map(|s| count_nodes(s, depth + 1, max_depth)).sum::<usize>()
    }

    let mut max_depth = 0;
    let node_count = count_nodes(&plan.root_step, 0, &mut max_depth);

    println!("plan OK: {file}");
    println!("  nodes: {node_count}");
    println!("  deepest nesting observed: {max_depth} (limit {})", plan.max_nesting_depth);
    println!("  max_execution_seconds: {}", plan.max_execution_seconds);
    println!("  rate_limits: {}", plan.rate_limits.len());

    if max_depth >= plan.max_nesting_depth {
        println!("  warning: observed nesting reaches the configured max_nesting_depth");
    }

    Ok(())
}

/// Execute `orchid dlq list`.
async fn cmd_dlq_list(cli_db_url: Option<&str>, tenant_id: &str, limit: i64) -> Result<()> {
    let resolved = OrchidConfig::resolve(cli_db_url)?;
    let db_pool = orchid_db::pool::create_pool(&resolved.db_config).await?;

    let tenant_id = Uuid::parse_str(tenant_id).with_context(|| format!("invalid tenant ID: {tenant_id}"))?;
    let entries = orchid_db::queries::dead_letters::list_dead_letters(&db_pool, tenant_id, limit).await?;

    if entries.is_empty() {
        println!("no dead letters for tenant {tenant_id}");
    } else {
        for entry in &entries {
            println!(
                "{}  {:<20}  plan={:<24}  execution={:<36}  attempts={:<3}  {}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.reason,
                entry.plan_key.as_deref().unwrap_or("-"),
                entry.execution_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_owned()),
                entry.retry_count,
                entry.error_message.as_deref().unwrap_or(""),
            );
        }
    }

    db_pool.close().await;
    Ok(())
}

/// Execute `orchid dlq replay`: re-publish the original job to the live
/// job queue, then delete the dead letter row so it isn't replayed twice.
async fn cmd_dlq_replay(cli_db_url: Option<&str>, id: &str) -> Result<()> {
    let resolved = OrchidConfig::resolve(cli_db_url)?;
    let engine_config = EngineConfig::from_env();
    let db_pool = orchid_db::pool::create_pool(&resolved.db_config).await?;

    let id = Uuid::parse_str(id).with_context(|| format!("invalid dead letter ID: {id}"))?;
    let entry = orchid_db::queries::dead_letters::get_dead_letter(&db_pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("dead letter {id} not found"))?;

    let redis_conn = config::connect_redis(&resolved.redis_url).await?;
    let stream = JobStream::new(redis_conn);
    stream.publish(&engine_config.redis_streams_job_queue, &entry.original_job).await?;

    orchid_db::queries::dead_letters::delete_dead_letter(&db_pool, id).await?;

    println!(
        "replayed dead letter {id} (plan {}) onto {}",
        entry.plan_key.as_deref().unwrap_or("-"),
        engine_config.redis_streams_job_queue
    );

    db_pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Worker => cmd_worker(cli.database_url.as_deref()).await,
        Commands::Scheduler => cmd_scheduler(cli.database_url.as_deref()).await,
        Commands::Plan { command: PlanCommands::Validate { file } } => cmd_plan_validate(&file),
        Commands::Dlq { command } => match command {
            DlqCommands::List { tenant_id, limit } => cmd_dlq_list(cli.database_url.as_deref(), &tenant_id, limit).await,
            DlqCommands::Replay { id } => cmd_dlq_replay(cli.database_url.as_deref(), &id).await,
        },
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
