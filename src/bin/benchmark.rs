/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! CLI surface (§6): `benchmark creating-and-deleting <count>` drives raw
//! create/delete throughput through the `TaskManager`; `run` boots the
//! full pipeline against a configured database; `config init` writes a
//! starter TOML file. Not part of the scheduling core itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trigger_engine::config::{generate_default_config_toml, ConfigLoader};
use trigger_engine::database::universal_types::UniversalTimestamp;
use trigger_engine::database::Database;
use trigger_engine::instance::InstanceId;
use trigger_engine::models::Task;
use trigger_engine::repository::{DieselRepository, Repository, RepositoryOptions};
use trigger_engine::sink::{TracingErrorSink, TracingMonitoringSink};
use trigger_engine::slot_token::StorageWorkerPool;
use trigger_engine::task_manager::TaskManager;
use trigger_engine::Engine;

#[derive(Parser)]
#[command(
    name = "trigger-engine-bench",
    version,
    about = "Benchmark and operate the trigger-engine scheduling pipeline"
)]
struct Cli {
    /// Path to a TOML configuration file; falls back to the search path
    /// (and then defaults) when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output (errors only).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Throughput benchmarks against the storage layer.
    Benchmark {
        #[command(subcommand)]
        action: BenchmarkAction,
    },
    /// Boot the full engine (Preloader, WaitingStage, Sender) against the
    /// configured database and print fired tasks until interrupted.
    Run,
    /// Configuration file helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BenchmarkAction {
    /// Creates `count` tasks, then deletes them, reporting throughput for
    /// each phase.
    CreatingAndDeleting {
        /// Number of tasks to create and then delete.
        count: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Writes (or prints) the default configuration as TOML.
    Init {
        /// Destination path; prints to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(cli))
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

async fn dispatch(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Benchmark {
            action: BenchmarkAction::CreatingAndDeleting { count },
        } => benchmark_creating_and_deleting(&cli, *count).await,
        Commands::Run => run_engine(&cli).await,
        Commands::Config {
            action: ConfigAction::Init { output },
        } => config_init(output.as_deref()),
    }
}

fn config_init(output: Option<&std::path::Path>) -> Result<()> {
    let toml = generate_default_config_toml()?;
    match output {
        Some(path) => {
            std::fs::write(path, &toml)?;
            println!("wrote default configuration to {}", path.display());
        }
        None => print!("{toml}"),
    }
    Ok(())
}

async fn run_engine(cli: &Cli) -> Result<()> {
    let config = ConfigLoader::new().load_or_default(cli.config.as_deref())?;
    let engine = Arc::new(Engine::new(config).await?);

    let mut stream = engine.consume();
    let consumer_handle = tokio::spawn(async move {
        while let Some(task) = stream.next().await {
            tracing::info!(task_id = %task.id, exec_time = task.exec_time.as_secs(), "task fired");
        }
    });

    let run_engine = engine.clone();
    let run_handle = tokio::spawn(async move { run_engine.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received interrupt, shutting down");
    engine.shutdown();

    run_handle.await??;
    consumer_handle.await?;
    Ok(())
}

/// Builds a bare `TaskManager` over a `DieselRepository`, bypassing the
/// Preloader/WaitingStage/Sender pipeline: this benchmark measures raw
/// storage-layer throughput, not end-to-end firing latency.
async fn benchmark_creating_and_deleting(cli: &Cli, count: u64) -> Result<()> {
    let config = ConfigLoader::new().load_or_default(cli.config.as_deref())?;
    let instance = config
        .instance
        .id
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::generate);

    let url = config.database.resolve_url()?;
    let database = Database::new(&url, config.database.pool_size);
    database
        .run_migrations()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let repository_options = RepositoryOptions {
        max_count_tasks_in_collection: config.repository.max_count_tasks_in_collection as i64,
        max_retries_on_deadlock: config.repository.max_retries_on_deadlock,
    };
    let repository: Arc<dyn Repository> =
        Arc::new(DieselRepository::new(database, instance, repository_options));

    let task_manager = Arc::new(TaskManager::new(
        repository,
        Arc::new(TracingErrorSink),
        Arc::new(TracingMonitoringSink),
        config.pipeline.manager_max_retries,
        CancellationToken::new(),
    ));

    let workers = StorageWorkerPool::new(config.pipeline.storage_workers);
    let far_future = UniversalTimestamp::from_secs(UniversalTimestamp::now().as_secs() + 3600);

    let mut ids = Vec::with_capacity(count as usize);
    let create_start = Instant::now();
    let mut handles = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let task = Task::new(far_future);
        ids.push(task.id);
        let slot = workers.acquire().await;
        let task_manager = task_manager.clone();
        handles.push(tokio::spawn(async move {
            let _slot = slot;
            task_manager.create_task(&task, false).await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let create_elapsed = create_start.elapsed();

    let delete_start = Instant::now();
    let mut handles = Vec::with_capacity(ids.len());
    for id in ids {
        let slot = workers.acquire().await;
        let task_manager = task_manager.clone();
        handles.push(tokio::spawn(async move {
            let _slot = slot;
            task_manager.delete_task(id).await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let delete_elapsed = delete_start.elapsed();

    print_throughput_table(count, create_elapsed, delete_elapsed);
    Ok(())
}

fn print_throughput_table(count: u64, create_elapsed: Duration, delete_elapsed: Duration) {
    println!(
        "{:<10} {:>10} {:>14} {:>16}",
        "operation", "count", "elapsed_ms", "ops_per_sec"
    );
    for (label, elapsed) in [("create", create_elapsed), ("delete", delete_elapsed)] {
        let ops_per_sec = if elapsed.as_secs_f64() > 0.0 {
            count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        println!(
            "{:<10} {:>10} {:>14} {:>16.1}",
            label,
            count,
            elapsed.as_millis(),
            ops_per_sec
        );
    }
}
