//! Trellis CLI - run and configure the activity executor
//!
//! Provides subcommands for writing an executor config and running a sample
//! workflow through the async host.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use trellis::activities::{CodeFn, FutureActivity, While};
use trellis::runtime::config::{config_path, load_config, write_config};
use trellis::runtime::{ActivityExecutor, ExecutorConfig, WorkflowHost};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Workflow activity execution engine", long_about = None)]
struct Cli {
    /// Directory holding the executor config
    #[arg(short, long, default_value = ".trellis")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default executor config
    Init {
        /// Bound of the method-resolution cache
        #[arg(long, default_value = "500")]
        method_cache_capacity: usize,

        /// Do not record the dispatch trace
        #[arg(long)]
        no_trace: bool,
    },

    /// Run a sample loop whose body is an async operation
    Demo {
        /// Number of loop iterations
        #[arg(short, long, default_value = "3")]
        iterations: i64,

        /// Simulated latency of each async operation in milliseconds
        #[arg(long, default_value = "10")]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            method_cache_capacity,
            no_trace,
        } => {
            let config = ExecutorConfig {
                method_cache_capacity,
                record_trace: !no_trace,
                ..ExecutorConfig::default()
            };
            let path = write_config(&cli.root, &config)?;
            println!("Wrote executor config to {:?}", path);
        }

        Commands::Demo {
            iterations,
            delay_ms,
        } => {
            let config = if config_path(&cli.root).exists() {
                load_config(&cli.root)?
            } else {
                ExecutorConfig::default()
            };
            run_demo(config, iterations, delay_ms).await?;
        }
    }

    Ok(())
}

async fn run_demo(config: ExecutorConfig, iterations: i64, delay_ms: u64) -> Result<()> {
    let condition = CodeFn::activity("more-work?", |ctx| {
        let remaining = ctx.environment().get_i64("remaining")?;
        if remaining <= 0 {
            return Ok(json!(false));
        }
        ctx.set_variable("remaining", json!(remaining - 1))?;
        Ok(json!(true))
    });
    let body = FutureActivity::new(move |_args| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(json!("done"))
    })
    .into_activity("simulated-call");
    let workflow = While::new(condition)
        .variable("remaining", json!(iterations))
        .body(body)
        .into_activity("demo-loop");

    let mut executor = ActivityExecutor::new(config);
    executor.start(workflow, BTreeMap::new())?;

    let host = WorkflowHost::spawn(executor);
    let outcome = host.handle().wait_for_outcome().await?;
    let executor = host.join().await?;

    println!("Workflow:   {}", executor.workflow_id());
    println!("Outcome:    {:?}", outcome);
    println!("Work items: {}", executor.work_items_dispatched());
    match executor.trace() {
        Some(trace) => println!("Trace:      {}", trace.digest()),
        None => println!("Trace:      (recording disabled)"),
    }
    Ok(())
}
