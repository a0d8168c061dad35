use anyhow::{Context, Result};
use blockcore::{
    BlockConfig, BlockDefinition, BlockEvent, ExecutionEvent, FunctionConfig, ResponseConfig, TriggerConfig,
    TriggerKind, Value, Workflow,
};
use blockruntime::{FlowRuntime, HandlerRegistry, RuntimeConfig};
use blockscheduler::{
    entries_for_workflow, DispatchStrategy, IggyTaskConsumer, IggyTaskQueue, InMemoryScheduleStore,
    QueueWorker, ScheduleDispatcher, ScheduleRunner, ScheduleStore, SchedulerConfig, WorkerPool,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockflow")]
#[command(about = "Block workflow engine CLI", long_about = None)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Validate a workflow file against the registered block types
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available block types
    Blocks,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },

    /// Run one dispatch tick over the schedules of a workflow directory
    Dispatch {
        /// Directory of workflow JSON files
        #[arg(short, long)]
        dir: PathBuf,

        /// Tick time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Dispatch schedules forever, consuming the task queue when one is configured
    Worker {
        /// Directory of workflow JSON files
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run { file, input } => run_workflow(file, input).await?,
        Commands::Validate { file } => validate_workflow(file)?,
        Commands::Blocks => list_blocks(),
        Commands::Init { output } => create_example_workflow(output)?,
        Commands::Dispatch { dir, at } => dispatch_once(dir, at.unwrap_or_else(Utc::now)).await?,
        Commands::Worker { dir } => run_worker(dir).await?,
    }

    Ok(())
}

fn build_runtime() -> FlowRuntime {
    let mut registry = HandlerRegistry::new();
    blockhandlers::register_all(&mut registry);
    FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::from_env())
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&workflow_json).with_context(|| format!("parsing {}", file.display()))
}

/// Every `*.json` workflow in `dir`
fn load_workflows(dir: &Path) -> Result<Vec<Workflow>> {
    let mut workflows = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            workflows.push(load_workflow(&path)?);
        }
    }
    Ok(workflows)
}

fn parse_inputs(input: Option<String>) -> Result<HashMap<String, Value>> {
    let Some(input_str) = input else {
        return Ok(HashMap::new());
    };
    match Value::from_json(serde_json::from_str(&input_str)?) {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow::anyhow!("Input must be a JSON object")),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Blocks: {}", workflow.blocks.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let inputs = parse_inputs(input)?;
    let runtime = build_runtime();
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { .. } => println!("▶️  Workflow started"),
                ExecutionEvent::BlockStarted { block_id, block_type, .. } => {
                    println!("  ⚡ Starting block: {} ({})", block_id, block_type);
                }
                ExecutionEvent::BlockCompleted { block_id, duration_ms, .. } => {
                    println!("  ✅ Block {} completed in {}ms", block_id, duration_ms);
                }
                ExecutionEvent::BlockFailed { block_id, error, .. } => {
                    println!("  ❌ Block {} failed: {}", block_id, error);
                }
                ExecutionEvent::BlockSkipped { block_id, reason, .. } => {
                    println!("  ⏭️  Block {} skipped: {}", block_id, reason);
                }
                ExecutionEvent::IterationStarted { container_id, index, total, .. } => {
                    println!("  🔁 {} iteration {}/{}", container_id, index + 1, total);
                }
                ExecutionEvent::BlockEvent { block_id, event, .. } => match event {
                    BlockEvent::Info { message } => println!("     ℹ️  [{}] {}", block_id, message),
                    BlockEvent::Warning { message } => println!("     ⚠️  [{}] {}", block_id, message),
                    BlockEvent::Progress { percent, message } => {
                        println!("     📊 [{}] {}% {}", block_id, percent, message.unwrap_or_default());
                    }
                    BlockEvent::Data { .. } => {}
                },
                ExecutionEvent::WorkflowCompleted { status, duration_ms, .. } => {
                    println!("🏁 Workflow finished {:?} in {}ms", status, duration_ms);
                }
            }
        }
    });

    let result = runtime.execute_with(&workflow, inputs, TriggerKind::Manual).await;

    // Let the listener print what is still buffered
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    let result = result?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {:?}", result.status);
    println!("   Completed: {}/{} blocks", result.completed_blocks(), result.total_blocks());
    if result.cost > 0.0 {
        println!("   Cost: ${:.4}", result.cost);
    }

    if !result.final_output.is_empty() {
        println!();
        println!("📤 Output:");
        let output = Value::Object(result.final_output);
        println!("{}", serde_json::to_string_pretty(&output.to_json())?);
    }

    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let mut registry = HandlerRegistry::new();
    blockhandlers::register_all(&mut registry);
    registry.validate_workflow(&workflow)?;
    let schedules = entries_for_workflow(&workflow, Utc::now())?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Blocks: {}", workflow.blocks.len());
    println!("   Edges: {}", workflow.edges.len());
    for entry in schedules {
        println!(
            "   Schedule {}: next run {}",
            entry.cron_expression.unwrap_or_default(),
            entry.next_run_at
        );
    }

    Ok(())
}

fn list_blocks() {
    println!("📦 Available Block Types:");
    println!();

    let mut registry = HandlerRegistry::new();
    blockhandlers::register_all(&mut registry);

    for block_type in registry.list_block_types() {
        match registry.get_metadata(block_type) {
            Some(metadata) => {
                println!("  • {} ({})", block_type, metadata.category);
                println!("    {}", metadata.description);
            }
            None => println!("  • {}", block_type),
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Greeting Workflow");
    workflow.description = Some("Greets the caller every morning".to_string());

    workflow.add_block(
        BlockDefinition::new(
            "start",
            BlockConfig::Trigger(TriggerConfig {
                defaults: HashMap::from([("name".to_string(), Value::from("world"))]),
                schedule: Some("0 9 * * *".to_string()),
            }),
        )
        .with_name("Start"),
    );
    workflow.add_block(
        BlockDefinition::new(
            "greet",
            BlockConfig::Function(FunctionConfig {
                function: "template".to_string(),
                args: HashMap::from([("template".to_string(), Value::from("Hello, {{start.name}}!"))]),
            }),
        )
        .with_name("Greet"),
    );
    workflow.add_block(
        BlockDefinition::new(
            "reply",
            BlockConfig::Response(ResponseConfig {
                data: None,
                status: 200,
                headers: HashMap::new(),
            }),
        )
        .with_name("Reply"),
    );
    workflow.connect("start", "greet");
    workflow.connect("greet", "reply");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  blockflow run --file {} --input '{{\"name\": \"Ada\"}}'", output.display());

    Ok(())
}

/// Runtime with every workflow in `dir` registered, plus their schedules
async fn load_schedules(dir: &Path) -> Result<(FlowRuntime, Arc<InMemoryScheduleStore>)> {
    let runtime = build_runtime();
    let store = Arc::new(InMemoryScheduleStore::new());
    let now = Utc::now();

    for workflow in load_workflows(dir)? {
        let entries = entries_for_workflow(&workflow, now)?;
        info!("Loaded {} with {} schedule(s)", workflow.name, entries.len());
        runtime.register_workflow(workflow).await?;
        for entry in entries {
            store.upsert(entry).await?;
        }
    }
    Ok((runtime, store))
}

async fn dispatch_once(dir: PathBuf, at: DateTime<Utc>) -> Result<()> {
    let (runtime, store) = load_schedules(&dir).await?;
    let runner = Arc::new(ScheduleRunner::new(Arc::new(runtime), store.clone()));
    let pool = Arc::new(WorkerPool::new(runner, SchedulerConfig::from_env().max_concurrent_runs));
    let dispatcher = ScheduleDispatcher::direct(store, pool.clone());

    let report = dispatcher.dispatch(at).await?;
    pool.shutdown().await;

    let stats = pool.stats();
    println!("⏰ Dispatch at {}", at);
    println!("   Attempted: {}", report.attempted);
    println!("   Enqueued: {}", report.enqueued);
    println!("   Failed: {}", report.failed);
    println!("   Runs succeeded: {}, failed: {}", stats.succeeded, stats.failed);
    Ok(())
}

async fn run_worker(dir: PathBuf) -> Result<()> {
    let config = SchedulerConfig::from_env();
    let (runtime, store) = load_schedules(&dir).await?;
    let runner = Arc::new(ScheduleRunner::new(Arc::new(runtime), store.clone()));
    let interval = Duration::from_millis(config.poll_interval_ms);

    let (dispatcher, pool) = match &config.strategy {
        DispatchStrategy::Queue { task_name } => {
            let queue = IggyTaskQueue::connect(config.iggy.clone()).await?;
            let consumer =
                IggyTaskConsumer::new(queue.client(), &config.iggy.stream_name, task_name.clone(), &config.consumer_group)
                    .await?;
            let worker = QueueWorker::new(Arc::new(consumer), runner, interval);
            tokio::spawn(async move { worker.run().await });
            (ScheduleDispatcher::queued(store, Arc::new(queue), task_name.clone()), None)
        }
        DispatchStrategy::Direct => {
            let pool = Arc::new(WorkerPool::new(runner, config.max_concurrent_runs));
            (ScheduleDispatcher::direct(store, pool.clone()), Some(pool))
        }
    };

    info!("Worker started with {:?} dispatch every {:?}", dispatcher.strategy(), interval);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatcher.dispatch(Utc::now()).await {
                    Ok(report) if report.attempted > 0 => info!("Dispatched {:?}", report),
                    Ok(_) => {}
                    Err(e) => error!("Dispatch tick failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down worker");
                break;
            }
        }
    }

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    Ok(())
}
