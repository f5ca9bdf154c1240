use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use jobflow_lite::config::{LongPollingConfig, NodeConfig, WorkerConfig};
use jobflow_lite::gateway::{ActivateJobsRequest, LocalPartitionClient, FIRST_PARTITION_ID};
use jobflow_lite::job::{Job, NewJob};
use jobflow_lite::node::Node;
use jobflow_lite::partition::InMemoryVariables;
use jobflow_lite::shutdown::install_shutdown_handler;
use jobflow_lite::worker::{JobHandler, JobOutcome};

#[derive(Parser, Debug)]
#[command(name = "jobflow-lite")]
#[command(version)]
#[command(about = "Partitioned job activation with long polling")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a node with demo producers and workers until interrupted
    Run(RunArgs),

    /// Create jobs in a fresh node, activate them once and print the result
    Activate(ActivateArgs),
}

// =============================================================================
// Node Arguments (shared by run and activate)
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Number of partitions
    #[arg(long, default_value = "3")]
    partitions: u32,

    /// Disable long polling for every request
    #[arg(long)]
    no_long_polling: bool,

    /// Default long-poll timeout in milliseconds
    #[arg(long, default_value = "10000")]
    long_poll_timeout_ms: u64,

    /// Probe interval for parked requests in milliseconds
    #[arg(long, default_value = "10000")]
    probe_timeout_ms: u64,

    /// Consecutive empty responses before requests are parked
    #[arg(long, default_value = "3")]
    min_empty_responses: u32,

    /// Ceiling for one serialized job batch in bytes
    #[arg(long, default_value = "4194304")]
    max_message_size: usize,

    /// Interval of the job timeout sweeper in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_check_interval_ms: u64,
}

impl NodeArgs {
    fn to_config(&self) -> NodeConfig {
        NodeConfig::new(self.partitions)
            .with_max_message_size(self.max_message_size)
            .with_job_timeout_check_interval(self.timeout_check_interval_ms)
            .with_long_polling(LongPollingConfig {
                enabled: !self.no_long_polling,
                timeout_ms: self.long_poll_timeout_ms,
                probe_timeout_ms: self.probe_timeout_ms,
                min_empty_responses: self.min_empty_responses,
            })
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Job types to produce and work on (comma-separated)
    #[arg(long, default_value = "email,invoice")]
    job_types: String,

    /// Workers per job type
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Jobs created per second for each job type (1-1000)
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..=1000))]
    rate: u64,

    /// Every n-th job handled by a worker fails (0 disables failures)
    #[arg(long, default_value = "10")]
    fail_every: u64,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Output format for the final summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct ActivateArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Job type to create and activate
    #[arg(long, default_value = "email")]
    job_type: String,

    /// Number of jobs to create before activating
    #[arg(long, default_value = "5")]
    jobs: u32,

    /// Maximum jobs to activate
    #[arg(long, default_value = "10")]
    max_jobs: i32,

    /// Long-poll timeout for the request (0 = default, negative = no long polling)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    request_timeout_ms: i64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ActivatedJobOutput {
    key: i64,
    partition_id: u32,
    job_type: String,
    worker: String,
    retries: i32,
    deadline_ms: Option<i64>,
}

#[derive(Serialize)]
struct PartitionSummaryOutput {
    partition_id: u32,
    records: usize,
    open_incidents: usize,
    activatable: usize,
}

// =============================================================================
// Demo Worker
// =============================================================================

struct DemoHandler {
    worker: String,
    fail_every: u64,
    handled: AtomicU64,
}

#[tonic::async_trait]
impl JobHandler for DemoHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let count = self.handled.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && count % self.fail_every == 0 {
            return JobOutcome::retry(job, format!("{} gave up on attempt {count}", self.worker));
        }

        let variables = json!({ "handled_by": self.worker });
        JobOutcome::Complete(serde_json::to_vec(&variables).unwrap_or_default())
    }
}

fn worker_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Run
// =============================================================================

/// Interval between created jobs; never zero, which `tokio::time::interval` refuses.
fn production_period(rate: u64) -> Duration {
    Duration::from_millis((1_000 / rate.max(1)).max(1))
}

async fn produce_jobs(
    client: LocalPartitionClient,
    variables: Arc<InMemoryVariables>,
    job_type: String,
    rate: u64,
    shutdown: CancellationToken,
) {
    let period = production_period(rate);
    let mut ticker = tokio::time::interval(period);
    let partition_count = client.partitions().len() as u32;
    let mut created: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // one scope per job so every job carries its own variables
        let scope = created as i64 + 1;
        variables.set(scope, "order", json!(created));
        let partition_id = FIRST_PARTITION_ID + (created % partition_count as u64) as u32;
        let new_job = NewJob::new(job_type.clone(), 3)
            .with_element_instance(scope, scope)
            .with_header("producer", "demo");

        match client.create_job(partition_id, new_job).await {
            Ok(job) => tracing::trace!(job_key = job.key, partition_id, "Created demo job"),
            Err(e) => tracing::warn!(partition_id, error = %e, "Failed to create demo job"),
        }
        created += 1;
    }
}

async fn summarize(
    client: &LocalPartitionClient,
    job_types: &[String],
) -> Result<Vec<PartitionSummaryOutput>, Box<dyn std::error::Error>> {
    let mut summary = Vec::new();
    for partition in client.partitions() {
        let mut activatable = 0;
        for job_type in job_types {
            activatable += partition.activatable_count(job_type).await?;
        }
        summary.push(PartitionSummaryOutput {
            partition_id: partition.partition_id(),
            records: partition.records().await?.len(),
            open_incidents: partition.incidents().await?.len(),
            activatable,
        });
    }
    Ok(summary)
}

async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let job_types: Vec<String> = args
        .job_types
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let mut node = Node::new(args.node.to_config())?;
    let client = node.client();
    let variables = node.variables();

    for job_type in &job_types {
        for _ in 0..args.workers {
            let name = worker_name();
            let handler = Arc::new(DemoHandler {
                worker: name.clone(),
                fail_every: args.fail_every,
                handled: AtomicU64::new(0),
            });
            node.add_worker(name, job_type.clone(), WorkerConfig::default(), handler);
        }
    }

    tracing::info!(
        partitions = args.node.partitions,
        job_types = ?job_types,
        workers_per_type = args.workers,
        "Starting jobflow-lite node"
    );

    let producers = CancellationToken::new();
    let mut tasks = node.start(&shutdown);
    for job_type in &job_types {
        tasks.spawn(produce_jobs(
            client.clone(),
            variables.clone(),
            job_type.clone(),
            args.rate,
            producers.clone(),
        ));
    }

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => shutdown.cancelled().await,
    }
    producers.cancel();

    // partitions are still up unless a signal already stopped them
    if !shutdown.is_cancelled() {
        let summary = summarize(&client, &job_types).await?;
        print_summary(&summary, &args.output)?;
        shutdown.cancel();
    }

    while tasks.join_next().await.is_some() {}
    tracing::info!("jobflow-lite stopped");
    Ok(())
}

fn print_summary(
    summary: &[PartitionSummaryOutput],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Table => {
            println!(
                "{:<10} {:<10} {:<10} ACTIVATABLE",
                "PARTITION", "RECORDS", "INCIDENTS"
            );
            println!("{}", "-".repeat(44));
            for partition in summary {
                println!(
                    "{:<10} {:<10} {:<10} {}",
                    partition.partition_id,
                    partition.records,
                    partition.open_incidents,
                    partition.activatable
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Activate
// =============================================================================

async fn activate_once(args: ActivateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::new(args.node.to_config())?;
    let client = node.client();
    let gateway = node.gateway();
    let shutdown = CancellationToken::new();
    let mut tasks = node.start(&shutdown);

    let partition_count = client.partitions().len() as u32;
    for i in 0..args.jobs {
        let partition_id = FIRST_PARTITION_ID + i % partition_count;
        client
            .create_job(partition_id, NewJob::new(args.job_type.clone(), 3))
            .await?;
    }

    let request = ActivateJobsRequest::new(args.job_type.clone(), worker_name(), args.max_jobs)
        .with_request_timeout(args.request_timeout_ms);
    let mut stream = gateway.activate_jobs(request)?.into_stream();

    let mut activated = Vec::new();
    while let Some(item) = stream.next().await {
        let batch = item?;
        for job in batch.jobs {
            activated.push(ActivatedJobOutput {
                key: job.key,
                partition_id: batch.partition_id,
                job_type: job.job_type,
                worker: job.worker,
                retries: job.retries,
                deadline_ms: job.deadline,
            });
        }
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&activated)?),
        OutputFormat::Table => {
            if activated.is_empty() {
                println!("No jobs activated.");
            } else {
                println!("{:<20} {:<10} {:<20} RETRIES", "JOB KEY", "PARTITION", "WORKER");
                println!("{}", "-".repeat(62));
                for job in &activated {
                    println!(
                        "{:<20} {:<10} {:<20} {}",
                        job.key, job.partition_id, job.worker, job.retries
                    );
                }
                println!();
                println!("Activated {} of {} jobs", activated.len(), args.jobs);
            }
        }
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Run(run_args) => run_node(run_args).await?,
        Commands::Activate(activate_args) => activate_once(activate_args).await?,
    }

    Ok(())
}
