use std::{path::PathBuf, sync::Arc};

use accelq::{
    child::{run_child, ChildInvocation},
    history::memory::InMemoryHistory,
    prelude::*,
};
use accelq_sqlx::PgHistory;
use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod routines;
mod settings;

use settings::{LoggingSettings, Settings};

const PROMPTS: [&str; 4] = [
    "a lighthouse at dusk",
    "a fox in the snow",
    "neon city skyline",
    "a bowl of ramen",
];

#[derive(Debug, Parser)]
#[command(name = "accelq-demo", version, about = "Run image jobs through an accelq coordinator")]
struct Cli {
    /// Settings file, `accelq.toml` in the working directory is used when present.
    #[arg(long, short, global = true, env = "ACCELQ_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a coordinator, submit some jobs and wait for them.
    Serve {
        #[arg(long, default_value_t = 4)]
        jobs: usize,
        #[arg(long)]
        owner: Option<OwnerId>,
        /// Also edit the first generated image.
        #[arg(long)]
        edit: bool,
    },
    /// Run a single job in this process. Used by the isolated execution mode.
    Worker {
        #[arg(long)]
        job_type: String,
        #[arg(long)]
        request_file: PathBuf,
        #[arg(long)]
        response_file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.logging);

    match cli.command {
        Command::Worker {
            job_type,
            request_file,
            response_file,
        } => {
            let registry = routines::registry(&settings.output_dir);
            let invocation = ChildInvocation::new(job_type, request_file, response_file);
            std::process::exit(run_child(&registry, &invocation));
        }
        Command::Serve { jobs, owner, edit } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(serve(settings, cli.config, jobs, owner, edit)),
    }
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| logging.level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    // stdout of the serve command is reserved for results
    if logging.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn serve(
    settings: Settings,
    config_path: Option<PathBuf>,
    jobs: usize,
    owner: Option<OwnerId>,
    edit: bool,
) -> anyhow::Result<()> {
    let mut config = settings.coordinator.clone();
    if config.execution_mode == ExecutionMode::Isolated
        && config.isolated.program.is_none()
        && config.isolated.args.is_empty()
    {
        config.isolated.args = worker_args(config_path);
    }
    let sync_timeout = config.sync_timeout();

    let coordinator = Coordinator::from_config(config)?;
    let coordinator = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(settings.database_max_connections)
                .connect(url)
                .await
                .context("Failed to connect to the history database")?;
            let history = PgHistory::from(pool);
            history.run_migrations().await?;
            coordinator.with_history(history)
        }
        None => coordinator.with_history(InMemoryHistory::new()),
    };
    let coordinator = Arc::new(coordinator);
    coordinator.start().await;

    let registry = routines::registry(&settings.output_dir);
    let run = run_jobs(&coordinator, &registry, jobs, owner, edit, sync_timeout);
    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted, shutting down"),
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&coordinator.get_queue_info(owner))?
    );
    coordinator.stop().await?;
    Ok(())
}

/// Arguments which make the child process re-enter this binary as a worker.
fn worker_args(config_path: Option<PathBuf>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".to_owned());
        args.push(path.to_string_lossy().into_owned());
    }
    args.push("worker".to_owned());
    args
}

async fn run_jobs(
    coordinator: &Coordinator,
    registry: &RoutineRegistry,
    jobs: usize,
    owner: Option<OwnerId>,
    edit: bool,
    timeout: std::time::Duration,
) -> anyhow::Result<()> {
    let text_to_image = registry
        .get("text_to_image")
        .context("text_to_image is not registered")?;

    let mut job_ids = Vec::with_capacity(jobs);
    for (index, prompt) in PROMPTS.iter().cycle().take(jobs).enumerate() {
        let mut metadata = JobMetadata::new("text_to_image")
            .with_prompt(*prompt)
            .with_parameters(serde_json::json!({ "seed": index }));
        if let Some(owner) = owner {
            metadata = metadata.with_owner(owner);
        }
        let arguments = Arguments::new()
            .with_kwarg("prompt", *prompt)
            .with_kwarg("width", 128)
            .with_kwarg("height", 96);
        job_ids.push(
            coordinator
                .submit(text_to_image.clone(), arguments, metadata)
                .await?,
        );
    }

    let mut first_image = None;
    for job_id in job_ids {
        let Some(record) = coordinator.get_result(job_id, Some(timeout)).await else {
            tracing::warn!(%job_id, "Job {job_id} disappeared before finishing");
            continue;
        };
        report(&record);
        if first_image.is_none() {
            first_image = record.result.map(|result| result.result_location);
        }
    }

    if edit {
        let source = first_image.context("No image was generated to edit")?;
        let image_edit = registry
            .get("image_edit")
            .context("image_edit is not registered")?;
        let job_id = coordinator
            .submit(
                image_edit,
                Arguments::new().with_kwarg("source", source),
                JobMetadata::new("image_edit").with_prompt("invert the colours"),
            )
            .await?;
        if let Some(record) = coordinator.get_result(job_id, Some(timeout)).await {
            report(&record);
        }
    }
    Ok(())
}

fn report(record: &JobRecord) {
    let outcome = match (&record.result, &record.error) {
        (Some(result), _) => result.result_location.clone(),
        (None, Some(error)) => error.clone(),
        (None, None) => String::new(),
    };
    let seconds = record
        .execution_time()
        .map(|time| time.num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    println!(
        "{} {:<9} {:>6.2}s {}",
        record.id,
        record.status.as_str(),
        seconds,
        outcome
    );
}
