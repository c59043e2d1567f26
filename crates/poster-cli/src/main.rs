use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use poster_contracts::events::EventWriter;
use poster_contracts::options::{AspectRatio, GenerationRequest, OutputFormat, Resolution};
use poster_contracts::runs::history::GenerationHistory;
use poster_contracts::runs::registry::{TaskRegistry, TaskStatus};
use poster_engine::config::{
    duration_from_secs_f64, API_BASE_ENV, API_KEY_ENV, DEFAULT_OUTPUT_DIR, MODEL_ENV,
};
use poster_engine::{
    spawn_generation, CancelToken, ClientConfig, GeneratedImage, ImageGenerator, JobError, JobId,
    NoProgress, OutputTarget, ProgressObserver, ProgressUpdate, WaitOptions,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_INTERRUPTED: i32 = 130;
const PROGRESS_BAR_WIDTH: usize = 30;

#[derive(Debug, Parser)]
#[command(name = "poster-gen", version, about = "Literacy poster image generation client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create one job, wait for it and download the image.
    Generate(GenerateArgs),
    /// Print the current state of an existing job.
    Status(StatusArgs),
    /// Run one job per prompt file concurrently.
    Batch(BatchArgs),
    /// List recent successful generations.
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct ApiArgs {
    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = API_BASE_ENV)]
    api_base: Option<String>,
    #[arg(long, env = MODEL_ENV)]
    model: Option<String>,
    /// Seconds allowed for a single HTTP round-trip.
    #[arg(long, default_value_t = 30.0)]
    request_timeout: f64,
}

#[derive(Debug, Args)]
struct JobArgs {
    #[arg(long, default_value = "3:4")]
    ratio: AspectRatio,
    #[arg(long, default_value = "2K")]
    resolution: Resolution,
    #[arg(long, default_value = "png")]
    format: OutputFormat,
    /// Reference image URL; repeat for several.
    #[arg(long = "image-input")]
    image_input: Vec<String>,
    #[arg(long)]
    callback_url: Option<String>,
    /// Seconds to wait for the job before giving up.
    #[arg(long, default_value_t = 300.0)]
    timeout: f64,
    /// Seconds between status checks.
    #[arg(long, default_value_t = 3.0)]
    poll_interval: f64,
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,
    /// Append lifecycle events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
    prompt: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// Exact destination; defaults to generated_<timestamp>.<ext> in the output dir.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    no_progress: bool,
    #[command(flatten)]
    api: ApiArgs,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    task_id: String,
    #[command(flatten)]
    api: ApiArgs,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long = "prompt-file", required = true)]
    prompt_files: Vec<PathBuf>,
    #[command(flatten)]
    api: ApiArgs,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("poster-gen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Status(args) => run_status(args),
        Command::Batch(args) => run_batch(args),
        Command::History(args) => run_history(args),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "poster_engine=info,poster_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let prompt = read_prompt(args.prompt.as_deref(), args.prompt_file.as_deref())?;
    let request = build_request(prompt, &args.job);
    let generator = build_generator(&args.api, &args.job)?;
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let target = OutputTarget {
        path: args.out.clone(),
        label: None,
    }
    .labelled(args.label.clone());
    let mut terminal;
    let mut silent = NoProgress;
    let observer: &mut dyn ProgressObserver = if args.no_progress || !io::stderr().is_terminal() {
        &mut silent
    } else {
        terminal = TerminalProgress::default();
        &mut terminal
    };

    match generator.generate(&request, &target, observer, &cancel) {
        Ok(image) => {
            print_generated(&image);
            Ok(0)
        }
        Err(err) => finish_with_error(err),
    }
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let generator = ImageGenerator::from_config(client_config(&args.api)?, DEFAULT_OUTPUT_DIR)?;
    let Some(job_id) = JobId::new(args.task_id.as_str()) else {
        bail!("--task-id must not be empty");
    };
    let status = generator.query_status(&job_id)?;
    let record = status.record().cloned().unwrap_or_default();
    let urls = record
        .decode_result()
        .ok()
        .flatten()
        .map(|payload| payload.result_urls)
        .unwrap_or_default();
    let summary = json!({
        "task_id": job_id.as_str(),
        "code": status.envelope.code,
        "msg": status.envelope.message(),
        "state": record.state.as_str(),
        "fail_code": record.fail_code,
        "fail_msg": record.fail_msg,
        "result_urls": urls,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(0)
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let generator = Arc::new(build_generator(&args.api, &args.job)?);
    let registry = TaskRegistry::default();
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let mut workers = Vec::with_capacity(args.prompt_files.len());
    for (index, prompt_file) in args.prompt_files.iter().enumerate() {
        let prompt = read_prompt(None, Some(prompt_file))?;
        let label = label_for(prompt_file);
        let task_key = format!("{:02}-{label}", index + 1);
        let handle = spawn_generation(
            generator.clone(),
            registry.clone(),
            task_key.clone(),
            build_request(prompt, &args.job),
            OutputTarget::default().labelled(Some(label)),
            cancel.clone(),
        )
        .with_context(|| format!("failed to start worker for {}", prompt_file.display()))?;
        tracing::info!(
            task_key = %task_key,
            prompt_file = %prompt_file.display(),
            "worker started"
        );
        workers.push(handle);
    }

    let mut interrupted = false;
    let mut failed = false;
    for handle in workers {
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                interrupted |= matches!(err, JobError::Interrupted { .. });
                failed = true;
            }
            Err(_) => failed = true,
        }
    }

    for record in registry.snapshot() {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(batch_exit_code(interrupted, failed, &registry))
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let history = GenerationHistory::in_output_dir(&args.output_dir);
    let entries = history.recent(args.limit);
    if entries.is_empty() {
        println!("No generations recorded in {}", history.path().display());
        return Ok(0);
    }
    for entry in entries {
        println!(
            "{}  {}  {} {} {}  {}{}",
            entry.timestamp,
            entry.job_id,
            entry.aspect_ratio,
            entry.resolution,
            entry.output_format,
            entry.output_path,
            entry
                .label
                .map(|label| format!("  [{label}]"))
                .unwrap_or_default(),
        );
    }
    Ok(0)
}

fn client_config(api: &ApiArgs) -> Result<ClientConfig> {
    let Some(api_key) = api
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    else {
        bail!("{API_KEY_ENV} not set (use --api-key or a .env file)");
    };
    let mut config = ClientConfig::new(api_key);
    if let Some(api_base) = api.api_base.as_deref() {
        config = config.with_api_base(api_base);
    }
    if let Some(model) = api
        .model
        .as_deref()
        .map(str::trim)
        .filter(|model| !model.is_empty())
    {
        config.model = model.to_string();
    }
    if api.request_timeout > 0.0 {
        config.request_timeout =
            duration_from_secs_f64("--request-timeout", api.request_timeout)?;
    }
    Ok(config)
}

fn build_generator(api: &ApiArgs, job: &JobArgs) -> Result<ImageGenerator> {
    let config = client_config(api)?;
    tracing::debug!(config = ?config, "client configured");
    let mut generator = ImageGenerator::from_config(config, &job.output_dir)?
        .with_wait_options(wait_options(job)?)
        .with_history(GenerationHistory::in_output_dir(&job.output_dir));
    if let Some(events_path) = &job.events {
        let session_id = uuid::Uuid::new_v4().to_string();
        generator = generator.with_events(EventWriter::new(events_path, session_id));
    }
    Ok(generator)
}

fn wait_options(job: &JobArgs) -> Result<WaitOptions> {
    WaitOptions::try_from_secs_f64(job.timeout, job.poll_interval)
        .context("invalid --timeout or --poll-interval")
}

fn build_request(prompt: String, job: &JobArgs) -> GenerationRequest {
    GenerationRequest::new(prompt)
        .with_aspect_ratio(job.ratio)
        .with_resolution(job.resolution)
        .with_output_format(job.format)
        .with_image_input(job.image_input.clone())
        .with_callback_url(job.callback_url.clone())
}

fn read_prompt(prompt: Option<&str>, prompt_file: Option<&Path>) -> Result<String> {
    let text = match (prompt, prompt_file) {
        (Some(prompt), _) => prompt.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))?,
        (None, None) => bail!("either --prompt or --prompt-file is required"),
    };
    let text = text.trim();
    if text.is_empty() {
        bail!("prompt is empty");
    }
    Ok(text.to_string())
}

fn label_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "prompt".to_string())
}

fn finish_with_error(err: JobError) -> Result<i32> {
    match err {
        JobError::Interrupted { job_id } => {
            eprintln!("interrupted; job {job_id} may still finish on the server");
            Ok(EXIT_INTERRUPTED)
        }
        other => Err(other.into()),
    }
}

fn batch_exit_code(interrupted: bool, failed: bool, registry: &TaskRegistry) -> i32 {
    let any_error = registry
        .snapshot()
        .iter()
        .any(|record| matches!(record.status, TaskStatus::Error { .. }));
    if interrupted {
        EXIT_INTERRUPTED
    } else if failed || any_error {
        1
    } else {
        0
    }
}

fn print_generated(image: &GeneratedImage) {
    println!("Saved {}", image.path.display());
    println!("  job:     {}", image.job_id);
    println!("  bytes:   {}", image.bytes);
    println!("  sha256:  {}", image.sha256);
    if let Some((width, height)) = image.dimensions {
        println!("  size:    {width}x{height}");
    }
    println!(
        "  polls:   {} in {:.1}s",
        image.polls,
        image.elapsed.as_secs_f64()
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    StopWaiting,
    Exit,
}

/// The first Ctrl-C stops the wait cooperatively; a second one ends the
/// process, which also aborts a download that is already streaming.
fn interrupt_action(presses: u32) -> InterruptAction {
    if presses <= 1 {
        InterruptAction::StopWaiting
    } else {
        InterruptAction::Exit
    }
}

fn install_interrupt_handler(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("poster-gen-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!(error = %err, "Ctrl-C handler unavailable");
                    return;
                }
            };
            let mut presses = 0;
            while runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                presses += 1;
                match interrupt_action(presses) {
                    InterruptAction::StopWaiting => {
                        tracing::info!("received Ctrl-C, stopping the wait (press again to exit)");
                        cancel.cancel();
                    }
                    InterruptAction::Exit => {
                        eprintln!("interrupted again, exiting");
                        std::process::exit(EXIT_INTERRUPTED);
                    }
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "Ctrl-C handler thread spawn failed");
    }
}

#[derive(Debug, Default)]
struct TerminalProgress {
    drawn: bool,
}

impl ProgressObserver for TerminalProgress {
    fn on_poll(&mut self, update: &ProgressUpdate<'_>) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r{}", render_progress(update.percent, update.state.as_str()));
        let _ = stderr.flush();
        self.drawn = true;
    }

    fn close(&mut self) {
        if self.drawn {
            eprintln!();
            self.drawn = false;
        }
    }
}

fn render_progress(percent: u8, state: &str) -> String {
    let filled = PROGRESS_BAR_WIDTH * usize::from(percent.min(100)) / 100;
    format!(
        "[{}{}] {percent:>3}% {state:<12}",
        "#".repeat(filled),
        "-".repeat(PROGRESS_BAR_WIDTH - filled)
    )
}
