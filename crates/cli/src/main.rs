//! Command-line interface for audio extraction jobs.
//!
//! Runs one job per identifier through the orchestrator with live progress
//! bars, then copies each artifact into the output directory.

use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use orchestrator::{
    decode_line, BatchQueue, CancelReason, JobRegistry, JobState, OrchestratorConfig,
    ProgressEvent, Subscription,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "audiograb")]
#[command(version, about = "Download audio through an extraction executable", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more identifiers
    Fetch {
        /// Identifiers to download
        #[arg(required = true)]
        ids: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// How many downloads run at once
        #[arg(short = 'j', long, default_value = "2")]
        concurrency: usize,

        /// Cancel a download after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print progress events as JSON lines instead of progress bars
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Decode captured executable output and print the events it contains
    Decode {
        /// File to read (standard input when omitted)
        input: Option<PathBuf>,
    },
}

#[derive(Args)]
struct LaunchArgs {
    /// Extraction executable
    #[arg(long, default_value = "python3")]
    program: PathBuf,

    /// Argument placed before each identifier (repeatable)
    #[arg(long = "arg", value_name = "ARG", default_values_t = vec!["scripts/download.py".to_string()])]
    leading_args: Vec<String>,

    /// Working directory for the executable
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Seconds between the termination request and a forced kill
    #[arg(long, default_value = "5")]
    kill_grace: u64,
}

impl LaunchArgs {
    fn into_config(self) -> OrchestratorConfig {
        OrchestratorConfig {
            program: self.program,
            leading_args: self.leading_args,
            working_dir: self.workdir,
            kill_grace: Duration::from_secs(self.kill_grace),
            ..OrchestratorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fetch {
            ids,
            out,
            concurrency,
            timeout,
            json,
            launch,
        } => handle_fetch(ids, out, concurrency, timeout, json, launch.into_config()).await,
        Commands::Decode { input } => handle_decode(input).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn handle_fetch(
    ids: Vec<String>,
    out: PathBuf,
    concurrency: usize,
    timeout: Option<u64>,
    json: bool,
    config: OrchestratorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&out).await?;

    let registry = JobRegistry::new(config);
    let interrupted = install_interrupt_handler(&registry)?;

    let mut queue = BatchQueue::new(registry.clone(), concurrency);
    if let Some(secs) = timeout {
        queue = queue.with_timeout(Duration::from_secs(secs));
    }

    let bars = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>14} [{bar:30.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("=> ");

    let total = ids.len();
    let run = queue.run_with(ids, |job| {
        let sub = job.subscribe();
        if json {
            tokio::spawn(print_events(sub));
        } else {
            let bar = bars.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(job.id().to_string());
            tokio::spawn(follow(sub, bar));
        }
    });

    let entries = tokio::select! {
        entries = run => entries,
        _ = interrupted.notified() => {
            return Err("interrupted".into());
        }
    };

    let mut failed = 0;
    for entry in entries {
        let outcome = match entry.result {
            Ok(_) => save_artifact(&registry, &entry.id, &out).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(path) => println!("\u{2713} {} -> {}", entry.id, path.display()),
            Err(e) => {
                failed += 1;
                eprintln!("\u{2717} {}: {}", entry.id, e);
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} downloads failed", failed, total).into());
    }
    Ok(())
}

/// Cancel everything on the first Ctrl-C; exit immediately on the second.
fn install_interrupt_handler(
    registry: &JobRegistry,
) -> Result<Arc<Notify>, Box<dyn std::error::Error>> {
    let notify = Arc::new(Notify::new());
    let seen = AtomicBool::new(false);

    let registry = registry.clone();
    let waker = Arc::clone(&notify);
    ctrlc::set_handler(move || {
        if seen.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        registry.gate().pause();
        let cancelled = registry.cancel_all(CancelReason::Requested);
        eprintln!("Interrupted, cancelled {} download(s)", cancelled);
        waker.notify_one();
    })?;

    Ok(notify)
}

async fn follow(mut sub: Subscription, bar: ProgressBar) {
    while let Some(event) = sub.recv().await {
        match event {
            ProgressEvent::Progress {
                percentage,
                speed,
                eta_seconds,
                status,
            } => {
                bar.set_position(percentage.round() as u64);
                bar.set_message(progress_message(speed, eta_seconds, status));
            }
            ProgressEvent::Complete { title, .. } => {
                bar.set_position(100);
                bar.finish_with_message(title.unwrap_or_else(|| "done".to_string()));
            }
            ProgressEvent::Error { message } => {
                bar.abandon_with_message(format!("failed: {}", message));
            }
        }
    }

    if sub.closed_state() == Some(JobState::Cancelled) {
        bar.abandon_with_message("cancelled");
    }
}

fn progress_message(speed: Option<String>, eta: Option<u64>, status: Option<String>) -> String {
    if let Some(status) = status {
        return status;
    }
    match (speed, eta) {
        (Some(speed), Some(eta)) => format!("{} eta {}:{:02}", speed, eta / 60, eta % 60),
        (Some(speed), None) => speed,
        (None, Some(eta)) => format!("eta {}:{:02}", eta / 60, eta % 60),
        (None, None) => String::new(),
    }
}

async fn print_events(mut sub: Subscription) {
    let id = sub.job_id().to_string();
    while let Some(event) = sub.recv().await {
        println!("{}", serde_json::json!({ "id": id, "event": event }));
    }
    if let Some(state) = sub.closed_state() {
        println!("{}", serde_json::json!({ "id": id, "state": state }));
    }
}

async fn save_artifact(
    registry: &JobRegistry,
    id: &str,
    out: &Path,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let artifact = registry.fetch_result(id).await?;
    let destination = unique_destination(out, &artifact.display_name);

    let mut file = tokio::fs::File::create(&destination).await?;
    let mut reader = artifact.into_reader();
    tokio::io::copy(&mut reader, &mut file).await?;

    Ok(destination)
}

/// `out/name`, or `out/stem (n).ext` if that already exists.
fn unique_destination(out: &Path, name: &str) -> PathBuf {
    let candidate = out.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    let mut n = 1;
    loop {
        let renamed = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = out.join(renamed);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

async fn handle_decode(input: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin> = match input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let mut lines = BufReader::new(reader).lines();
    let mut number = 0;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        match decode_line(&line) {
            Ok(event) => println!("{}", event.to_line()),
            Err(orchestrator::DecodeError::Empty) => {}
            Err(e) => eprintln!("line {}: {}", number, e),
        }
    }
    Ok(())
}
