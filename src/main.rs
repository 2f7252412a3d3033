use async_trait::async_trait;
use axum::{http::HeaderValue, middleware, routing::get, Router};
use clap::{Args, Parser, Subcommand};
#[cfg(unix)]
use daemonize::Daemonize;
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::{load_config, Config};
use crate::connectivity::{AlwaysOnline, Connectivity, ConnectivityFlag};
use crate::downloader::{HttpByteSource, StreamedDownloader};
use crate::entitlement::{
    EntitlementGate, EntitlementStore, InMemoryEntitlementStore, JsonFileEntitlementStore,
};
use crate::error::PipelineError;
use crate::models::{Identity, VideoFormat};
use crate::pipeline::{DownloadPipeline, DownloadRequest};
use crate::queue::{DownloadQueue, DownloadRunner, QueuedDownload};
use crate::rate_limit::RateLimiter;
use crate::resolver::{build_resolver, human_size};
use crate::retry::RetryExecutor;

// --- Modules ---
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod downloader;
pub mod entitlement;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod retry;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DownloadPipeline>,
    pub download_limiter: Arc<RateLimiter>,
    pub global_limiter: Arc<RateLimiter>,
}

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Video download agent for social media links.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manages the server process.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Prints the metadata and available formats of a video.
    Info { url: String },
    /// Downloads one format of a video to disk.
    Fetch(FetchArgs),
    /// Manages premium flags and shows daily usage.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the server as a background process.
    Start,
    /// Stop the background server process.
    Stop,
    /// Restart the background server process.
    Restart,
    /// Run the server in the foreground.
    Run,
    /// Check the status of the background server process.
    Status,
}

#[derive(Args, Debug)]
struct FetchArgs {
    url: String,
    #[arg(short, long, default_value = "720p")]
    quality: String,
    #[arg(short, long, default_value = "mp4")]
    format: String,
    /// Account charged for the download. Anonymous when omitted.
    #[arg(short, long)]
    user: Option<String>,
    /// Target file. Defaults to the title inside the download directory.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    /// Grant premium to a user.
    Grant { user: String },
    /// Revoke premium from a user.
    Revoke { user: String },
    /// Show today's usage for a user.
    Show { user: String },
}

// --- Main Application Logic ---
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { action } => match action {
            ServerAction::Start => start_server()?,
            ServerAction::Stop => stop_server()?,
            ServerAction::Restart => {
                stop_server()?;
                std::thread::sleep(Duration::from_secs(1));
                start_server()?;
            }
            ServerAction::Run => run_server().await?,
            ServerAction::Status => check_status()?,
        },
        Commands::Info { url } => show_info(&url).await?,
        Commands::Fetch(args) => fetch(args).await?,
        Commands::Account { action } => manage_account(action).await?,
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wires the acquisition pipeline from the config file.
fn build_pipeline(
    config: &Config,
    store: Arc<dyn EntitlementStore>,
    connectivity: Arc<dyn Connectivity>,
) -> anyhow::Result<DownloadPipeline> {
    let resolver = build_resolver(&config.extractor, config.retry.default_retry_after_secs);
    tracing::debug!(backend = resolver.name(), "Resolver selected");
    let client = reqwest::Client::builder().build()?;

    Ok(DownloadPipeline::new(
        resolver,
        RetryExecutor::new(config.retry.policy(), connectivity.clone()),
        EntitlementGate::new(store, Arc::new(SystemClock), config.entitlements.clone()),
        StreamedDownloader::new(Arc::new(HttpByteSource::new(client)), connectivity.clone()),
        connectivity,
        config.download.clone(),
    ))
}

/// Builds the HTTP router. `client_url` restricts CORS to one origin.
pub fn app(state: AppState, client_url: Option<&str>) -> Router {
    let cors = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    let cors = match client_url.and_then(|url| HeaderValue::from_str(url).ok()) {
        Some(origin) => cors.allow_origin(origin),
        None => cors.allow_origin(Any),
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/info", get(handlers::video_info))
        .route("/download", get(handlers::download_url))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::global_rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// --- Server Action Functions ---

/// The core function that runs the Axum web server.
async fn run_server() -> anyhow::Result<()> {
    init_tracing("info");
    let config = load_config().await?;
    let limits = &config.rate_limit;

    // HTTP routes only describe and resolve; quota is enforced by `fetch`,
    // so this store is never charged.
    let pipeline = build_pipeline(
        &config,
        Arc::new(InMemoryEntitlementStore::new()),
        Arc::new(AlwaysOnline),
    )?;
    let state = AppState {
        pipeline: Arc::new(pipeline),
        download_limiter: Arc::new(RateLimiter::new(
            limits.download_max_requests,
            Duration::from_secs(limits.download_window_secs),
            Arc::new(SystemClock),
        )),
        global_limiter: Arc::new(RateLimiter::new(
            limits.global_max_requests,
            Duration::from_secs(limits.global_window_secs),
            Arc::new(SystemClock),
        )),
    };
    let sweep = Duration::from_secs(limits.sweep_interval_secs);
    state.download_limiter.spawn_sweeper(sweep);
    state.global_limiter.spawn_sweeper(sweep);

    let host = env::var("HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = env::var("PORT").unwrap_or_else(|_| config.server.port.to_string());
    let addr = format!("{}:{}", host, port);
    let app = app(state, config.server.client_url.as_deref());

    tracing::info!("Starting server in foreground, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Starts the server as a background process using platform-specific logic.
fn start_server() -> anyhow::Result<()> {
    if is_running()? {
        println!("Server is already running.");
        return Ok(());
    }

    let pid_file = get_pid_path()?;
    let myself = env::current_exe()?;
    println!("Starting server in the background...");

    #[cfg(unix)]
    {
        let daemonize = Daemonize::new().pid_file(&pid_file);
        match daemonize.start() {
            Ok(_) => {
                // Detached child: re-launch ourselves in the foreground mode.
                Command::new(&myself).arg("server").arg("run").spawn()?;
            }
            Err(e) => eprintln!("Error, failed to daemonize: {}", e),
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        let child = Command::new(&myself)
            .arg("server")
            .arg("run")
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()?;
        fs::write(&pid_file, child.id().to_string())?;
    }

    println!("Server started successfully. PID file at: {}", pid_file.display());
    Ok(())
}

/// Stops the background server process.
fn stop_server() -> anyhow::Result<()> {
    let pid_file = get_pid_path()?;
    if !pid_file.exists() {
        println!("Server is not running (no PID file).");
        return Ok(());
    }
    let pid_str = fs::read_to_string(&pid_file)?;
    let pid: u32 = pid_str.trim().parse()?;
    let s = System::new_all();
    if let Some(process) = s.process(Pid::from_u32(pid)) {
        println!("Stopping server process with PID: {}", pid);
        process.kill();
    } else {
        println!("Process with PID {} not found. It may have already stopped.", pid);
    }
    fs::remove_file(&pid_file)?;
    println!("Server stopped.");
    Ok(())
}

/// Checks if the server process is running.
fn check_status() -> anyhow::Result<()> {
    if is_running()? {
        let pid_str = fs::read_to_string(get_pid_path()?)?;
        println!("Server is running with PID: {}", pid_str.trim());
    } else {
        println!("Server is not running.");
    }
    Ok(())
}

// --- Client Commands ---

async fn show_info(url: &str) -> anyhow::Result<()> {
    init_tracing("warn");
    let config = load_config().await?;
    let pipeline = build_pipeline(
        &config,
        Arc::new(InMemoryEntitlementStore::new()),
        Arc::new(AlwaysOnline),
    )?;

    let info = pipeline.video_info(url).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn fetch(args: FetchArgs) -> anyhow::Result<()> {
    init_tracing("warn");
    let config = load_config().await?;

    // Ctrl-C drops connectivity so the in-flight download stops between chunks.
    let connectivity = ConnectivityFlag::default();
    let interrupt = connectivity.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.set_online(false);
        }
    });

    let store = Arc::new(JsonFileEntitlementStore::new(get_ledger_path()?));
    let pipeline = Arc::new(build_pipeline(
        &config,
        store,
        Arc::new(connectivity.clone()),
    )?);
    let identity = Identity::from_option(args.user);

    let info = pipeline.video_info(&args.url).await?;
    let format = info
        .formats
        .iter()
        .find(|f| {
            f.quality.eq_ignore_ascii_case(&args.quality)
                && f.format.eq_ignore_ascii_case(&args.format)
        })
        .cloned()
        .unwrap_or_else(|| {
            tracing::warn!(
                quality = %args.quality,
                format = %args.format,
                "Format not listed for this video, trying anyway"
            );
            VideoFormat::new(args.quality.as_str(), args.format.as_str())
        });
    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&config, info.title.as_deref(), &format));

    let request = DownloadRequest {
        url: info.url.clone(),
        format: Some(format.clone()),
        platform: Some(info.platform),
    };
    let bar = download_bar()?;
    let report = |fraction: f64| track_progress(&bar, fraction);
    let result = pipeline.download(&request, &identity, Some(&report)).await;
    bar.finish_and_clear();

    match result {
        Ok(body) => {
            write_output(&output, &body).await?;
            println!("Saved {} to {}", human_size(body.len() as u64), output.display());
            Ok(())
        }
        Err(err) if err.is_fatal() || !connectivity.is_online() => Err(err.into()),
        Err(err) => {
            eprintln!("{}. Queued for retry.", err);
            let sink = Arc::new(FileSink {
                pipeline,
                output: output.clone(),
                saved: AtomicBool::new(false),
            });
            let queue = Arc::new(DownloadQueue::new(
                sink.clone(),
                Arc::new(SystemClock),
                Arc::new(connectivity.clone()),
                &config.queue,
            ));
            queue
                .add(info.url, format, info.platform, identity)
                .await;
            if let Some(wait) = queue.next_due() {
                eprintln!("Next attempt in {}s.", wait.as_secs().max(1));
            }

            let worker = queue.spawn_worker(Duration::from_secs(config.queue.tick_secs));
            // Ctrl-C holds the queue offline; stop waiting on it.
            while queue.pending() > 0 && connectivity.is_online() {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            worker.abort();

            if sink.saved.load(Ordering::SeqCst) {
                println!("Saved to {}", output.display());
                Ok(())
            } else {
                anyhow::bail!("Download could not be completed after queued retries")
            }
        }
    }
}

async fn manage_account(action: AccountAction) -> anyhow::Result<()> {
    init_tracing("warn");
    let store = JsonFileEntitlementStore::new(get_ledger_path()?);
    match action {
        AccountAction::Grant { user } => {
            store.set_premium(&user, true).await?;
            println!("{} is now premium.", user);
        }
        AccountAction::Revoke { user } => {
            store.set_premium(&user, false).await?;
            println!("{} is no longer premium.", user);
        }
        AccountAction::Show { user } => {
            let stats = store.stats(&user, chrono::Utc::now().date_naive()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

/// Writes queued retries to the same target as the first attempt.
struct FileSink {
    pipeline: Arc<DownloadPipeline>,
    output: PathBuf,
    saved: AtomicBool,
}

#[async_trait]
impl DownloadRunner for FileSink {
    async fn run(&self, item: &QueuedDownload) -> Result<(), PipelineError> {
        let request = DownloadRequest {
            url: item.url.clone(),
            format: Some(item.format.clone()),
            platform: Some(item.platform),
        };
        let body = self.pipeline.download(&request, &item.identity, None).await?;
        write_output(&self.output, &body).await?;
        self.saved.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Per-mille bar; the downloader reports fractions, not byte counts.
fn download_bar() -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% ETA {eta}",
        )?
        .progress_chars("#>-"),
    );
    Ok(bar)
}

fn track_progress(bar: &ProgressBar, fraction: f64) {
    bar.set_position((fraction.clamp(0.0, 1.0) * 1000.0) as u64);
}

async fn write_output(path: &Path, body: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    Ok(())
}

fn default_output_path(config: &Config, title: Option<&str>, format: &VideoFormat) -> PathBuf {
    let stem: String = title
        .unwrap_or("video")
        .chars()
        .map(|c| if c.is_alphanumeric() || " -_".contains(c) { c } else { '_' })
        .collect();
    let stem = stem.trim();
    let stem = if stem.is_empty() { "video" } else { stem };
    Path::new(&config.download_directory).join(format!(
        "{} [{}].{}",
        stem,
        format.quality,
        format.format.to_lowercase()
    ))
}

// --- Helper Functions ---

fn data_dir() -> anyhow::Result<PathBuf> {
    let project_dirs = config::project_dirs()?;
    let data_dir = project_dirs.data_local_dir();
    fs::create_dir_all(data_dir)?;
    Ok(data_dir.to_path_buf())
}

/// Gets the path for the server's PID file.
fn get_pid_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("server.pid"))
}

/// Per-user premium flags and daily counts used by `fetch`.
fn get_ledger_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("entitlements.json"))
}

/// Checks if the server is running by checking the PID file and the process list.
fn is_running() -> anyhow::Result<bool> {
    let pid_file = get_pid_path()?;
    if !pid_file.exists() {
        return Ok(false);
    }
    let pid_str = fs::read_to_string(pid_file)?;
    let pid: u32 = pid_str.trim().parse()?;
    let s = System::new_all();
    Ok(s.process(Pid::from_u32(pid)).is_some())
}
