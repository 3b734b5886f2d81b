use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::backend::OnnxBackend;
use upscaler_core::codec::{self, OutputFormat};
use upscaler_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use upscaler_core::events::{UpscaleEvent, UpscaleEventObserver};
use upscaler_core::logging::{self, FileSink, LogMode, LoggingOptions, PanicHookStatus};
use upscaler_core::model_registry::ModelRegistry;
use upscaler_core::server::{app_router, app_state_with_config};
use upscaler_core::{UpscaleOrchestrator, UpscaleRequest};

#[derive(Parser)]
#[command(name = "upscaler", about = "Tiled AI image upscaler with device and model fallback")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml, models and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (the default when no subcommand is given)
    Serve(ServeArgs),
    /// Upscale a single image file
    Upscale(UpscaleArgs),
    /// Inspect or fetch catalog models
    Models {
        #[command(subcommand)]
        action: ModelsCommand,
    },
}

#[derive(Args, Default, Clone)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image (JPEG, PNG, WebP, TIFF or BMP)")]
    input: PathBuf,

    #[arg(short = 'o', long, help = "Output path; the extension picks the format")]
    output: PathBuf,

    #[arg(
        long = "model",
        value_name = "NAME",
        help = "Model to use; repeat to list fallbacks in order"
    )]
    models: Vec<String>,

    #[arg(
        long = "device",
        value_name = "DEVICE",
        value_delimiter = ',',
        help = "Device chain, e.g. --device cuda:0,cpu"
    )]
    devices: Vec<String>,

    #[arg(long)]
    tile_size: Option<u32>,

    #[arg(long)]
    tile_overlap: Option<u32>,

    #[arg(long = "max-size", help = "Images up to this size per side run as one tile")]
    max_size: Option<u32>,

    #[arg(long, help = "JPEG quality (1-100)")]
    quality: Option<u8>,

    #[arg(long, help = "Output format, overriding the output extension")]
    format: Option<OutputFormat>,
}

#[derive(Subcommand)]
enum ModelsCommand {
    /// List catalog and discovered models
    List,
    /// Download a catalog model into the models directory
    Download { name: String },
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match &cli.command {
        None | Some(Commands::Serve(_)) => LogMode::Server,
        Some(_) => LogMode::Cli,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = upscaler_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    upscaler_core::runtime::log_runtime_lib_status(&runtime_report);
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        None => run_server(cli.serve, resolved_data_dir).await,
        Some(Commands::Serve(args)) => run_server(args, resolved_data_dir).await,
        Some(Commands::Upscale(args)) => run_upscale(args, resolved_data_dir).await,
        Some(Commands::Models { action }) => run_models(action, resolved_data_dir).await,
    }
}

fn logging_options(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    rust_log_env: Option<String>,
) -> LoggingOptions {
    LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env,
        ..Default::default()
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);

    let options = logging_options(
        data_dir,
        verbose,
        cli_log_filter,
        std::env::var("RUST_LOG").ok(),
    );
    let filters = logging::compose_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter(&filters.console, "console"));

    let file_sink = logging::open_file_sink(&options);
    let disabled_reason = match file_sink {
        FileSink::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::RedactingMakeWriter::new(appender))
                .with_filter(parse_env_filter(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            None
        }
        FileSink::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = disabled_reason {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookStatus::Disabled { reason } = panic_hook {
        warn!(reason = %reason, "Crash report hook unavailable; panics will not be persisted");
    }
}

fn parse_env_filter(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{}'.",
            logging::DEFAULT_LOG_FILTER
        );
        tracing_subscriber::EnvFilter::new(logging::DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: LogMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Loads `<data_dir>/config.toml`, falling back to defaults, with relative
/// paths resolved against the data directory.
fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.resolve_paths(data_dir);
    config
}

async fn run_server(args: ServeArgs, data_dir: PathBuf) -> Result<()> {
    let mut config = load_config(&data_dir);
    if let Some(port) = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
    {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = app_state_with_config(config)?;
    let shutdown = state.shutdown_token();
    let app = app_router(state);

    info!(%addr, "Starting upscaler server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum_serve(listener, app, shutdown).await
}

async fn axum_serve(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown requested; cancelling in-flight upscales");
            shutdown.cancel();
        })
        .await
        .context("server terminated with an error")
}

fn apply_upscale_overrides(config: &mut AppConfig, args: &UpscaleArgs) -> Result<()> {
    if let Some((primary, fallbacks)) = args.models.split_first() {
        config.upscaler.model = primary.clone();
        if !fallbacks.is_empty() {
            config.upscaler.fallback_models = fallbacks.to_vec();
        }
    }
    if !args.devices.is_empty() {
        config.upscaler.devices = args.devices.clone();
    }
    if let Some(tile_size) = args.tile_size {
        config.upscaler.tile_size = tile_size;
    }
    if let Some(overlap) = args.tile_overlap {
        config.upscaler.tile_overlap = overlap;
    }
    if let Some(max_size) = args.max_size {
        config.upscaler.max_image_size = max_size;
    }
    if let Some(quality) = args.quality {
        if !(1..=100).contains(&quality) {
            bail!("--quality must be between 1 and 100, got {quality}");
        }
        config.output.quality = quality;
    }

    let from_extension = args
        .output
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(OutputFormat::from_extension);
    config.output.format = match (args.format, from_extension) {
        (Some(format), _) | (None, Some(format)) => format,
        (None, None) => config.output.format,
    };
    Ok(())
}

/// Prints `Tiles done/total` to stderr as tiles complete.
fn progress_observer() -> Arc<UpscaleEventObserver> {
    let total = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    Arc::new(move |event: &UpscaleEvent| match event {
        UpscaleEvent::Planned { tiles, .. } => total.store(*tiles, Ordering::Relaxed),
        UpscaleEvent::TileCompleted { .. } => {
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            eprint!("\r{}", progress_line(finished, total.load(Ordering::Relaxed)));
        }
        UpscaleEvent::Finished { .. } => eprintln!(),
        _ => {}
    })
}

fn progress_line(done: usize, total: usize) -> String {
    const WIDTH: usize = 30;
    let fraction = if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    };
    let filled = (fraction * WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:5.1}% | Tile {done}/{total}",
        "█".repeat(filled),
        "░".repeat(WIDTH - filled),
        fraction * 100.0
    )
}

async fn run_upscale(args: UpscaleArgs, data_dir: PathBuf) -> Result<()> {
    let mut config = load_config(&data_dir);
    apply_upscale_overrides(&mut config, &args)?;
    let upscale_config = config.upscale_config()?;

    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }
    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let source = tokio::task::spawn_blocking(move || codec::decode(&bytes))
        .await
        .context("decode task failed")?
        .with_context(|| format!("failed to decode {}", args.input.display()))?;
    info!(
        input = %args.input.display(),
        width = source.width(),
        height = source.height(),
        "Loaded input image"
    );

    let registry = Arc::new(ModelRegistry::load(config.paths.models_dir.clone()));
    let backend = Arc::new(OnnxBackend::new(
        registry,
        config.paths.trt_cache_dir.clone(),
    ));

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let started = Instant::now();
    let result = UpscaleOrchestrator::new(backend)
        .with_cancellation(cancel)
        .with_observer(progress_observer())
        .run(UpscaleRequest {
            source,
            config: upscale_config.clone(),
        })
        .await
        .context("upscale failed")?;

    let format = upscale_config.output_format;
    let quality = upscale_config.output_quality;
    let image = result.image;
    let encoded = tokio::task::spawn_blocking(move || codec::encode(&image, format, quality))
        .await
        .context("encode task failed")??;
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&args.output, &encoded)
        .await
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    info!(
        output = %args.output.display(),
        model = %result.model_used,
        device = %result.device_used,
        tiles = result.tiles_processed,
        scale = result.scale_factor,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upscale complete"
    );
    Ok(())
}

async fn run_models(action: ModelsCommand, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let registry = ModelRegistry::load(config.paths.models_dir.clone());

    match action {
        ModelsCommand::List => {
            println!("{}", format_model_table(&registry));
            Ok(())
        }
        ModelsCommand::Download { name } => {
            let path = tokio::task::spawn_blocking(move || registry.download(&name))
                .await
                .context("download task failed")??;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn format_model_table(registry: &ModelRegistry) -> String {
    let mut lines = vec![format!(
        "{:<40} {:>5} {:>10}  {}",
        "NAME", "SCALE", "DOWNLOADED", "DESCRIPTION"
    )];
    for entry in registry.list() {
        let scale = entry
            .scale
            .map(|s| format!("x{s}"))
            .unwrap_or_else(|| "?".to_string());
        let downloaded = if registry.is_downloaded(&entry.name) {
            "yes"
        } else {
            "no"
        };
        lines.push(format!(
            "{:<40} {:>5} {:>10}  {}",
            entry.name, scale, downloaded, entry.description
        ));
    }
    lines.join("\n")
}
