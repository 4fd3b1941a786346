use anyhow::Result;
use clap::Parser;
use pagecast::{
    PagecastConfig, StrategyPreference, StreamingOrchestrator, SyntheticProvider, SyntheticSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "pagecast")]
#[command(about = "Adaptive frame-rate viewport streaming")]
#[command(version)]
#[command(long_about = "Streams frames from a capture source to a remote consumer over a \
WebSocket connection. Uses source-driven push capture when available and otherwise a \
self-paced poll loop whose frame rate adapts to how long captures take.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pagecast.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without streaming")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Consumer address override
    #[arg(long, value_name = "URL")]
    address: Option<String>,

    /// Capture strategy override (auto, push, poll)
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<String>,

    /// Target frames per second override
    #[arg(long)]
    fps: Option<u32>,

    /// Session id; generated when omitted
    #[arg(long)]
    session_id: Option<String>,

    /// Test pattern width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Test pattern height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Artificial delay added to each capture
    #[arg(long, default_value_t = 0)]
    capture_delay_ms: u64,

    /// Let the test source emit frames on its own
    #[arg(long)]
    screencast: bool,

    /// Switch to a new test source every N seconds
    #[arg(long, value_name = "SECONDS")]
    navigate_every: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting Pagecast v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match PagecastConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    apply_overrides(&mut config, &args)?;

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let orchestrator = StreamingOrchestrator::new(config.clone()).map_err(|e| {
        error!("Failed to create orchestrator: {}", e);
        e
    })?;

    let pattern = TestPattern::from_args(&args);
    let provider = Arc::new(SyntheticProvider::new(pattern.source(0)));
    let handle = orchestrator
        .start(args.session_id.clone(), config.stream.clone(), provider.clone())
        .await
        .map_err(|e| {
            error!("Failed to start streaming session: {}", e);
            e
        })?;
    info!(
        "Session {} streaming to {}",
        handle.session_id(),
        config.connection.session_address(handle.session_id())
    );

    let navigation = args.navigate_every.filter(|secs| *secs > 0).map(|secs| {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            for page in 1.. {
                ticker.tick().await;
                info!("Navigating test source to page-{}", page);
                provider.navigate(pattern.source(page));
            }
        })
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut housekeeping = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
            _ = housekeeping.tick() => {
                let finished = orchestrator.cleanup_finished().await;
                if !finished.is_empty() && orchestrator.active_sessions().is_empty() {
                    warn!("All streaming sessions ended");
                    break;
                }
                if let Ok(settings) = orchestrator.get_settings(&handle) {
                    debug!(
                        "Session {}: {} frames, {} fps (target {})",
                        settings.session_id,
                        settings.frame_count,
                        settings.effective_fps,
                        settings.target_fps
                    );
                }
            }
        }
    }

    if let Some(navigation) = navigation {
        navigation.abort();
    }
    orchestrator.stop_all().await;
    provider.close();

    info!("Pagecast stopped");
    Ok(())
}

/// Shape of the synthetic source the binary streams from
#[derive(Debug, Clone, Copy)]
struct TestPattern {
    width: u32,
    height: u32,
    capture_delay: Duration,
    screencast: bool,
}

impl TestPattern {
    fn from_args(args: &Args) -> Self {
        Self {
            width: args.width,
            height: args.height,
            capture_delay: Duration::from_millis(args.capture_delay_ms),
            screencast: args.screencast,
        }
    }

    fn source(&self, page: u64) -> SyntheticSource {
        SyntheticSource::new(format!("page-{}", page), self.width, self.height)
            .with_capture_delay(self.capture_delay)
            .with_screencast(self.screencast)
    }
}

fn apply_overrides(config: &mut PagecastConfig, args: &Args) -> Result<()> {
    if let Some(address) = &args.address {
        config.connection.address = address.clone();
    }
    if let Some(fps) = args.fps {
        config.stream.target_fps = fps;
    }
    if let Some(strategy) = args.strategy.as_deref() {
        config.stream.strategy = match strategy {
            "auto" => StrategyPreference::Auto,
            "push" => StrategyPreference::Push,
            "poll" => StrategyPreference::Poll,
            other => anyhow::bail!("Unknown strategy '{}', expected auto, push, or poll", other),
        };
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
    };

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pagecast={}", log_level)));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };
    layers.push(console);

    let guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pagecast.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Pagecast Configuration File");
    println!("# Every value below is the built-in default.");
    println!("# Environment variables override it, e.g. PAGECAST_STREAM__TARGET_FPS=10");
    println!();

    let config = PagecastConfig::default();
    println!("{}", toml::to_string_pretty(&config)?);
    println!("# [controller]");
    println!("# min_fps = 2.0");
    println!("# max_fps = 30.0");
    println!("# target_utilization = 0.7");
    println!("# smoothing = 0.25");
    println!("# adjustment_interval = 3");
    println!("# increase_threshold = 0.6");
    println!("# decrease_threshold = 1.15");
    Ok(())
}
