//! Experiment monitor
//!
//! Follows a running optimization experiment and streams dashboard frames to stdout.

use clap::Parser;
use experiment_monitor_lib::config::{GapPolicy, MonitorArgs, PushTransport, ReconnectPolicy};
use experiment_monitor_lib::error::AppError;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "experiment-monitor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "EXPERIMENT_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL serving the history endpoints
    #[arg(long)]
    base_url: Option<String>,

    /// Websocket path of the push channel
    #[arg(long)]
    websocket_path: Option<String>,

    /// Topic carrying live events
    #[arg(long)]
    topic: Option<String>,

    #[arg(long, value_enum)]
    transport: Option<PushTransport>,

    /// Events requested per history page
    #[arg(long)]
    batch_size: Option<u64>,

    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    #[arg(long)]
    history_retry_delay_ms: Option<u64>,

    /// Minimum time between two chart redraws
    #[arg(long)]
    redraw_cooldown_ms: Option<u64>,

    /// Instance charts kept open at once
    #[arg(long)]
    max_charts: Option<usize>,

    #[arg(long, value_enum)]
    gap_policy: Option<GapPolicy>,

    #[arg(long, value_enum)]
    reconnect_policy: Option<ReconnectPolicy>,
}

impl Cli {
    fn overrides(&self) -> MonitorArgs {
        MonitorArgs {
            base_url: self.base_url.clone(),
            websocket_path: self.websocket_path.clone(),
            topic: self.topic.clone(),
            transport: self.transport,
            event_batch_size: self.batch_size,
            reconnect_delay_ms: self.reconnect_delay_ms,
            history_retry_delay_ms: self.history_retry_delay_ms,
            redraw_cooldown_ms: self.redraw_cooldown_ms,
            max_charts: self.max_charts,
            live_channel_capacity: None,
            gap_policy: self.gap_policy,
            reconnect_policy: self.reconnect_policy,
        }
    }
}

fn main() -> Result<(), AppError> {
    init_tracing();

    let cli = Cli::parse();
    let file_args = match &cli.config {
        Some(path) => {
            tracing::info!("loading configuration from {:?}", path);
            MonitorArgs::from_file(path).map_err(|e| {
                tracing::error!("failed to load configuration: {}", e);
                e
            })?
        }
        None => MonitorArgs::default(),
    };
    let args = file_args.merge(cli.overrides());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(experiment_monitor_lib::run(args))
}

/// Logs go to stderr; stdout carries the frame stream.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
