//! Channel manager service
//!
//! Loads the configuration, registers the simulated driver, opens the
//! configured channels, logs their events and runs until a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chanmgr::config::ChannelSpec;
use chanmgr::drivers::SimulatedDriver;
use chanmgr::types::{Sampling, Value};
use chanmgr::{
    ChannelDriver, ChannelEvent, ChannelEventListener, ChannelManager, ChannelManagerConfig,
};
use common::config_loader::{get_config_value, get_string_config};
use common::logging::LogConfig;

/// Default step of the simulated random walk
const DEFAULT_SIM_INTERVAL_MS: u64 = 1000;

/// Command-line arguments for chanmgr
#[derive(Parser, Clone)]
#[command(
    name = "chanmgr",
    version = env!("CARGO_PKG_VERSION"),
    about = "Channel manager for field-protocol drivers",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "CHANMGR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter spec (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Simulation step in milliseconds (env CHANMGR_SIM_INTERVAL_MS)
    #[arg(long)]
    sim_interval_ms: Option<u64>,

    /// Validation mode - only validate configuration and exit
    #[arg(long)]
    validate: bool,
}

/// Logs every value or quality change
struct EventLogger;

impl ChannelEventListener for EventLogger {
    fn channel_event(&self, event: &ChannelEvent) {
        match &event.value.value {
            Some(value) => info!(
                "Ch {} {:?}: {} ({:?})",
                event.locator, event.event_type, value, event.value.quality
            ),
            None => info!(
                "Ch {} {:?}: no value ({:?})",
                event.locator, event.event_type, event.value.quality
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ChannelManagerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    common::logging::init_with_config(LogConfig {
        service_name: "chanmgr".to_string(),
        level: log_filter(args.log_level.clone(), &config),
        enable_json: args.json_logs,
        ansi: !args.no_color,
    })
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    if args.validate {
        info!(
            "Configuration valid: {} channels, {:?} readers",
            config.channels.len(),
            config.reader_factory
        );
        return Ok(());
    }

    let manager = Arc::new(ChannelManager::new(&config));
    let sim = Arc::new(SimulatedDriver::new("sim"));
    manager.add_driver(sim.clone())?;

    let opened = open_channels(&manager, &sim, &config.channels).await;
    info!("Opened {} of {} configured channels", opened.len(), config.channels.len());

    let shutdown = common::shutdown_token();
    let interval = sim_interval(args.sim_interval_ms);
    let simulation = tokio::spawn(simulate(sim.clone(), opened, interval, shutdown.clone()));
    #[cfg(unix)]
    tokio::spawn(reload_log_level_on_hangup(args.clone(), shutdown.clone()));

    shutdown.cancelled().await;
    if let Err(e) = simulation.await {
        warn!("Simulation task failed: {}", e);
    }
    manager.shutdown().await;
    Ok(())
}

/// Filter spec from the command line, then `CHANMGR_LOG_LEVEL`, then the
/// config file. `RUST_LOG` overrides all three.
fn log_filter(explicit: Option<String>, config: &ChannelManagerConfig) -> String {
    let level = get_string_config(explicit, "CHANMGR_LOG_LEVEL", config.logging.level.clone());
    common::logging::filter_spec(&LogConfig {
        level,
        ..Default::default()
    })
}

fn sim_interval(explicit: Option<u64>) -> Duration {
    let ms = get_config_value(explicit, "CHANMGR_SIM_INTERVAL_MS", DEFAULT_SIM_INTERVAL_MS);
    Duration::from_millis(ms.max(1))
}

/// Re-read the configuration on SIGHUP and apply its log level.
#[cfg(unix)]
async fn reload_log_level_on_hangup(args: Args, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("SIGHUP handler unavailable, log level is fixed: {}", e);
            return;
        },
    };
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => if received.is_none() { break },
        }
        let config = match ChannelManagerConfig::load(args.config.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("Reload skipped, configuration invalid: {}", e);
                continue;
            },
        };
        let filter = log_filter(args.log_level.clone(), &config);
        if filter == common::logging::get_log_level() {
            debug!("Log level unchanged: {}", filter);
            continue;
        }
        if let Err(e) = common::logging::set_log_level(&filter) {
            warn!("Log level reload failed: {}", e);
        }
    }
}

async fn open_channels(
    manager: &ChannelManager,
    sim: &SimulatedDriver,
    specs: &[ChannelSpec],
) -> Vec<ChannelSpec> {
    let logger: Arc<dyn ChannelEventListener> = Arc::new(EventLogger);
    let mut opened = Vec::with_capacity(specs.len());
    for spec in specs {
        let locator = spec.locator();
        if spec.driver == sim.driver_id() && sim.value(&locator).is_none() {
            sim.set_value(&locator, 0.0);
        }
        match manager
            .add_channel(&locator, spec.direction, spec.sampling, &spec.app_id())
            .await
        {
            Ok(handle) => {
                if handle.is_readable() {
                    if let Err(e) = manager.register_changed_listener(&handle, logger.clone()) {
                        warn!("Ch {} events not logged: {}", locator, e);
                    }
                }
                debug!("Ch {} opened as {:?}", locator, handle.config_type());
                opened.push(spec.clone());
            },
            Err(e) => warn!("Ch {} not opened: {}", locator, e),
        }
    }
    opened
}

/// Random walk over the simulated channels; listened ones are pushed.
async fn simulate(
    sim: Arc<SimulatedDriver>,
    specs: Vec<ChannelSpec>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick.tick() => {},
        }
        for spec in specs.iter().filter(|s| s.driver == sim.driver_id()) {
            let locator = spec.locator();
            let current = match sim.value(&locator) {
                Some(Value::Float(v)) => v,
                _ => 0.0,
            };
            let next = current + rng.gen_range(-0.5..0.5);
            if spec.sampling == Sampling::Listen {
                sim.push(&locator, next);
            } else {
                sim.set_value(&locator, next);
            }
        }
    }
}
