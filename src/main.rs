pub mod config;
pub mod context;
pub mod mqtt;
pub mod persistence;
pub mod scheduler;
pub mod sensor;

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rumqttc::AsyncClient;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

use crate::config::{GatewayConfig, LoggingConfig};
use crate::context::{ControlFlags, GatewayContext};
use crate::mqtt::command::CommandChannel;
use crate::mqtt::connection::{ConnectionManager, PublishHandle};
use crate::mqtt::message::unix_now;
use crate::mqtt::transport::{self, MqttTransport};
use crate::persistence::StoreAndForward;
use crate::scheduler::Scheduler;
use crate::sensor::SensorSource;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Samples local sensors and relays the readings to an MQTT broker,
/// buffering on disk while the broker is unreachable.
#[derive(Parser, Debug)]
#[command(name = "sensor-relay", version, about)]
struct Cli {
    /// Configuration file (default: ./sensor-relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configuration
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Kill,
    Reboot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config_path = config::resolve_path(cli.config);
    let config = GatewayConfig::load(&config_path).await?;
    let log_guard = setup_logging_env(&config.logging, cli.verbose)?;
    info!("Starting sensor-relay from {}", config_path.display());

    let exit = run(config, config_path).await?;
    info!("Stopped ({:?})", exit);

    // Flush buffered log lines before the process image is replaced.
    drop(log_guard);
    match exit {
        Exit::Kill => Ok(()),
        Exit::Reboot => restart(),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(logging: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { Level::DEBUG } else { logging.level()? };

    match &logging.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| eyre!("logging.file {} has no file name", path.display()))?;
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
            Ok(None)
        }
    }
}

async fn run(config: GatewayConfig, config_path: PathBuf) -> Result<Exit> {
    let context = GatewayContext::new(config_path);
    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    // A sensor bus that cannot be opened is fatal.
    let mut gpio = None;
    let sources = config
        .sensors
        .iter()
        .map(|sensor| SensorSource::open(sensor, &mut gpio))
        .collect::<Result<Vec<_>, _>>()?;
    let mut scheduler = Scheduler::new(sources, PublishHandle::new(events_tx.clone()));
    if scheduler.is_empty() {
        warn!("No sensors configured, only the command channel is active");
    }

    let store = StoreAndForward::open(&config.queue.path).await?;
    let topics = config.broker.topics();
    let (client, eventloop) =
        AsyncClient::new(config.broker.to_options()?, config.broker.channel_capacity);
    let mqtt = MqttTransport::new(
        client,
        topics.clone(),
        config.broker.qos(),
        config.broker.retain,
        SEND_TIMEOUT,
    );
    let commands = CommandChannel::new(&context, topics.status());
    let mut manager = ConnectionManager::new(mqtt, store, commands, topics);
    let status = manager.subscribe_status();

    let manager_shutdown = shutdown.clone();
    let manager_task = tokio::spawn(async move {
        manager.run(events_rx, manager_shutdown).await;
    });
    let driver_task = tokio::spawn(transport::drive(
        eventloop,
        events_tx,
        Duration::from_secs(config.broker.reconnect_backoff_secs),
        shutdown.clone(),
    ));
    spawn_signal_listener(context.flags.clone())?;

    info!(
        "Sampling {} sensors, broker {}",
        scheduler.len(),
        config.broker.url
    );
    let mut ticker = tokio::time::interval(config.scheduler.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        ticker.tick().await;
        if context.flags.kill_requested() {
            break Exit::Kill;
        }
        if context.flags.reboot_requested() {
            break Exit::Reboot;
        }

        let force = context.flags.take_read_request();
        let now = unix_now();
        // Sensor reads block (bit-banging, w1 conversions), keep them off the runtime threads.
        scheduler = tokio::task::spawn_blocking(move || {
            scheduler.tick(now, force);
            scheduler
        })
        .await?;
    };

    info!("Shutting down, flushing pending messages");
    drop(scheduler);
    shutdown.cancel();
    manager_task.await?;

    let driver_abort = driver_task.abort_handle();
    if tokio::time::timeout(DISCONNECT_GRACE, driver_task)
        .await
        .is_err()
    {
        warn!("Broker link did not close within {:?}", DISCONNECT_GRACE);
        driver_abort.abort();
    }

    let summary = status.borrow().clone();
    info!(
        "Link {:?}: {} sent, {} queued, {} received",
        summary.connection_state,
        summary.messages_sent,
        summary.messages_queued,
        summary.messages_received
    );
    Ok(exit)
}

fn spawn_signal_listener(flags: Arc<ControlFlags>) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        flags.request_kill();
    });
    Ok(())
}

/// Replaces this process with a fresh copy so a new configuration is read.
fn restart() -> Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let err = std::process::Command::new(&exe).args(&args).exec();
    Err(eyre!("Failed to restart {}: {}", exe.display(), err))
}
