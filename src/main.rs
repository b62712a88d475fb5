use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msc_gadget::arbiter::{Arbiter, RunOutcome};
use msc_gadget::block::{BlockDeviceProvider, SdCardSource};
use msc_gadget::config::{AppConfig, ConfigStore, TriggerConfig};
use msc_gadget::events::EventBus;
use msc_gadget::fs::{KernelFs, MountManager};
use msc_gadget::status::{open_display, StatusReporter};
use msc_gadget::trigger::{GpioButton, ResetTrigger, SignalTrigger};
use msc_gadget::usb::{ConfigFsStack, DeviceDescriptorSet, UsbExposure};
use msc_gadget::AppError;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// msc-gadget command line arguments
#[derive(Parser, Debug)]
#[command(name = "msc-gadget")]
#[command(version, about = "Expose an SD card to a USB host as a mass storage device", long_about = None)]
struct CliArgs {
    /// Data directory path (default: /etc/msc-gadget)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Block device or image file (overrides database config)
    #[arg(long, value_name = "PATH")]
    device: Option<String>,

    /// Local mount point (overrides database config)
    #[arg(short = 'm', long, value_name = "DIR")]
    mount_point: Option<String>,

    /// Format the medium if it has no filesystem (overrides database config)
    #[arg(long)]
    format_if_mount_failed: bool,

    /// Store the overrides above in the database so later starts use them
    #[arg(long)]
    save: bool,

    /// Print the USB descriptors as hex and exit
    #[arg(long)]
    print_descriptors: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting msc-gadget v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("msc-gadget.db")).await?;
    let config = if args.save {
        let changed = config_store
            .update(|c| apply_cli_overrides(c, &args))
            .await?;
        if changed.is_empty() {
            tracing::info!("Stored configuration already up to date");
        } else {
            tracing::info!("Saved configuration sections: {}", changed.join(", "));
        }
        config_store.get()
    } else {
        let mut config = (*config_store.get()).clone();
        apply_cli_overrides(&mut config, &args);
        Arc::new(config)
    };

    let descriptors = DeviceDescriptorSet::from_config(&config.usb)?;
    if args.print_descriptors {
        print!("{}", descriptors.hex_dump());
        return Ok(());
    }

    let events = Arc::new(EventBus::new());
    spawn_event_logger(&events);

    let provider = BlockDeviceProvider::new(
        SdCardSource::new(&config.storage),
        config.storage.retry_policy(),
    );
    let mounts = MountManager::new(
        KernelFs::new(config.filesystem.fs_type.clone()),
        &config.filesystem,
    );
    let usb = UsbExposure::new(ConfigFsStack::new(&config.usb), descriptors);
    let status = StatusReporter::new(open_display(&config.display)).with_images(&config.display);

    let mut arbiter = Arbiter::new(provider, mounts, usb, status, events.clone())
        .with_poll_interval(config.trigger.poll_interval());

    let mut triggers = build_triggers(&config.trigger)?;
    if triggers.is_empty() {
        tracing::warn!("No reset trigger configured, only a service restart returns local access");
    }

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match arbiter.boot().await {
        Ok(report) => tracing::info!(
            "Medium exposed over USB ({} entries, {:.1} MB free)",
            report.inventory.len(),
            report.snapshot.free_mb()
        ),
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return Err(e.into());
        }
    }

    match arbiter.run(&mut triggers, cancel).await? {
        RunOutcome::Restart => {
            config_store.close().await;
            restart_current_process()?;
        }
        RunOutcome::Shutdown => {
            tracing::info!("msc-gadget stopped");
        }
    }

    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "msc_gadget=error",
        LogLevel::Warn => "msc_gadget=warn",
        LogLevel::Info => "msc_gadget=info",
        LogLevel::Verbose => "msc_gadget=debug,sqlx=warn",
        LogLevel::Debug => "msc_gadget=debug,sqlx=info",
        LogLevel::Trace => "msc_gadget=trace,sqlx=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("MSC_GADGET_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/msc-gadget")
}

/// Command line values win over stored ones
fn apply_cli_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(device) = &args.device {
        config.storage.device_path = device.clone();
    }
    if let Some(mount_point) = &args.mount_point {
        config.filesystem.mount_point = mount_point.clone();
    }
    if args.format_if_mount_failed {
        config.filesystem.format_if_mount_failed = true;
    }
}

fn build_triggers(config: &TriggerConfig) -> anyhow::Result<Vec<Box<dyn ResetTrigger>>> {
    let mut triggers: Vec<Box<dyn ResetTrigger>> = Vec::new();
    if let Some(button) = GpioButton::from_config(config)? {
        triggers.push(Box::new(button));
    }
    if config.signal {
        triggers.push(Box::new(SignalTrigger::install()?));
    }
    Ok(triggers)
}

/// Trace every system event as JSON
fn spawn_event_logger(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("event: {}", json),
                Err(_) => tracing::debug!("event: {}", event.event_name()),
            }
        }
    });
}

/// Cancel on Ctrl+C or SIGTERM
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
                        _ = term.recv() => tracing::info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        cancel.cancel();
    });
}

/// Replace this process with a fresh copy of itself
fn restart_current_process() -> Result<(), AppError> {
    let exe = std::env::current_exe()
        .map_err(|e| AppError::Internal(format!("Failed to get current exe: {}", e)))?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    tracing::info!("Restarting {}", exe.display());

    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(&exe).args(&args).exec();
    Err(AppError::Internal(format!("Failed to restart: {}", err)))
}
