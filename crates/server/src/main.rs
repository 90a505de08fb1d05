//! usbmuxd
//!
//! Host-side daemon that mediates USB device attachment between a
//! hypervisor's control domain and guest VMs: classifies hotplugged
//! devices, consults a rule-based policy, and wires permitted devices
//! through to a guest's paravirtualized USB bus.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use usbmuxd::attach::SysfsPassthroughDriver;
use usbmuxd::config::DaemonConfig;
use usbmuxd::dispatcher::{AttachTopology, Core, run_dispatcher};
use usbmuxd::enumerator::{NoOpticalWatcher, NoQueueFacility, spawn_enumerator_worker};
use usbmuxd::service;
use usbmuxd::settings_bridge::FileSettingsStore;
use usbmuxd::shared_store::InMemorySharedStore;
use usbmuxd::usb_probe::RusbDescriptorProber;
use usbmuxd_common::setup_logging;
use usbmuxd_protocol::Notification;

#[derive(Parser, Debug)]
#[command(name = "usbmuxd")]
#[command(author, version, about = "USB passthrough mediator for guest VMs")]
#[command(long_about = "
Mediates USB device attachment between the control domain and guest VMs:
classifies hotplugged devices, consults a rule-based policy, and wires
permitted devices through to a guest's paravirtualized USB bus.

EXAMPLES:
    # Run with default config
    usbmuxd

    # Run with custom config
    usbmuxd --config /path/to/usbmuxd.toml

    # Run without RPC registration or an initial policy load
    usbmuxd stub-mode

    # Print the current diagnostic dump and exit
    usbmuxd --state

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbmuxd/usbmuxd.toml
    3. /etc/usbmuxd/usbmuxd.toml
    4. Built-in defaults
")]
struct Args {
    /// Positional mode selector. Only "stub-mode" is recognized: it skips
    /// RPC registration and the initial policy load while still servicing
    /// hotplug events.
    #[arg(value_name = "MODE")]
    mode: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Print the diagnostic dump and exit
    #[arg(long)]
    state: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };
    match args.mode.as_deref() {
        None => {}
        Some("stub-mode") => config.daemon.stub_mode = true,
        Some(other) => warn!(mode = other, "unrecognized positional mode argument, ignoring"),
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("failed to set up logging")?;

    info!("usbmuxd v{}", env!("CARGO_PKG_VERSION"));
    info!(stub_mode = config.daemon.stub_mode, "loaded configuration");

    if args.state {
        return print_state(&config).await;
    }

    run_daemon(config).await
}

/// Builds a `Core` against the persisted settings store without spinning up
/// the enumerator or the dispatcher loop, and prints its diagnostic dump.
/// Shares `diagnostics::dump_state` with the `state` RPC verb (§4.9); VMs
/// and devices are necessarily empty outside a running dispatcher, so this
/// mainly surfaces the configured rule list.
async fn print_state(config: &DaemonConfig) -> Result<()> {
    let settings = FileSettingsStore::open(config.daemon.settings_store_path.clone())
        .await
        .context("failed to open settings store")?;
    let driver = SysfsPassthroughDriver {
        add_id_path: config.attach.add_id_path.clone(),
        remove_id_path: config.attach.remove_id_path.clone(),
    };
    let (notify_tx, notify_rx) = async_channel::bounded(64);
    notify_rx.close();
    let mut core = Core::new(
        config.daemon.ui_vm_uuid.clone(),
        InMemorySharedStore::new(),
        settings,
        driver,
        notify_tx,
        topology(config),
        std::time::Duration::from_secs(config.daemon.state_wait_timeout_secs),
    );
    core.reload_policy().await.context("failed to load policy")?;
    print!("{}", core.state());
    Ok(())
}

fn topology(config: &DaemonConfig) -> AttachTopology {
    AttachTopology {
        vm_root_prefix: config.attach.vm_root_prefix.clone(),
        backend_root: config.attach.backend_root.clone(),
        backend_domid: config.attach.backend_domid,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    if service::is_systemd() {
        info!("running under systemd");
    }

    let settings = FileSettingsStore::open(config.daemon.settings_store_path.clone())
        .await
        .context("failed to open settings store")?;
    let driver = SysfsPassthroughDriver {
        add_id_path: config.attach.add_id_path.clone(),
        remove_id_path: config.attach.remove_id_path.clone(),
    };
    let (notify_tx, notify_rx) = async_channel::bounded(256);

    let mut core = Core::new(
        config.daemon.ui_vm_uuid.clone(),
        InMemorySharedStore::new(),
        settings,
        driver,
        notify_tx,
        topology(&config),
        std::time::Duration::from_secs(config.daemon.state_wait_timeout_secs),
    );

    if config.daemon.stub_mode {
        info!("stub-mode: skipping RPC registration and initial policy load");
    } else {
        core.reload_policy().await.context("failed to load policy")?;
    }

    let filters: Vec<_> = config
        .usb
        .filters
        .iter()
        .filter_map(|f| {
            let parsed = DaemonConfig::parse_filter(f);
            if parsed.is_none() {
                warn!(filter = f, "ignoring unparseable usb filter");
            }
            parsed
        })
        .collect();

    let (enumerator, enumerator_handle) =
        spawn_enumerator_worker(filters).context("failed to start USB enumerator")?;

    let (_commands_tx, commands_rx) = tokio::sync::mpsc::channel(32);

    let notify_task = tokio::spawn(async move {
        while let Ok(notification) = notify_rx.recv().await {
            log_notification(notification);
        }
    });

    let watchdog_handle = service::spawn_watchdog_task()
        .await
        .context("failed to spawn watchdog task")?;
    service::notify_ready().context("failed to notify systemd ready")?;
    service::notify_status("running").context("failed to send status to systemd")?;

    info!("dispatcher running, press Ctrl+C to shut down");
    let dispatcher_task = tokio::spawn(run_dispatcher(
        core,
        enumerator,
        NoQueueFacility,
        NoOpticalWatcher,
        Box::new(RusbDescriptorProber),
        commands_rx,
    ));

    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!("error waiting for Ctrl+C: {e}"),
    }

    service::notify_stopping().context("failed to notify systemd stopping")?;
    watchdog_handle.abort();
    dispatcher_task.abort();
    notify_task.abort();

    if let Err(e) = enumerator_handle.join() {
        error!("enumerator worker thread panicked: {e:?}");
    }

    info!("shutdown complete");
    Ok(())
}

fn log_notification(notification: Notification) {
    match notification {
        Notification::DeviceAdded { dev_id } => info!(dev_id = dev_id.0, "device added"),
        Notification::OpticalDeviceDetected => info!("optical device detected"),
        Notification::DevicesChanged => info!("device list changed"),
        Notification::DeviceRejected { name, reason } => {
            warn!(name, reason, "device rejected")
        }
    }
}
