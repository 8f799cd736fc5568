use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use std::fs;
use std::path::Path;
use std::process;

use netconnd_lib::config;
use netconnd_lib::logging::{self, LogReloadHandle};

use crate::device_info::SystemDeviceInfo;
use crate::manager::Manager;
use crate::routing::RouteAnswer;
use crate::routing::netlink_ops::NetlinkOps;

mod cli;
mod device_info;
mod manager;
mod routing;
mod shell_command_ext;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// handling fs config events with a grace period to avoid duplicate reads without delay
const CONFIG_GRACE_PERIOD: Duration = Duration::from_millis(333);
// upper bound for removing kernel state on shutdown
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// SIGINT or SIGTERM
    Shutdown,
    /// SIGHUP
    Hangup,
}

async fn signal_channel() -> Result<mpsc::Receiver<Signal>, exitcode::ExitCode> {
    let install = |kind: SignalKind, name: &'static str| {
        signal(kind).map_err(|e| {
            tracing::error!(error = ?e, signal = name, "error installing signal handler");
            exitcode::IOERR
        })
    };
    let mut sigint = install(SignalKind::interrupt(), "SIGINT")?;
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM")?;
    let mut sighup = install(SignalKind::hangup(), "SIGHUP")?;

    let (sender, receiver) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(_) = sigint.recv() => Signal::Shutdown,
                Some(_) = sigterm.recv() => Signal::Shutdown,
                Some(_) = sighup.recv() => Signal::Hangup,
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            };
            tracing::debug!(signal = ?received, "received signal");
            if sender.send(received).await.is_err() {
                tracing::warn!("signal receiver closed");
                break;
            }
        }
    });

    Ok(receiver)
}

async fn config_channel(
    param_config_path: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Event>), exitcode::ExitCode> {
    match param_config_path.try_exists() {
        Ok(true) => (),
        Ok(false) => {
            tracing::error!(config_file = %param_config_path.display(), "cannot find configuration file");
            return Err(exitcode::NOINPUT);
        }
        Err(e) => {
            tracing::error!(error = ?e, "error checking configuration file path");
            return Err(exitcode::IOERR);
        }
    };

    let config_path = match fs::canonicalize(param_config_path) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = ?e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };

    let parent = match config_path.parent() {
        Some(p) => p,
        None => {
            tracing::error!("config path has no parent");
            return Err(exitcode::UNAVAILABLE);
        }
    };

    let (sender, receiver) = mpsc::channel(32);
    let mut watcher = match notify::recommended_watcher(move |res| match res {
        Ok(event) => {
            let _ = sender.blocking_send(event).map_err(|e| {
                tracing::error!(error = ?e, "error sending config watch event");
            });
        }
        Err(e) => tracing::error!(error = ?e, "config watch error"),
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = ?e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };

    // watching the directory also catches editors replacing the file
    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        tracing::error!(error = ?e, "error watching config directory");
        return Err(exitcode::IOERR);
    }

    Ok((watcher, receiver))
}

fn incoming_config_fs_event(event: notify::Event, config_path: &Path) -> bool {
    tracing::debug!(?event, ?config_path, "incoming config event");
    let concerns_config =
        event.paths.is_empty() || event.paths.iter().any(|path| path.file_name() == config_path.file_name());
    if !concerns_config {
        return false;
    }
    match event.kind {
        kind @ notify::event::EventKind::Create(notify::event::CreateKind::File)
        | kind @ notify::event::EventKind::Remove(notify::event::RemoveKind::File)
        | kind @ notify::event::EventKind::Modify(notify::event::ModifyKind::Data(_))
        | kind @ notify::event::EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            tracing::debug!(?kind, "config file change detected");
            true
        }
        _ => false,
    }
}

fn reopen_log_file(log_file: Option<&Path>, log_reload: Option<&LogReloadHandle>) {
    let (Some(path), Some(handle)) = (log_file, log_reload) else {
        tracing::debug!("logging to stdout, nothing to reopen");
        return;
    };
    match logging::make_file_fmt_layer(path) {
        Ok(layer) => match handle.reload(layer) {
            Ok(()) => tracing::info!(path = %path.display(), "reopened log file"),
            Err(e) => tracing::error!(error = %e, "error swapping log file layer"),
        },
        Err(e) => tracing::error!(error = %e, path = %path.display(), "error reopening log file"),
    }
}

/// Replaces the device snapshot. A failed dump keeps the previous one.
async fn refresh_devices<N: NetlinkOps>(ops: &N, device_info: &SystemDeviceInfo) {
    let links = match ops.link_list().await {
        Ok(links) => links,
        Err(e) => {
            tracing::error!(error = %e, "error listing links, keeping previous device snapshot");
            return;
        }
    };
    let addrs = match ops.addr_list().await {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::error!(error = %e, "error listing addresses, keeping previous device snapshot");
            return;
        }
    };
    device_info.refresh(&links, &addrs);
}

/// Re-reads the configuration file and applies it. An unreadable or invalid
/// file keeps the running configuration.
async fn reload<N: NetlinkOps>(
    manager: &mut Manager,
    ops: &N,
    device_info: &SystemDeviceInfo,
    config_path: &Path,
    resolv_conf: &Path,
) {
    let config = match config::read(config_path).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "error reading configuration, keeping last known good configuration");
            return;
        }
    };
    if config.resolv_conf != resolv_conf {
        tracing::warn!(configured = %config.resolv_conf.display(), active = %resolv_conf.display(), "resolv.conf location changes need a restart");
    }
    refresh_devices(ops, device_info).await;
    manager.apply_config(&config);
    tracing::info!(interfaces = config.interfaces.len(), "configuration reloaded");
}

#[cfg(target_os = "linux")]
async fn daemon(args: cli::Cli, log_reload: Option<LogReloadHandle>) -> Result<(), exitcode::ExitCode> {
    use std::sync::Arc;

    use netconnd_lib::resolver::ResolvConf;

    use crate::routing::netlink_ops::RealNetlinkOps;
    use crate::routing::{KernelRoutingTable, KernelRtnlHandler, worker};

    let mut signal_receiver = signal_channel().await?;

    // set up config watcher
    let (_config_watcher, mut config_receiver) = config_channel(&args.config_path).await?;
    let config_path = match args.config_path.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };
    let config = config::read(&config_path).await.map_err(|e| {
        tracing::error!(error = %e, config_file = %config_path.display(), "error reading configuration");
        exitcode::CONFIG
    })?;
    // an override from the command line wins for the whole lifetime of the daemon
    let resolv_conf = args.resolv_conf.clone().unwrap_or_else(|| config.resolv_conf.clone());

    let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
        tracing::error!(error = %e, "error opening netlink socket");
        exitcode::OSERR
    })?;
    tokio::spawn(connection);
    let ops = RealNetlinkOps::new(handle);

    let (request_sender, request_receiver) = worker::channel();
    let (answer_sender, mut answer_receiver) = mpsc::unbounded_channel();
    let netlink_worker = tokio::spawn(worker::run(ops.clone(), request_receiver, answer_sender));

    let device_info = Arc::new(SystemDeviceInfo::new(request_sender.clone(), &args.proc_root));
    refresh_devices(&ops, &device_info).await;
    let routing_table = Arc::new(KernelRoutingTable::new(request_sender.clone()));
    let rtnl = Arc::new(KernelRtnlHandler::new(request_sender, Arc::clone(&device_info)));
    let resolver = Arc::new(ResolvConf::new(resolv_conf.clone()));
    let mut manager = Manager::new(routing_table, Arc::clone(&device_info), rtnl, resolver);
    manager.apply_config(&config);

    let res = loop_daemon(
        &mut manager,
        &ops,
        &device_info,
        (&config_path, &resolv_conf),
        (args.log_file.as_deref(), log_reload.as_ref()),
        &mut signal_receiver,
        &mut config_receiver,
        &mut answer_receiver,
    )
    .await;

    // dropping the last collaborator closes the request queue once cleanup is queued
    manager.shutdown();
    drop(manager);
    drop(device_info);
    let force_shutdown = async {
        while let Some(received) = signal_receiver.recv().await {
            if received == Signal::Shutdown {
                return;
            }
        }
        std::future::pending::<()>().await
    };
    tokio::select! {
        _ = netlink_worker => tracing::info!("kernel state cleaned up"),
        _ = force_shutdown => tracing::info!("force shutdown immediately"),
        _ = sleep(CLEANUP_TIMEOUT) => tracing::warn!("timed out cleaning up kernel state"),
    }
    res
}

#[cfg(not(target_os = "linux"))]
async fn daemon(_args: cli::Cli, _log_reload: Option<LogReloadHandle>) -> Result<(), exitcode::ExitCode> {
    tracing::error!("kernel routing tables are only supported on linux");
    Err(exitcode::UNAVAILABLE)
}

#[allow(clippy::too_many_arguments)]
async fn loop_daemon<N: NetlinkOps>(
    manager: &mut Manager,
    ops: &N,
    device_info: &SystemDeviceInfo,
    (config_path, resolv_conf): (&Path, &Path),
    (log_file, log_reload): (Option<&Path>, Option<&LogReloadHandle>),
    signal_receiver: &mut mpsc::Receiver<Signal>,
    config_receiver: &mut mpsc::Receiver<notify::Event>,
    answer_receiver: &mut mpsc::UnboundedReceiver<RouteAnswer>,
) -> Result<(), exitcode::ExitCode> {
    let (reload_sender, mut reload_receiver) = mpsc::channel(1);
    let mut reload_cancel = CancellationToken::new();

    tracing::info!("enter listening mode");
    loop {
        tokio::select! {
            Some(received) = signal_receiver.recv() => match received {
                Signal::Shutdown => {
                    tracing::info!("initiate shutdown");
                    return Ok(());
                }
                Signal::Hangup => reopen_log_file(log_file, log_reload),
            },
            Some(evt) = config_receiver.recv() => {
                if incoming_config_fs_event(evt, config_path) {
                    reload_cancel.cancel();
                    reload_cancel = CancellationToken::new();
                    let cancel_token = reload_cancel.clone();
                    let sender = reload_sender.clone();
                    tokio::spawn(async move {
                        cancel_token.run_until_cancelled(async move {
                            sleep(CONFIG_GRACE_PERIOD).await;
                            if sender.send(()).await.is_err() {
                                tracing::warn!("reload receiver already closed");
                            }
                        }).await;
                    });
                }
            },
            Some(_) = reload_receiver.recv() => {
                reload(manager, ops, device_info, config_path, resolv_conf).await;
            },
            Some(answer) = answer_receiver.recv() => {
                manager.on_route_answer(answer);
            },
            else => {
                tracing::error!("unexpected channel closure");
                return Err(exitcode::IOERR);
            }
        }
    }
}

/// limit the daemon to two threads
/// one for the main loop owning every connection
/// one for the netlink worker
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let args = cli::parse();

    let log_reload = match args.log_file.as_deref() {
        Some(path) => match logging::setup_log_file(path) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("error opening log file {}: {e}", path.display());
                process::exit(exitcode::CANTCREAT);
            }
        },
        None => {
            logging::setup_stdout();
            None
        }
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args, log_reload).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use notify::event::{self, Event, EventKind};
    use tempfile::tempdir;

    use std::path::PathBuf;
    use std::sync::Arc;

    use netconnd_lib::mocks::MockResolver;

    use crate::routing::mocks::MockNetlinkOps;
    use crate::routing::netlink_ops::LinkInfo;
    use crate::routing::{KernelRoutingTable, KernelRtnlHandler, worker};

    const CONFIG: &str = r#"
version = 1

[[interface]]
name = "eth0"
technology = "ethernet"

[interface.ipconfig]
address = "192.168.1.1"
subnet_prefix = 24
gateway = "192.168.1.254"
"#;

    fn build_event(kind: EventKind) -> Event {
        Event {
            kind,
            paths: Vec::new(),
            attrs: event::EventAttributes::default(),
        }
    }

    fn manager(ops: &MockNetlinkOps, proc_root: &Path) -> (Manager, Arc<SystemDeviceInfo>) {
        ops.state.lock().unwrap().links.push(LinkInfo {
            index: 3,
            name: "eth0".to_string(),
            mtu: Some(1500),
        });
        let (tx, _rx) = worker::channel();
        let device_info = Arc::new(SystemDeviceInfo::new(tx.clone(), proc_root));
        let manager = Manager::new(
            Arc::new(KernelRoutingTable::new(tx.clone())),
            Arc::clone(&device_info),
            Arc::new(KernelRtnlHandler::new(tx, Arc::clone(&device_info))),
            Arc::new(MockResolver::new()),
        );
        (manager, device_info)
    }

    #[tokio::test]
    async fn config_channel_succeeds_when_file_exists() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, CONFIG)?;

        let result = config_channel(config_path.as_path()).await;
        assert!(result.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn config_channel_fails_when_file_missing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("missing.toml");

        let result = config_channel(config_path.as_path()).await;
        assert!(matches!(result, Err(exitcode::NOINPUT)));
        Ok(())
    }

    #[test]
    fn incoming_config_fs_event_when_file_changes() -> anyhow::Result<()> {
        let event = build_event(EventKind::Create(event::CreateKind::File));
        assert!(incoming_config_fs_event(event, Path::new("config.toml")));

        let event = build_event(EventKind::Modify(event::ModifyKind::Data(event::DataChange::Size)));
        assert!(incoming_config_fs_event(event, Path::new("config.toml")));

        let event = build_event(EventKind::Modify(event::ModifyKind::Name(event::RenameMode::To)));
        assert!(incoming_config_fs_event(event, Path::new("config.toml")));

        let event = build_event(EventKind::Remove(event::RemoveKind::File));
        assert!(incoming_config_fs_event(event, Path::new("config.toml")));
        Ok(())
    }

    #[test]
    fn incoming_config_fs_event_skips_irrelevant_events() -> anyhow::Result<()> {
        let event = build_event(EventKind::Other);
        assert!(!incoming_config_fs_event(event, Path::new("config.toml")));
        Ok(())
    }

    #[test]
    fn incoming_config_fs_event_skips_sibling_files() -> anyhow::Result<()> {
        let event = build_event(EventKind::Modify(event::ModifyKind::Data(event::DataChange::Content)))
            .add_path(PathBuf::from("/etc/netconnd/resolv.conf"));
        assert!(!incoming_config_fs_event(event, Path::new("/etc/netconnd/config.toml")));

        let event = build_event(EventKind::Modify(event::ModifyKind::Data(event::DataChange::Content)))
            .add_path(PathBuf::from("/etc/netconnd/config.toml"));
        assert!(incoming_config_fs_event(event, Path::new("/etc/netconnd/config.toml")));
        Ok(())
    }

    #[tokio::test]
    async fn reload_applies_new_configuration() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, CONFIG)?;
        let ops = MockNetlinkOps::new();
        let (mut manager, device_info) = manager(&ops, dir.path());

        reload(&mut manager, &ops, &device_info, &config_path, Path::new("/run/netconnd/resolv.conf")).await;

        assert!(manager.connection("eth0").is_some());
        assert_eq!(manager.default_interface(), Some("eth0"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_configuration_keeps_the_running_one() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, CONFIG)?;
        let ops = MockNetlinkOps::new();
        let (mut manager, device_info) = manager(&ops, dir.path());
        let resolv_conf = Path::new("/run/netconnd/resolv.conf");
        reload(&mut manager, &ops, &device_info, &config_path, resolv_conf).await;

        std::fs::write(&config_path, "version = 7\n")?;
        reload(&mut manager, &ops, &device_info, &config_path, resolv_conf).await;
        assert!(manager.connection("eth0").is_some());

        std::fs::remove_file(&config_path)?;
        reload(&mut manager, &ops, &device_info, &config_path, resolv_conf).await;
        assert!(manager.connection("eth0").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_link_dump_keeps_the_device_snapshot() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let ops = MockNetlinkOps::new();
        let (_manager, device_info) = manager(&ops, dir.path());
        refresh_devices(&ops, &device_info).await;
        assert!(device_info.device_by_name("eth0").is_some());

        ops.state
            .lock()
            .unwrap()
            .fail_on
            .insert("link_list".to_string(), "netlink socket closed".to_string());
        refresh_devices(&ops, &device_info).await;
        assert!(device_info.device_by_name("eth0").is_some());
        Ok(())
    }

    #[test]
    fn sighup_without_log_file_is_ignored() {
        reopen_log_file(None, None);
    }
}
