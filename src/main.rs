//! `iface-router` daemon
//!
//! ```bash
//! sudo iface-router                           # /etc/iface-router/config.json
//! sudo iface-router -c ./router.json
//! iface-router -g ./router.json               # write a default config
//! IFACE_ROUTER_LOG_LEVEL=debug sudo iface-router
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use iface_router::config::{load_config_with_env, Config, RulesConfig};
use iface_router::events::{EventBus, EventLayer, LogLevel, ProxyStatus};
use iface_router::flow::{FlowContext, FlowManager, FlowSettings};
use iface_router::interface::{InterfaceRegistry, SysfsInterfaceProvider};
use iface_router::ipc::{IpcHandler, IpcServer};
use iface_router::outbound::DirectDialer;
use iface_router::rules::{DroppedRecord, RuleSet, RuleStore};

const DEFAULT_CONFIG: &str = "/etc/iface-router/config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    /// Write a default config to the path and exit
    Generate,
    /// Load and validate the config, then exit
    Check,
}

struct Args {
    config_path: PathBuf,
    mode: Mode,
}

impl Args {
    fn from_env() -> Self {
        match Self::parse(std::env::args().skip(1)) {
            Ok(args) => args,
            Err(msg) => {
                eprintln!("iface-router: {msg}\n");
                print_help();
                std::process::exit(2);
            }
        }
    }

    fn parse(mut argv: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut args = Self {
            config_path: PathBuf::from(DEFAULT_CONFIG),
            mode: Mode::Run,
        };
        while let Some(arg) = argv.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = argv.next().ok_or_else(|| format!("{arg} needs a path"))?;
                    args.config_path = path.into();
                }
                "-g" | "--generate-config" => args.mode = Mode::Generate,
                "--check" => args.mode = Mode::Check,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("iface-router {}", iface_router::VERSION);
                    std::process::exit(0);
                }
                other => return Err(format!("unrecognised argument {other:?}")),
            }
        }
        Ok(args)
    }
}

fn print_help() {
    println!(
        r#"iface-router {version}
Routes intercepted TCP and UDP flows out of the interface picked by rules.

usage: iface-router [-c PATH] [-g | --check]

  -c, --config PATH        config file (default {DEFAULT_CONFIG})
  -g, --generate-config    write a default config to PATH and exit
      --check              validate the config and exit
  -h, --help               this text
  -v, --version            print the version

environment overrides:
  IFACE_ROUTER_LISTEN_ADDR   listen.address
  IFACE_ROUTER_LOG_LEVEL     log.level
  IFACE_ROUTER_MAX_FLOWS     flow.max_flows
  IFACE_ROUTER_IPC_SOCKET    ipc.socket_path
  IFACE_ROUTER_RULES_PATH    rules.store_path

Needs Linux with xt_TPROXY and CAP_NET_ADMIN. Typical firewall setup:

  iptables -t mangle -A PREROUTING -i br-lan -p tcp -j TPROXY \
      --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
  ip rule add fwmark 0x1 lookup 100
  ip route add local 0.0.0.0/0 dev lo table 100
"#,
        version = iface_router::VERSION
    );
}

/// Installs the global subscriber.
///
/// Records at or above `log.event_level` are also republished on `events`.
fn init_logging(config: &Config, events: &EventBus) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(config.log.tracing_level().into())
        .from_env_lossy();
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let event_layer = EventLayer::new(
        events.clone(),
        LogLevel::from_tracing(config.log.event_tracing_level()),
    );
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    let registry = tracing_subscriber::registry().with(filter).with(event_layer);
    if config.log.format == "json" {
        registry.with(fmt_layer.json()).init();
    } else {
        registry.with(fmt_layer).init();
    }
}

#[cfg(target_os = "linux")]
fn check_prerequisites() {
    use iface_router::tproxy::{has_net_admin_capability, is_root};

    if !is_root() && !has_net_admin_capability() {
        warn!("CAP_NET_ADMIN missing; transparent listeners and interface binding will fail");
    }
}

#[cfg(not(target_os = "linux"))]
fn check_prerequisites() {
    warn!("transparent interception needs Linux; only the control socket will run");
}

/// Populate the rule list at startup.
///
/// The store file wins when one is configured; inline records are only used
/// without one.
fn load_initial_rules(store: &RuleStore, config: &RulesConfig) {
    let dropped = if store.path().is_some() {
        match store.load() {
            Ok(dropped) => dropped,
            Err(e) => {
                warn!(error = %e, "rule store unreadable, starting with no rules");
                return;
            }
        }
    } else if !config.inline.is_empty() {
        store.replace_with_values(config.inline.clone())
    } else {
        Vec::new()
    };

    report_dropped(&dropped);
    info!(
        rules = store.len(),
        version = store.engine().version(),
        "rules ready"
    );
}

fn report_dropped(dropped: &[DroppedRecord]) {
    for record in dropped {
        warn!(
            index = record.index,
            rule_id = record.rule_id.as_deref().unwrap_or("-"),
            reason = %record.reason,
            "rule record skipped"
        );
    }
}

#[cfg(target_os = "linux")]
fn spawn_listeners(
    config: &Config,
    manager: &Arc<FlowManager>,
    listeners: &mut JoinSet<Result<(), iface_router::TproxyError>>,
) -> Result<()> {
    use iface_router::tproxy::{
        default_socket_provider, run_accept_loop, run_udp_loop, TproxyListener,
        TproxyUdpListener, UdpDemux,
    };

    if config.listen.tcp_enabled {
        let listener = TproxyListener::bind(&config.listen).context("TCP listener")?;
        listeners.spawn(run_accept_loop(listener, Arc::clone(manager)));
    }

    if config.listen.udp_enabled {
        let listener = TproxyUdpListener::bind(&config.listen).context("UDP listener")?;
        let demux = UdpDemux::new(Arc::clone(manager), default_socket_provider());
        listeners.spawn(run_udp_loop(listener, demux));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::unnecessary_wraps)]
fn spawn_listeners(
    _config: &Config,
    _manager: &Arc<FlowManager>,
    _listeners: &mut JoinSet<Result<(), iface_router::TproxyError>>,
) -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    let args = Args::from_env();
    let path = args.config_path.display();

    if args.mode == Mode::Generate {
        iface_router::config::create_default_config(&args.config_path)
            .with_context(|| format!("writing {path}"))?;
        println!("wrote {path}");
        return Ok(());
    }

    let config =
        load_config_with_env(&args.config_path).with_context(|| format!("loading {path}"))?;
    if args.mode == Mode::Check {
        println!("{path}: ok");
        return Ok(());
    }

    let events = EventBus::default();
    init_logging(&config, &events);
    info!(version = iface_router::VERSION, config = %path, "starting");
    events.status(ProxyStatus::Starting);

    check_prerequisites();

    // Rules
    let rules = Arc::new(RuleSet::with_event_bus(events.clone()));
    let store = Arc::new(RuleStore::new(
        Arc::clone(&rules),
        config.rules.store_path.clone(),
    ));
    load_initial_rules(&store, &config.rules);

    // Interfaces
    let provider = SysfsInterfaceProvider::with_root(&config.interfaces.sysfs_root)
        .include_loopback(config.interfaces.include_loopback);
    let interfaces = Arc::new(InterfaceRegistry::new(Arc::new(provider), events.clone()));
    if let Err(e) = interfaces.refresh() {
        warn!(error = %e, "first interface scan failed");
    }
    info!(
        known = interfaces.interfaces().len(),
        active = interfaces.active_interfaces().len(),
        "interfaces scanned"
    );
    let background = CancellationToken::new();
    let refresh_handle =
        interfaces.spawn_refresh_task(config.interfaces.refresh_interval(), background.clone());

    // Flows
    let dialer = Arc::new(DirectDialer::new(config.outbound.clone()));
    let ctx = Arc::new(FlowContext::new(
        rules,
        interfaces,
        dialer,
        events.clone(),
        FlowSettings::from_config(&config),
    ));
    let flow_manager = Arc::new(FlowManager::new(ctx, &config.flow));

    let mut listeners = JoinSet::new();
    if let Err(e) = spawn_listeners(&config, &flow_manager, &mut listeners) {
        events.status(ProxyStatus::Error);
        background.cancel();
        return Err(e);
    }

    info!(
        listen = %config.listen.address,
        tcp = config.listen.tcp_enabled,
        udp = config.listen.udp_enabled,
        max_flows = flow_manager.max_flows(),
        "listeners up"
    );

    // IPC
    let ipc_shutdown = CancellationToken::new();
    let ipc_handler = Arc::new(IpcHandler::new(
        Arc::clone(&flow_manager),
        Arc::clone(&store),
        ipc_shutdown.clone(),
    ));
    let ipc_server = IpcServer::new(config.ipc.clone(), ipc_handler);
    let ipc_stop = ipc_server.shutdown_sender();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!(error = %e, "control socket failed");
        }
    });

    events.status(ProxyStatus::Running);
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "running");

    let loop_result = tokio::select! {
        Some(joined) = listeners.join_next() => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("listener stopped")),
                Err(e) => Err(anyhow::Error::new(e).context("listener task panicked")),
            }
        }
        _ = signal::ctrl_c() => {
            info!(signal = "SIGINT", "stopping");
            Ok(())
        }
        () = wait_for_sigterm() => {
            info!(signal = "SIGTERM", "stopping");
            Ok(())
        }
        () = ipc_shutdown.cancelled() => {
            info!("stop requested on control socket");
            Ok(())
        }
    };

    events.status(ProxyStatus::Stopping);

    // Cancels the accept loops and drains in-flight flows
    flow_manager.shutdown().await;
    listeners.abort_all();
    while listeners.join_next().await.is_some() {}

    let _ = ipc_stop.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), ipc_handle).await;

    background.cancel();
    let _ = refresh_handle.await;

    let stats = flow_manager.stats_snapshot();
    info!(
        accepted = stats.total_accepted,
        completed = stats.completed,
        errored = stats.errored,
        cancelled = stats.cancelled,
        rejected = stats.rejected,
        fallbacks = stats.fallbacks,
        bytes_up = stats.bytes_up,
        bytes_down = stats.bytes_down,
        "flow totals"
    );

    if loop_result.is_err() {
        events.status(ProxyStatus::Error);
    } else {
        events.status(ProxyStatus::Stopped);
    }
    info!("stopped");
    loop_result
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler not installed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
