//! IPC command handler
//!
//! This module processes IPC commands and generates responses.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    ErrorCode, IpcCommand, IpcResponse, RulesLoaded, ServerStatus, TestMatchResult,
};
use crate::flow::FlowManager;
use crate::rules::{DroppedRecord, Rule, RuleStore};

/// IPC command handler
pub struct IpcHandler {
    flows: Arc<FlowManager>,

    /// Rule list that loads and reloads go through
    store: Arc<RuleStore>,

    /// Fired by the `Shutdown` command
    shutdown: CancellationToken,

    /// Server start time
    start_time: Instant,
}

impl IpcHandler {
    /// Create a new IPC handler
    pub fn new(flows: Arc<FlowManager>, store: Arc<RuleStore>, shutdown: CancellationToken) -> Self {
        Self {
            flows,
            store,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Handle an IPC command and return a response
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!("Handling IPC command: {:?}", command);

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Status => self.handle_status(),

            IpcCommand::GetStats => IpcResponse::Stats(self.flows.stats_snapshot()),

            IpcCommand::ListRules => self.handle_list_rules(),

            IpcCommand::LoadRules { rules } => {
                let dropped = self.store.replace_with_values(rules);
                self.rules_loaded(&dropped)
            }

            IpcCommand::ReloadRules => self.handle_reload_rules(),

            IpcCommand::TestMatch { ip, hostname } => self.handle_test_match(ip, hostname),

            IpcCommand::ListInterfaces => IpcResponse::InterfaceList {
                interfaces: self.flows.context().interfaces.interfaces().to_vec(),
            },

            IpcCommand::RefreshInterfaces => self.handle_refresh_interfaces(),

            IpcCommand::Shutdown => {
                info!("Shutdown requested over IPC");
                self.shutdown.cancel();
                IpcResponse::success_with_message("Shutdown initiated")
            }
        }
    }

    fn handle_status(&self) -> IpcResponse {
        let ctx = self.flows.context();
        let snapshot = ctx.rules.snapshot();

        IpcResponse::Status(ServerStatus {
            version: crate::VERSION.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_flows: self.flows.active_flows(),
            max_flows: self.flows.max_flows(),
            rule_count: snapshot.len(),
            rule_version: snapshot.version(),
            active_interfaces: ctx.interfaces.active_interfaces().len(),
            shutting_down: self.flows.is_shutting_down(),
        })
    }

    fn handle_list_rules(&self) -> IpcResponse {
        let snapshot = self.flows.context().rules.snapshot();
        IpcResponse::RuleList {
            version: snapshot.version(),
            rules: snapshot.rules().iter().map(Rule::to_record).collect(),
        }
    }

    fn handle_reload_rules(&self) -> IpcResponse {
        match self.store.load() {
            Ok(dropped) => self.rules_loaded(&dropped),
            Err(e) => {
                warn!("Rule reload failed: {}", e);
                IpcResponse::error(ErrorCode::OperationFailed, e.to_string())
            }
        }
    }

    fn rules_loaded(&self, dropped: &[DroppedRecord]) -> IpcResponse {
        IpcResponse::RulesLoaded(RulesLoaded {
            loaded: self.store.len(),
            version: self.store.engine().version(),
            dropped: dropped
                .iter()
                .map(|d| {
                    format!(
                        "#{} ({}): {}",
                        d.index,
                        d.rule_id.as_deref().unwrap_or("-"),
                        d.reason
                    )
                })
                .collect(),
        })
    }

    fn handle_test_match(&self, ip: Option<String>, hostname: Option<String>) -> IpcResponse {
        let ip = match ip.as_deref().map(str::parse::<IpAddr>).transpose() {
            Ok(ip) => ip,
            Err(e) => {
                return IpcResponse::error(ErrorCode::InvalidParameters, format!("Invalid ip: {e}"))
            }
        };
        if ip.is_none() && hostname.is_none() {
            return IpcResponse::error(
                ErrorCode::InvalidParameters,
                "At least one of ip or hostname is required",
            );
        }

        let ctx = self.flows.context();
        let rule_version = ctx.rules.version();
        let result = match ctx.rules.match_destination(ip, hostname.as_deref()) {
            Some(hit) => {
                let interface = hit.interface().map(str::to_string);
                let interface_active = interface
                    .as_deref()
                    .map_or(true, |name| ctx.interfaces.is_active(name));
                TestMatchResult {
                    matched: true,
                    rule_id: Some(hit.rule_id),
                    interface,
                    interface_active,
                    rule_version,
                }
            }
            None => TestMatchResult {
                matched: false,
                rule_id: None,
                interface: None,
                interface_active: true,
                rule_version,
            },
        };
        IpcResponse::TestMatchResult(result)
    }

    fn handle_refresh_interfaces(&self) -> IpcResponse {
        match self.flows.context().interfaces.refresh() {
            Ok(true) => IpcResponse::success_with_message("Interface list changed"),
            Ok(false) => IpcResponse::success_with_message("Interface list unchanged"),
            Err(e) => IpcResponse::error(ErrorCode::OperationFailed, e.to_string()),
        }
    }
}
