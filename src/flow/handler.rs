//! Per-flow state machine
//!
//! A [`FlowHandler`] owns one inbound flow from hand-over to teardown:
//! it matches the destination against the current rule snapshot, picks a
//! usable interface, opens the outbound side through the [`Dialer`], relays
//! until either side finishes, and reports a [`FlowOutcome`] exactly once.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::state::FlowState;
use super::types::{BoxedStream, FlowMeta, FlowOutcome, FlowStatus, InboundFlow};
use super::udp::drive_udp;
use crate::config::{Config, UdpMatchPolicy};
use crate::error::{FlowError, OutboundError};
use crate::events::{EventBus, FlowEvent, RouterEvent};
use crate::interface::InterfaceRegistry;
use crate::io::{CopyResult, Relay};
use crate::outbound::{Dialer, OutboundConnection};
use crate::rules::RuleSet;

/// Completion callback; invoked once per flow
pub type CompletionFn = Box<dyn FnOnce(FlowOutcome) + Send + 'static>;

/// Timeouts and policies applied to every flow
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub connect_timeout: Duration,
    pub cancel_deadline: Duration,
    pub buffer_size: usize,
    pub udp_policy: UdpMatchPolicy,
    pub udp_idle_timeout: Duration,
    pub udp_channel_capacity: usize,
    /// Used when a rule's interface is unusable or nothing matched
    pub default_interface: Option<String>,
    /// Retry once unbound when binding to an interface fails
    pub retry_unbound: bool,
}

impl FlowSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.flow.connect_timeout(),
            cancel_deadline: config.flow.cancel_deadline(),
            buffer_size: config.flow.buffer_size,
            udp_policy: config.flow.udp_policy,
            udp_idle_timeout: config.flow.udp_idle_timeout(),
            udp_channel_capacity: config.flow.udp_channel_capacity,
            default_interface: config.interfaces.default_interface.clone(),
            retry_unbound: config.outbound.retry_unbound,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Where a flow's outbound side goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Route {
    /// `None` is the unbound system route
    pub interface: Option<String>,
    pub rule_id: Option<String>,
    pub fallback: bool,
}

pub(crate) const INACTIVE: &str = "interface inactive";

/// Services shared by all flows
pub struct FlowContext {
    pub rules: Arc<RuleSet>,
    pub interfaces: Arc<InterfaceRegistry>,
    pub dialer: Arc<dyn Dialer>,
    pub events: EventBus,
    pub settings: FlowSettings,
}

impl FlowContext {
    pub fn new(
        rules: Arc<RuleSet>,
        interfaces: Arc<InterfaceRegistry>,
        dialer: Arc<dyn Dialer>,
        events: EventBus,
        settings: FlowSettings,
    ) -> Self {
        Self {
            rules,
            interfaces,
            dialer,
            events,
            settings,
        }
    }

    /// An empty registry has not enumerated anything yet, so every name is
    /// accepted and binding decides.
    fn interface_usable(&self, name: &str) -> bool {
        self.interfaces.interfaces().is_empty() || self.interfaces.is_active(name)
    }

    fn default_route(&self) -> Option<String> {
        self.settings
            .default_interface
            .as_deref()
            .filter(|name| self.interface_usable(name))
            .map(str::to_string)
    }

    /// Match the destination and pick a usable interface
    pub(crate) fn resolve(
        &self,
        meta: &FlowMeta,
        ip: Option<IpAddr>,
        destination: Option<SocketAddr>,
    ) -> Route {
        let (route, unusable) = self.pick_route(meta, ip);
        if let Some(requested) = unusable {
            let used = route.interface.as_deref();
            self.report_fallback(meta, destination, &requested, used, INACTIVE);
        }
        route
    }

    /// Route for a destination without reporting. The second value names
    /// the matched interface when it was unusable and the route fell back.
    pub(crate) fn pick_route(
        &self,
        meta: &FlowMeta,
        ip: Option<IpAddr>,
    ) -> (Route, Option<String>) {
        let Some(matched) = self.rules.match_destination(ip, meta.hostname.as_deref()) else {
            debug!("No rule matched, using default route");
            let route = Route {
                interface: self.default_route(),
                ..Route::default()
            };
            return (route, None);
        };

        let rule_id = Some(matched.rule_id.clone());
        match matched.interface() {
            None => {
                let route = Route {
                    interface: self.default_route(),
                    rule_id,
                    fallback: false,
                };
                (route, None)
            }
            Some(name) if self.interface_usable(name) => {
                debug!(rule = %matched.rule_id, interface = name, "Rule matched");
                let route = Route {
                    interface: Some(name.to_string()),
                    rule_id,
                    fallback: false,
                };
                (route, None)
            }
            Some(name) => {
                let route = Route {
                    interface: self.default_route(),
                    rule_id,
                    fallback: true,
                };
                (route, Some(name.to_string()))
            }
        }
    }

    pub(crate) fn report_fallback(
        &self,
        meta: &FlowMeta,
        destination: Option<SocketAddr>,
        requested: &str,
        used: Option<&str>,
        reason: &str,
    ) {
        warn!(
            requested,
            used = used.unwrap_or("system"),
            "Interface unusable ({}), falling back",
            reason
        );
        self.events.publish(RouterEvent::Flow(FlowEvent::Fallback {
            flow_id: meta.id,
            destination,
            requested: requested.to_string(),
            used: used.map(str::to_string),
            reason: reason.to_string(),
        }));
    }

    /// Take the interface off `route` after a bind failure, if allowed
    fn retry_target(&self, route: &mut Route, err: &OutboundError) -> Option<String> {
        if !err.is_bind_failure() || !self.settings.retry_unbound {
            return None;
        }
        let requested = route.interface.take()?;
        route.fallback = true;
        Some(requested)
    }

    /// Connect through the route's interface, retrying once unbound when
    /// the interface cannot be bound.
    pub(crate) async fn connect_tcp(
        &self,
        meta: &FlowMeta,
        destination: SocketAddr,
        route: &mut Route,
    ) -> Result<OutboundConnection, OutboundError> {
        let timeout = self.settings.connect_timeout;
        match self
            .dialer
            .connect_tcp(destination, route.interface.as_deref(), timeout)
            .await
        {
            Err(e) => match self.retry_target(route, &e) {
                Some(requested) => {
                    self.report_fallback(meta, Some(destination), &requested, None, &e.to_string());
                    self.dialer.connect_tcp(destination, None, timeout).await
                }
                None => Err(e),
            },
            ok => ok,
        }
    }

    /// Bind a UDP socket for `peer` through the route's interface, with the
    /// same retry as [`connect_tcp`](Self::connect_tcp).
    pub(crate) async fn bind_udp(
        &self,
        meta: &FlowMeta,
        peer: SocketAddr,
        route: &mut Route,
    ) -> Result<UdpSocket, OutboundError> {
        match self.dialer.bind_udp(peer, route.interface.as_deref()).await {
            Err(e) => match self.retry_target(route, &e) {
                Some(requested) => {
                    self.report_fallback(meta, Some(peer), &requested, None, &e.to_string());
                    self.dialer.bind_udp(peer, None).await
                }
                None => Err(e),
            },
            ok => ok,
        }
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("rules", &self.rules)
            .field("interfaces", &self.interfaces)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Publishes state and fires the completion.
///
/// Dropping an unfinished guard (the task was aborted) reports the flow as
/// cancelled. Handlers declare the guard before any flow resource so that
/// it is dropped last.
pub(crate) struct CompletionGuard {
    state: watch::Sender<FlowState>,
    callback: Option<CompletionFn>,
    outcome: FlowOutcome,
    started: Instant,
}

impl CompletionGuard {
    fn new(meta: &FlowMeta, state: watch::Sender<FlowState>, callback: Option<CompletionFn>) -> Self {
        Self {
            state,
            callback,
            outcome: FlowOutcome::new(meta),
            started: Instant::now(),
        }
    }

    /// Move to `next`; illegal transitions are ignored
    pub(crate) fn transition(&self, next: FlowState) {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                debug!(from = %current, to = %next, "Ignoring flow state transition");
                false
            }
        });
    }

    pub(crate) fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub(crate) fn record_route(&mut self, route: &Route) {
        self.outcome.interface.clone_from(&route.interface);
        if route.rule_id.is_some() {
            self.outcome.rule_id.clone_from(&route.rule_id);
        }
        self.outcome.fallback |= route.fallback;
    }

    pub(crate) fn note_fallback(&mut self) {
        self.outcome.fallback = true;
    }

    pub(crate) fn record_bytes(&mut self, bytes: CopyResult) {
        self.outcome.set_bytes(bytes);
    }

    /// Enter `Errored` and produce the failed status
    pub(crate) fn fail(&self, err: &FlowError) -> FlowStatus {
        if err.is_recoverable() {
            debug!("Flow failed: {}", err);
        } else {
            warn!("Flow failed: {}", err);
        }
        self.transition(FlowState::Errored);
        FlowStatus::Failed(err.to_string())
    }

    /// Enter `Closing` because of cancellation
    pub(crate) fn cancelled(&self) -> FlowStatus {
        debug!(state = %self.state(), "Flow cancelled");
        self.transition(FlowState::Closing);
        FlowStatus::Cancelled
    }

    fn fire(&mut self) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        self.outcome.duration = self.started.elapsed();
        self.state.send_if_modified(|current| {
            let changed = *current != FlowState::Closed;
            *current = FlowState::Closed;
            changed
        });
        callback(self.outcome.clone());
    }

    fn finish(mut self, status: FlowStatus) -> FlowOutcome {
        self.outcome.status = status;
        self.fire();
        self.callback = None;
        let mut outcome = self.outcome.clone();
        outcome.duration = self.started.elapsed();
        outcome
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.callback.is_some() {
            self.outcome.status = FlowStatus::Cancelled;
            self.fire();
        } else {
            self.state.send_replace(FlowState::Closed);
        }
    }
}

/// Drives one flow from `Created` to `Closed`
pub struct FlowHandler {
    meta: FlowMeta,
    inbound: InboundFlow,
    ctx: Arc<FlowContext>,
    cancel: CancellationToken,
    state: watch::Sender<FlowState>,
    completion: Option<CompletionFn>,
}

impl FlowHandler {
    pub fn new(
        meta: FlowMeta,
        inbound: InboundFlow,
        ctx: Arc<FlowContext>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(FlowState::Created);
        Self {
            meta,
            inbound,
            ctx,
            cancel,
            state,
            completion: None,
        }
    }

    /// Set the completion callback; it runs after all flow resources are
    /// released.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(FlowOutcome) + Send + 'static,
    {
        self.completion = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub const fn meta(&self) -> &FlowMeta {
        &self.meta
    }

    /// Observe state transitions
    #[must_use]
    pub fn state(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Token that cancels this flow
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the flow to completion and return its outcome
    pub async fn run(self) -> FlowOutcome {
        let Self {
            meta,
            inbound,
            ctx,
            cancel,
            state,
            completion,
        } = self;
        let mut guard = CompletionGuard::new(&meta, state, completion);

        let span = info_span!(
            "flow",
            id = meta.id,
            proto = %meta.protocol,
            dst = ?meta.destination,
        );
        let status = async {
            match inbound {
                InboundFlow::Tcp(stream) => drive_tcp(&meta, &ctx, &cancel, &mut guard, stream).await,
                InboundFlow::Udp(flow) => drive_udp(&meta, &ctx, &cancel, &mut guard, flow).await,
            }
        }
        .instrument(span)
        .await;

        let outcome = guard.finish(status);
        debug!(
            id = outcome.flow_id,
            up = outcome.bytes_up,
            down = outcome.bytes_down,
            "Flow closed: {:?}",
            outcome.status
        );
        outcome
    }
}

impl std::fmt::Debug for FlowHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandler")
            .field("meta", &self.meta)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

async fn drive_tcp(
    meta: &FlowMeta,
    ctx: &FlowContext,
    cancel: &CancellationToken,
    guard: &mut CompletionGuard,
    stream: BoxedStream,
) -> FlowStatus {
    guard.transition(FlowState::Matching);
    let Some(destination) = meta.destination else {
        return guard.fail(&FlowError::NoDestination);
    };

    let mut route = ctx.resolve(meta, Some(destination.ip()), Some(destination));
    guard.record_route(&route);
    if cancel.is_cancelled() {
        return guard.cancelled();
    }

    guard.transition(FlowState::Connecting);
    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => return guard.cancelled(),
        result = ctx.connect_tcp(meta, destination, &mut route) => result,
    };
    guard.record_route(&route);

    let upstream = match connected {
        Ok(conn) => conn,
        Err(e) => return guard.fail(&FlowError::Outbound(e)),
    };

    info!(
        "Relaying {:?} -> {} via {}",
        meta.source,
        destination,
        upstream.interface().unwrap_or("system route")
    );
    guard.transition(FlowState::Relaying);

    let mut relay = Relay::new(stream, upstream.into_stream(), ctx.settings.buffer_size);
    let finished = tokio::select! {
        result = &mut relay => Some(result),
        () = cancel.cancelled() => None,
    };

    match finished {
        Some(Ok(bytes)) => {
            guard.record_bytes(bytes);
            guard.transition(FlowState::Closing);
            FlowStatus::Completed
        }
        Some(Err(e)) => {
            guard.record_bytes(e.progress);
            guard.fail(&FlowError::transfer(e.to_string()))
        }
        None => {
            guard.record_bytes(relay.progress());
            let status = guard.cancelled();
            if !relay.shutdown(ctx.settings.cancel_deadline).await {
                debug!("Writer shutdown exceeded cancel deadline");
            }
            status
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    use crate::interface::{InterfaceKind, NetworkInterface, StaticInterfaceProvider};
    use crate::rules::{Rule, RuleKind};

    /// Dialer that ignores interfaces and records what was asked for
    #[derive(Default)]
    pub(crate) struct RecordingDialer {
        pub requested: Mutex<Vec<Option<String>>>,
        pub unbindable: Option<String>,
        pub refuse: bool,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn connect_tcp(
            &self,
            addr: SocketAddr,
            interface: Option<&str>,
            _connect_timeout: Duration,
        ) -> Result<OutboundConnection, OutboundError> {
            self.requested.lock().push(interface.map(str::to_string));
            if interface.is_some() && interface == self.unbindable.as_deref() {
                return Err(OutboundError::bind_device(interface.unwrap_or_default(), "No such device"));
            }
            if self.refuse {
                return Err(OutboundError::connection_failed(addr, "refused"));
            }
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;
            Ok(OutboundConnection::new(stream, addr, interface.map(str::to_string)))
        }

        async fn bind_udp(
            &self,
            peer: SocketAddr,
            interface: Option<&str>,
        ) -> Result<UdpSocket, OutboundError> {
            self.requested.lock().push(interface.map(str::to_string));
            if interface.is_some() && interface == self.unbindable.as_deref() {
                return Err(OutboundError::bind_device(interface.unwrap_or_default(), "No such device"));
            }
            let bind: SocketAddr = if peer.is_ipv4() {
                "127.0.0.1:0".parse().unwrap()
            } else {
                "[::1]:0".parse().unwrap()
            };
            UdpSocket::bind(bind).await.map_err(OutboundError::IoError)
        }
    }

    pub(crate) fn context(
        rules: Vec<Rule>,
        interfaces: Vec<NetworkInterface>,
        dialer: Arc<dyn Dialer>,
        settings: FlowSettings,
    ) -> Arc<FlowContext> {
        let events = EventBus::default();
        let rule_set = Arc::new(RuleSet::with_event_bus(events.clone()));
        rule_set.publish(rules, crate::events::ChangeKind::Reload);
        let provider = Arc::new(StaticInterfaceProvider::new(interfaces));
        let registry = Arc::new(InterfaceRegistry::new(provider, events.clone()));
        registry.refresh().unwrap();
        Arc::new(FlowContext::new(rule_set, registry, dialer, events, settings))
    }

    fn iface(name: &str, active: bool) -> NetworkInterface {
        NetworkInterface::new(name, InterfaceKind::Ethernet).with_active(active)
    }

    fn loopback_rule(interface: &str) -> Rule {
        Rule::new(RuleKind::Cidr, "127.0.0.0/8", interface).unwrap()
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_flow_relays_through_matched_interface() {
        let server = echo_server().await;
        let dialer = Arc::new(RecordingDialer::default());
        let ctx = context(
            vec![loopback_rule("eth1")],
            vec![iface("eth1", true)],
            dialer.clone(),
            FlowSettings::default(),
        );

        let (mut client, inbound) = tokio::io::duplex(1024);
        let handler = FlowHandler::new(
            FlowMeta::tcp(None, server),
            InboundFlow::tcp(inbound),
            ctx,
            CancellationToken::new(),
        );
        let state = handler.state();
        let task = tokio::spawn(handler.run());

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello");

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, FlowStatus::Completed);
        assert_eq!(outcome.interface.as_deref(), Some("eth1"));
        assert_eq!((outcome.bytes_up, outcome.bytes_down), (5, 5));
        assert!(!outcome.fallback);
        assert_eq!(*state.borrow(), FlowState::Closed);
        assert_eq!(dialer.requested.lock().as_slice(), &[Some("eth1".to_string())]);
    }

    #[tokio::test]
    async fn test_inactive_interface_falls_back_with_event() {
        let server = echo_server().await;
        let dialer = Arc::new(RecordingDialer::default());
        let ctx = context(
            vec![loopback_rule("eth1")],
            vec![iface("eth1", false), iface("eth0", true)],
            dialer.clone(),
            FlowSettings {
                default_interface: Some("eth0".into()),
                ..FlowSettings::default()
            },
        );
        let mut events = ctx.events.subscribe();

        let (mut client, inbound) = tokio::io::duplex(1024);
        let handler = FlowHandler::new(
            FlowMeta::tcp(None, server),
            InboundFlow::tcp(inbound),
            ctx,
            CancellationToken::new(),
        );
        let task = tokio::spawn(handler.run());
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        let outcome = task.await.unwrap();
        assert!(outcome.status.is_completed());
        assert!(outcome.fallback);
        assert_eq!(outcome.interface.as_deref(), Some("eth0"));

        match events.recv().await.unwrap() {
            RouterEvent::Flow(FlowEvent::Fallback { requested, used, .. }) => {
                assert_eq!(requested, "eth1");
                assert_eq!(used.as_deref(), Some("eth0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_retries_unbound() {
        let server = echo_server().await;
        let dialer = Arc::new(RecordingDialer {
            unbindable: Some("eth1".into()),
            ..RecordingDialer::default()
        });
        let ctx = context(
            vec![loopback_rule("eth1")],
            vec![iface("eth1", true)],
            dialer.clone(),
            FlowSettings::default(),
        );

        let (mut client, inbound) = tokio::io::duplex(1024);
        let task = tokio::spawn(
            FlowHandler::new(
                FlowMeta::tcp(None, server),
                InboundFlow::tcp(inbound),
                ctx,
                CancellationToken::new(),
            )
            .run(),
        );
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        let outcome = task.await.unwrap();
        assert!(outcome.status.is_completed());
        assert!(outcome.fallback);
        assert_eq!(outcome.interface, None);
        assert_eq!(
            dialer.requested.lock().as_slice(),
            &[Some("eth1".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_once() {
        let dialer = Arc::new(RecordingDialer {
            refuse: true,
            ..RecordingDialer::default()
        });
        let ctx = context(vec![], vec![], dialer, FlowSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let (_client, inbound) = tokio::io::duplex(64);
        let handler = FlowHandler::new(
            FlowMeta::tcp(None, "127.0.0.1:9".parse().unwrap()),
            InboundFlow::tcp(inbound),
            ctx,
            CancellationToken::new(),
        )
        .on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let state = handler.state();

        let outcome = handler.run().await;
        assert!(outcome.status.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), FlowState::Closed);
    }

    #[tokio::test]
    async fn test_tcp_flow_without_destination_fails() {
        let ctx = context(vec![], vec![], Arc::new(RecordingDialer::default()), FlowSettings::default());
        let (_client, inbound) = tokio::io::duplex(64);
        let mut meta = FlowMeta::tcp(None, "127.0.0.1:9".parse().unwrap());
        meta.destination = None;

        let outcome = FlowHandler::new(meta, InboundFlow::tcp(inbound), ctx, CancellationToken::new())
            .run()
            .await;
        assert_eq!(
            outcome.status,
            FlowStatus::Failed(FlowError::NoDestination.to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_during_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        // Accept and hold the connection open without reading
        let held = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let ctx = context(vec![], vec![], Arc::new(RecordingDialer::default()), FlowSettings::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let (mut client, inbound) = tokio::io::duplex(1024);
        let handler = FlowHandler::new(
            FlowMeta::tcp(None, server),
            InboundFlow::tcp(inbound),
            ctx,
            cancel.clone(),
        )
        .on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        let mut state = handler.state();
        let task = tokio::spawn(handler.run());

        client.write_all(b"abc").await.unwrap();
        state
            .wait_for(|s| *s == FlowState::Relaying)
            .await
            .unwrap();
        let _server_side = held.await.unwrap().unwrap();

        cancel.cancel();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, FlowStatus::Cancelled);
        assert_eq!(task.await.unwrap().status, FlowStatus::Cancelled);
        assert_eq!(*state.borrow(), FlowState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let ctx = context(vec![], vec![], Arc::new(RecordingDialer::default()), FlowSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_client, inbound) = tokio::io::duplex(64);
        let outcome = FlowHandler::new(
            FlowMeta::tcp(None, "127.0.0.1:9".parse().unwrap()),
            InboundFlow::tcp(inbound),
            ctx,
            cancel,
        )
        .run()
        .await;
        assert!(outcome.status.is_cancelled());
    }

    #[tokio::test]
    async fn test_aborted_task_still_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        let held = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let ctx = context(vec![], vec![], Arc::new(RecordingDialer::default()), FlowSettings::default());
        let (tx, rx) = oneshot::channel();
        let (_client, inbound) = tokio::io::duplex(64);
        let handler = FlowHandler::new(
            FlowMeta::tcp(None, server),
            InboundFlow::tcp(inbound),
            ctx,
            CancellationToken::new(),
        )
        .on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        let mut state = handler.state();
        let task = tokio::spawn(handler.run());
        state
            .wait_for(|s| *s == FlowState::Relaying)
            .await
            .unwrap();
        let _server_side = held.await.unwrap().unwrap();

        task.abort();
        let outcome = rx.await.unwrap();
        assert!(outcome.status.is_cancelled());
    }
}
