//! UDP association relay
//!
//! Datagrams from the client are sent from outbound sockets bound to the
//! chosen interface; replies are read by one task per socket and funneled
//! through a bounded channel back to the client. Sockets are cached per
//! (interface, address family) so [`UdpMatchPolicy::PerDatagram`] only
//! binds once per interface.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::handler::{CompletionGuard, FlowContext, Route, INACTIVE};
use super::state::FlowState;
use super::types::{Datagram, DatagramFlow, FlowMeta, FlowStatus};
use crate::config::UdpMatchPolicy;
use crate::error::{FlowError, OutboundError};
use crate::io::CopyResult;

/// Largest datagram read from an outbound socket
pub const MAX_DATAGRAM_SIZE: usize = 65535;

type SocketKey = (Option<String>, bool);

struct Association<'a> {
    meta: &'a FlowMeta,
    ctx: &'a FlowContext,
    /// Route decided from the first datagram
    route: Route,
    sockets: HashMap<SocketKey, Arc<UdpSocket>>,
    /// Inactive interfaces already reported for this association
    reported: HashSet<String>,
    readers: JoinSet<()>,
    replies: mpsc::Sender<(Bytes, SocketAddr)>,
    bytes: CopyResult,
}

impl<'a> Association<'a> {
    fn new(
        meta: &'a FlowMeta,
        ctx: &'a FlowContext,
        route: Route,
        replies: mpsc::Sender<(Bytes, SocketAddr)>,
    ) -> Self {
        Self {
            meta,
            ctx,
            route,
            sockets: HashMap::new(),
            reported: HashSet::new(),
            readers: JoinSet::new(),
            replies,
            bytes: CopyResult::default(),
        }
    }

    /// Cached socket for the route, binding a new one on first use.
    ///
    /// `route` is updated if binding had to fall back to the system route.
    async fn socket_for(
        &mut self,
        route: &mut Route,
        peer: SocketAddr,
    ) -> Result<Arc<UdpSocket>, OutboundError> {
        let key = (route.interface.clone(), peer.is_ipv6());
        if let Some(socket) = self.sockets.get(&key) {
            return Ok(Arc::clone(socket));
        }

        let socket = self.ctx.bind_udp(self.meta, peer, route).await?;
        let key = (route.interface.clone(), peer.is_ipv6());
        if let Some(existing) = self.sockets.get(&key) {
            return Ok(Arc::clone(existing));
        }

        debug!(
            interface = route.interface.as_deref().unwrap_or("system"),
            local = ?socket.local_addr().ok(),
            "Bound UDP socket"
        );
        let socket = Arc::new(socket);
        self.spawn_reader(Arc::clone(&socket));
        self.sockets.insert(key, Arc::clone(&socket));
        Ok(socket)
    }

    fn spawn_reader(&mut self, socket: Arc<UdpSocket>) {
        let replies = self.replies.clone();
        self.readers.spawn(
            async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let payload = Bytes::copy_from_slice(&buf[..n]);
                            if replies.send((payload, from)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("UDP reply socket error: {}", e);
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn route_for(&mut self, datagram: &Datagram) -> Route {
        match self.ctx.settings.udp_policy {
            UdpMatchPolicy::PerAssociation => self.route.clone(),
            UdpMatchPolicy::PerDatagram => {
                let destination = datagram.destination;
                let (route, unusable) = self.ctx.pick_route(self.meta, Some(destination.ip()));
                if let Some(requested) = unusable {
                    self.report_once(requested, destination, &route);
                }
                route
            }
        }
    }

    /// Fallback warning and event, once per requested interface
    fn report_once(&mut self, requested: String, destination: SocketAddr, route: &Route) {
        if self.reported.contains(&requested) {
            return;
        }
        let used = route.interface.as_deref();
        self.ctx
            .report_fallback(self.meta, Some(destination), &requested, used, INACTIVE);
        self.reported.insert(requested);
    }

    /// Send one datagram upstream. Failures drop the datagram only.
    /// Returns true if the route fell back.
    async fn forward(&mut self, datagram: Datagram) -> bool {
        let mut route = self.route_for(&datagram);
        let socket = match self.socket_for(&mut route, datagram.destination).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Dropping datagram to {}: {}", datagram.destination, e);
                return route.fallback;
            }
        };

        match socket.send_to(&datagram.payload, datagram.destination).await {
            Ok(n) => self.bytes.client_to_upstream += n as u64,
            Err(e) => debug!("Dropping datagram to {}: {}", datagram.destination, e),
        }
        route.fallback
    }

    async fn close(mut self) -> CopyResult {
        self.readers.shutdown().await;
        self.sockets.clear();
        self.bytes
    }
}

/// Relay a UDP association until the client closes it, it idles out or
/// `cancel` fires.
pub(crate) async fn drive_udp(
    meta: &FlowMeta,
    ctx: &FlowContext,
    cancel: &CancellationToken,
    guard: &mut CompletionGuard,
    flow: Arc<dyn DatagramFlow>,
) -> FlowStatus {
    let idle = ctx.settings.udp_idle_timeout;
    guard.transition(FlowState::Matching);

    let first = tokio::select! {
        biased;
        () = cancel.cancelled() => return guard.cancelled(),
        received = tokio::time::timeout(idle, flow.recv()) => received,
    };
    let first = match first {
        Ok(Ok(Some(datagram))) => datagram,
        Ok(Ok(None)) | Err(_) => {
            debug!("UDP association ended before any datagram");
            guard.transition(FlowState::Closing);
            return FlowStatus::Completed;
        }
        Ok(Err(e)) => return guard.fail(&FlowError::IoError(e)),
    };

    let destination = meta.destination.unwrap_or(first.destination);
    let (mut route, unusable) = ctx.pick_route(meta, Some(destination.ip()));

    guard.transition(FlowState::Connecting);
    let (reply_tx, mut reply_rx) = mpsc::channel(ctx.settings.udp_channel_capacity);
    let mut assoc = Association::new(meta, ctx, route.clone(), reply_tx);
    if let Some(requested) = unusable {
        assoc.report_once(requested, destination, &route);
    }
    let bound = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        bound = assoc.socket_for(&mut route, first.destination) => Some(bound),
    };
    guard.record_route(&route);
    match bound {
        None => {
            let status = guard.cancelled();
            assoc.close().await;
            return status;
        }
        Some(Err(e)) => {
            let status = guard.fail(&FlowError::Outbound(e));
            assoc.close().await;
            return status;
        }
        Some(Ok(_)) => {}
    }
    assoc.route = route;

    guard.transition(FlowState::Relaying);
    if assoc.forward(first).await {
        guard.note_fallback();
    }

    let idle_timer = sleep(idle);
    tokio::pin!(idle_timer);

    let status = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break guard.cancelled(),
            () = &mut idle_timer => {
                debug!("UDP association idle for {:?}", idle);
                break FlowStatus::Completed;
            }
            received = flow.recv() => match received {
                Ok(Some(datagram)) => {
                    idle_timer.as_mut().reset(Instant::now() + idle);
                    if assoc.forward(datagram).await {
                        guard.note_fallback();
                    }
                }
                Ok(None) => break FlowStatus::Completed,
                Err(e) => break guard.fail(&FlowError::IoError(e)),
            },
            Some((payload, from)) = reply_rx.recv() => {
                idle_timer.as_mut().reset(Instant::now() + idle);
                match flow.send(&payload, from).await {
                    Ok(()) => assoc.bytes.upstream_to_client += payload.len() as u64,
                    Err(e) => break guard.fail(&FlowError::IoError(e)),
                }
            }
        }
    };

    if guard.state() == FlowState::Relaying {
        guard.transition(FlowState::Closing);
    }
    guard.record_bytes(assoc.close().await);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::flow::handler::tests::{context, RecordingDialer};
    use crate::flow::handler::FlowSettings;
    use crate::events::{FlowEvent, RouterEvent};
    use crate::flow::{FlowHandler, InboundFlow};
    use crate::interface::{InterfaceKind, NetworkInterface};
    use crate::rules::{Rule, RuleKind};

    /// In-memory client side of an association
    struct ChannelFlow {
        inbound: Mutex<mpsc::Receiver<Datagram>>,
        replies: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    }

    fn channel_flow() -> (
        Arc<ChannelFlow>,
        mpsc::Sender<Datagram>,
        mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let flow = Arc::new(ChannelFlow {
            inbound: Mutex::new(in_rx),
            replies: out_tx,
        });
        (flow, in_tx, out_rx)
    }

    #[async_trait]
    impl DatagramFlow for ChannelFlow {
        async fn recv(&self) -> std::io::Result<Option<Datagram>> {
            Ok(self.inbound.lock().await.recv().await)
        }

        async fn send(&self, payload: &[u8], from: SocketAddr) -> std::io::Result<()> {
            self.replies
                .send((payload.to_vec(), from))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    fn datagram(payload: &'static [u8], destination: SocketAddr) -> Datagram {
        Datagram {
            payload: Bytes::from_static(payload),
            destination,
        }
    }

    #[tokio::test]
    async fn test_udp_association_round_trip() {
        let echo = udp_echo().await;
        let dialer = Arc::new(RecordingDialer::default());
        let ctx = context(
            vec![Rule::new(RuleKind::Cidr, "127.0.0.1/32", "eth1").unwrap()],
            vec![NetworkInterface::new("eth1", InterfaceKind::Ethernet).with_active(true)],
            dialer.clone(),
            FlowSettings::default(),
        );
        let (flow, tx, mut replies) = channel_flow();
        let task = tokio::spawn(
            FlowHandler::new(
                crate::flow::FlowMeta::udp(None, None),
                InboundFlow::Udp(flow),
                ctx,
                CancellationToken::new(),
            )
            .run(),
        );

        tx.send(datagram(b"ping", echo)).await.unwrap();
        let (payload, from) = replies.recv().await.unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(from, echo);

        tx.send(datagram(b"again", echo)).await.unwrap();
        assert_eq!(replies.recv().await.unwrap().0, b"again");

        drop(tx);
        let outcome = task.await.unwrap();
        assert!(outcome.status.is_completed());
        assert_eq!(outcome.interface.as_deref(), Some("eth1"));
        assert_eq!(outcome.bytes_up, 9);
        assert_eq!(outcome.bytes_down, 9);
        // Per-association policy binds once
        assert_eq!(dialer.requested.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_udp_per_datagram_binds_per_interface() {
        let echo_a = udp_echo().await;
        let echo_b = udp_echo().await;
        let dialer = Arc::new(RecordingDialer::default());
        let ctx = context(
            vec![Rule::with_id("a", RuleKind::Cidr, "127.0.0.1/32", "eth1").unwrap()],
            vec![NetworkInterface::new("eth1", InterfaceKind::Ethernet).with_active(true)],
            dialer.clone(),
            FlowSettings {
                udp_policy: UdpMatchPolicy::PerDatagram,
                ..FlowSettings::default()
            },
        );
        let (flow, tx, mut replies) = channel_flow();
        let task = tokio::spawn(
            FlowHandler::new(
                crate::flow::FlowMeta::udp(None, None),
                InboundFlow::Udp(flow),
                ctx.clone(),
                CancellationToken::new(),
            )
            .run(),
        );

        tx.send(datagram(b"one", echo_a)).await.unwrap();
        assert_eq!(replies.recv().await.unwrap().0, b"one");

        // Later datagrams re-match against the current snapshot
        ctx.rules.publish(vec![], crate::events::ChangeKind::Remove);
        tx.send(datagram(b"two", echo_b)).await.unwrap();
        let (payload, from) = replies.recv().await.unwrap();
        assert_eq!(payload, b"two");
        assert_eq!(from, echo_b);

        drop(tx);
        task.await.unwrap();
        assert_eq!(
            dialer.requested.lock().as_slice(),
            &[Some("eth1".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_per_datagram_fallback_reported_once() {
        let echo = udp_echo().await;
        let ctx = context(
            vec![Rule::with_id("down", RuleKind::Cidr, "127.0.0.1/32", "eth1").unwrap()],
            vec![
                NetworkInterface::new("eth0", InterfaceKind::Ethernet).with_active(true),
                NetworkInterface::new("eth1", InterfaceKind::Ethernet).with_active(false),
            ],
            Arc::new(RecordingDialer::default()),
            FlowSettings {
                udp_policy: UdpMatchPolicy::PerDatagram,
                ..FlowSettings::default()
            },
        );
        let mut events = ctx.events.subscribe();
        let (flow, tx, mut replies) = channel_flow();
        let task = tokio::spawn(
            FlowHandler::new(
                crate::flow::FlowMeta::udp(None, None),
                InboundFlow::Udp(flow),
                ctx,
                CancellationToken::new(),
            )
            .run(),
        );

        for payload in [b"a", b"b", b"c"] {
            tx.send(datagram(payload, echo)).await.unwrap();
            assert_eq!(replies.recv().await.unwrap().0, payload);
        }
        drop(tx);
        let outcome = task.await.unwrap();
        assert!(outcome.fallback);

        let mut fallbacks = 0;
        while let Ok(event) = events.try_recv() {
            if let RouterEvent::Flow(FlowEvent::Fallback { requested, .. }) = event {
                assert_eq!(requested, "eth1");
                fallbacks += 1;
            }
        }
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_idle_timeout() {
        let ctx = context(
            vec![],
            vec![],
            Arc::new(RecordingDialer::default()),
            FlowSettings {
                udp_idle_timeout: Duration::from_secs(5),
                ..FlowSettings::default()
            },
        );
        let (flow, tx, _replies) = channel_flow();
        let echo_less: SocketAddr = "127.0.0.1:9".parse().unwrap();
        tx.send(datagram(b"x", echo_less)).await.unwrap();

        let outcome = FlowHandler::new(
            crate::flow::FlowMeta::udp(None, None),
            InboundFlow::Udp(flow),
            ctx,
            CancellationToken::new(),
        )
        .run()
        .await;
        assert!(outcome.status.is_completed());
        assert_eq!(outcome.bytes_up, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_udp_cancel_while_waiting() {
        let ctx = context(vec![], vec![], Arc::new(RecordingDialer::default()), FlowSettings::default());
        let (flow, _tx, _replies) = channel_flow();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            FlowHandler::new(
                crate::flow::FlowMeta::udp(None, None),
                InboundFlow::Udp(flow),
                ctx,
                cancel.clone(),
            )
            .run(),
        );
        cancel.cancel();
        assert!(task.await.unwrap().status.is_cancelled());
    }
}
