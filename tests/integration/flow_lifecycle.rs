//! Flow manager end to end on loopback
//!
//! Rules point at interfaces that the static provider reports as down, so
//! every flow falls back to the unbound system route and the real
//! [`DirectDialer`] can be used without `CAP_NET_ADMIN`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};

use iface_router::events::{EventBus, FlowEvent, RouterEvent};
use iface_router::flow::{
    Datagram, DatagramFlow, FlowContext, FlowManager, FlowMeta, FlowSettings, FlowState,
    FlowStatus, InboundFlow,
};
use iface_router::interface::{
    InterfaceKind, InterfaceRegistry, NetworkInterface, StaticInterfaceProvider,
};
use iface_router::outbound::DirectDialer;
use iface_router::rules::{Rule, RuleKind, RuleSet};
use iface_router::{events::ChangeKind, FlowError};

fn manager(max_flows: usize) -> (Arc<FlowManager>, EventBus) {
    let events = EventBus::default();
    let rules = Arc::new(RuleSet::with_event_bus(events.clone()));
    rules.publish(
        vec![Rule::with_id("loopback", RuleKind::Cidr, "127.0.0.0/8", "wlan9").unwrap()],
        ChangeKind::Reload,
    );

    let provider = StaticInterfaceProvider::new(vec![
        NetworkInterface::new("eth0", InterfaceKind::Ethernet).with_active(true),
        NetworkInterface::new("wlan9", InterfaceKind::WiFi).with_active(false),
    ]);
    let interfaces = Arc::new(InterfaceRegistry::new(Arc::new(provider), events.clone()));
    interfaces.refresh().unwrap();

    let ctx = Arc::new(FlowContext::new(
        rules,
        interfaces,
        Arc::new(DirectDialer::default()),
        events.clone(),
        FlowSettings {
            udp_idle_timeout: Duration::from_secs(2),
            ..FlowSettings::default()
        },
    ));
    (
        Arc::new(FlowManager::with_limits(ctx, max_flows, Duration::from_secs(2))),
        events,
    )
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

/// Accepts and then never reads or writes
async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn test_tcp_flow_falls_back_and_relays() {
    let (manager, events) = manager(8);
    let mut rx = events.subscribe();
    let server = echo_server().await;

    let (mut client, inbound) = tokio::io::duplex(4096);
    let handle = manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .unwrap();

    client.write_all(b"through the system route").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"through the system route");

    let outcome = handle.join().await.unwrap();
    assert_eq!(outcome.status, FlowStatus::Completed);
    assert_eq!(outcome.rule_id.as_deref(), Some("loopback"));
    assert!(outcome.fallback);
    assert!(outcome.interface.is_none());
    assert_eq!(outcome.bytes_up, 24);
    assert_eq!(outcome.bytes_down, 24);

    let fallback = loop {
        match rx.recv().await.unwrap() {
            RouterEvent::Flow(FlowEvent::Fallback { requested, used, .. }) => break (requested, used),
            _ => continue,
        }
    };
    assert_eq!(fallback, ("wlan9".to_string(), None));

    let stats = manager.stats_snapshot();
    assert_eq!(stats.total_accepted, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn test_limit_rejects_until_a_flow_finishes() {
    let (manager, _events) = manager(1);
    let server = silent_server().await;

    let (_client, inbound) = tokio::io::duplex(1024);
    let first = manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .unwrap();

    let (_other, inbound) = tokio::io::duplex(1024);
    let err = manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .unwrap_err();
    assert!(matches!(err, FlowError::LimitReached { max: 1, .. }));

    first.cancel();
    let outcome = first.join().await.unwrap();
    assert!(outcome.status.is_cancelled());

    let (_third, inbound) = tokio::io::duplex(1024);
    assert!(manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .is_ok());
    assert_eq!(manager.stats_snapshot().rejected, 1);
}

#[tokio::test]
async fn test_shutdown_cancels_live_flows() {
    let (manager, _events) = manager(4);
    let server = silent_server().await;

    let (_client, inbound) = tokio::io::duplex(1024);
    let handle = manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .unwrap();
    let mut state = handle.state();
    state
        .wait_for(|s| *s == FlowState::Relaying)
        .await
        .unwrap();

    manager.shutdown().await;
    assert_eq!(manager.active_flows(), 0);
    assert!(manager.is_shutting_down());

    let outcome = handle.join().await.unwrap();
    assert!(outcome.status.is_cancelled());

    let (_late, inbound) = tokio::io::duplex(1024);
    let err = manager
        .admit(FlowMeta::tcp(None, server), InboundFlow::tcp(inbound))
        .unwrap_err();
    assert!(matches!(err, FlowError::ShuttingDown));
}

/// Accepts one connection and hands the server side to the test
async fn capturing_server() -> (SocketAddr, oneshot::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let _ = tx.send(socket);
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn test_cancelling_one_flow_releases_its_upstream_only() {
    let (manager, _events) = manager(4);
    let (held_addr, held) = capturing_server().await;
    let echo = echo_server().await;

    let (_a_client, inbound) = tokio::io::duplex(1024);
    let a = manager
        .admit(FlowMeta::tcp(None, held_addr), InboundFlow::tcp(inbound))
        .unwrap();
    let (mut b_client, inbound) = tokio::io::duplex(1024);
    let b = manager
        .admit(FlowMeta::tcp(None, echo), InboundFlow::tcp(inbound))
        .unwrap();

    let mut upstream = held.await.unwrap();
    for handle in [&a, &b] {
        let mut state = handle.state();
        state.wait_for(|s| *s == FlowState::Relaying).await.unwrap();
    }

    a.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), a.join())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.status.is_cancelled());

    // EOF or reset both mean the outbound socket is gone
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), upstream.read(&mut buf))
        .await
        .expect("upstream still open after cancel");
    assert!(matches!(read, Ok(0) | Err(_)));

    b_client.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(2), b_client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"still here");

    b_client.shutdown().await.unwrap();
    let outcome = b.join().await.unwrap();
    assert_eq!(outcome.status, FlowStatus::Completed);
    assert_eq!(manager.stats_snapshot().cancelled, 1);
}

struct ChannelFlow {
    inbound: Mutex<mpsc::Receiver<Datagram>>,
    replies: mpsc::Sender<(Vec<u8>, SocketAddr)>,
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

#[tokio::test]
async fn test_udp_association_round_trip() {
    let (manager, _events) = manager(4);

    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let (in_tx, in_rx) = mpsc::channel(8);
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let flow = Arc::new(ChannelFlow {
        inbound: Mutex::new(in_rx),
        replies: out_tx,
    });
    let handle = manager
        .admit(FlowMeta::udp(None, None), InboundFlow::Udp(flow))
        .unwrap();

    in_tx
        .send(Datagram {
            payload: bytes::Bytes::from_static(b"query"),
            destination: echo_addr,
        })
        .await
        .unwrap();
    let (payload, from) = out_rx.recv().await.unwrap();
    assert_eq!(payload, b"query");
    assert_eq!(from, echo_addr);

    drop(in_tx);
    let outcome = handle.join().await.unwrap();
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.bytes_up, 5);
    assert_eq!(outcome.bytes_down, 5);
    assert!(outcome.fallback);
}
