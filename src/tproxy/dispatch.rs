//! Hand intercepted traffic to the flow manager
//!
//! TCP is one flow per accepted connection. UDP arrives on a single socket,
//! so datagrams are demultiplexed by client address into associations; each
//! association is one flow whose replies leave through transparent sockets
//! bound to the address the client originally targeted.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};

use super::listener::TproxyListener;
use super::socket::SocketProvider;
use super::udp_listener::{TproxyUdpListener, UdpPacketInfo};
use crate::error::{FlowError, TproxyError};
use crate::flow::{Datagram, DatagramFlow, FlowManager, FlowMeta, InboundFlow};

/// Accept redirected TCP connections until the manager shuts down.
///
/// # Errors
///
/// Returns the first non-recoverable listener error.
pub async fn run_accept_loop(
    listener: TproxyListener,
    manager: Arc<FlowManager>,
) -> Result<(), TproxyError> {
    let shutdown = manager.cancel_token();
    loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                let (meta, inbound) = conn.into_flow();
                if let Err(e) = manager.admit(meta, inbound) {
                    debug!("TCP flow not admitted: {}", e);
                }
            }
            Err(e) if e.is_recoverable() => warn!("TCP accept failed: {}", e),
            Err(e) => {
                error!("TCP listener on {} failed: {}", listener.listen_addr(), e);
                return Err(e);
            }
        }
    }

    debug!("TCP accept loop on {} stopped", listener.listen_addr());
    Ok(())
}

/// Receive redirected datagrams until the manager shuts down.
///
/// # Errors
///
/// Returns the first non-recoverable listener error.
pub async fn run_udp_loop(
    listener: TproxyUdpListener,
    demux: UdpDemux,
) -> Result<(), TproxyError> {
    let shutdown = demux.manager.cancel_token();
    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = listener.recv_packet() => received,
        };

        match received {
            Ok(packet) => {
                if let Err(e) = demux.dispatch(packet) {
                    debug!("UDP association not admitted: {}", e);
                }
            }
            Err(e) if e.is_recoverable() => warn!("UDP receive failed: {}", e),
            Err(e) => {
                error!("UDP listener on {} failed: {}", listener.listen_addr(), e);
                return Err(e);
            }
        }
    }

    debug!("UDP loop on {} stopped", listener.listen_addr());
    Ok(())
}

/// Routes datagrams to the association of their client
pub struct UdpDemux {
    manager: Arc<FlowManager>,
    provider: Arc<dyn SocketProvider>,
    associations: Arc<DashMap<SocketAddr, mpsc::Sender<Datagram>>>,
    capacity: usize,
}

impl UdpDemux {
    #[must_use]
    pub fn new(manager: Arc<FlowManager>, provider: Arc<dyn SocketProvider>) -> Self {
        let capacity = manager.context().settings.udp_channel_capacity.max(1);
        Self {
            manager,
            provider,
            associations: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Deliver a datagram to its association, opening one for new clients.
    ///
    /// Datagrams are dropped while the association's queue is full.
    ///
    /// # Errors
    ///
    /// Returns the admission error if a new association is refused.
    pub fn dispatch(&self, packet: UdpPacketInfo) -> Result<(), FlowError> {
        let client = packet.client_addr;
        let mut datagram = Datagram {
            payload: packet.data,
            destination: packet.original_dst,
        };

        let existing = self
            .associations
            .get(&client)
            .map(|entry| entry.value().clone());
        if let Some(sender) = existing {
            match sender.try_send(datagram) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    trace!("Association queue for {} full, dropping datagram", client);
                    return Ok(());
                }
                Err(TrySendError::Closed(returned)) => {
                    self.associations
                        .remove_if(&client, |_, current| current.same_channel(&sender));
                    datagram = returned;
                }
            }
        }

        self.open(client, datagram)
    }

    fn open(&self, client: SocketAddr, first: Datagram) -> Result<(), FlowError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let meta = FlowMeta::udp(Some(client), Some(first.destination));
        // A fresh channel always has room for one
        let _ = tx.try_send(first);

        let association = TproxyAssociation::new(client, rx, Arc::clone(&self.provider));
        let handle = self
            .manager
            .admit(meta, InboundFlow::Udp(Arc::new(association)))?;
        self.associations.insert(client, tx.clone());

        let associations = Arc::clone(&self.associations);
        tokio::spawn(async move {
            let _ = handle.join().await;
            associations.remove_if(&client, |_, current| current.same_channel(&tx));
        });
        Ok(())
    }

    /// Associations currently open
    #[must_use]
    pub fn active_associations(&self) -> usize {
        self.associations.len()
    }
}

/// Client side of one UDP association
pub struct TproxyAssociation {
    client: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    reply_sockets: parking_lot::Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>,
    provider: Arc<dyn SocketProvider>,
}

impl TproxyAssociation {
    fn new(
        client: SocketAddr,
        incoming: mpsc::Receiver<Datagram>,
        provider: Arc<dyn SocketProvider>,
    ) -> Self {
        Self {
            client,
            incoming: tokio::sync::Mutex::new(incoming),
            reply_sockets: parking_lot::Mutex::new(HashMap::new()),
            provider,
        }
    }

    fn reply_socket(&self, from: SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let mut sockets = self.reply_sockets.lock();
        if let Some(socket) = sockets.get(&from) {
            return Ok(Arc::clone(socket));
        }

        let socket = self
            .provider
            .create_reply_socket(from)
            .map_err(io::Error::other)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        sockets.insert(from, Arc::clone(&socket));
        Ok(socket)
    }
}

#[async_trait]
impl DatagramFlow for TproxyAssociation {
    async fn recv(&self) -> io::Result<Option<Datagram>> {
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn send(&self, payload: &[u8], from: SocketAddr) -> io::Result<()> {
        let socket = self.reply_socket(from)?;
        socket.send_to(payload, self.client).await?;
        Ok(())
    }
}
