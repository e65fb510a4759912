//! Tunnel plumbing
//!
//! A tunnel is the IPv6 carrier (typically QUIC) from host to device. The
//! TUN/QUIC driver itself is an external collaborator; this module holds the
//! pieces the rest of the crate needs: the live [`TunnelConnection`] record,
//! the packet-source interface that driver exposes, and the process-local
//! registry with its HTTP discovery API.

mod registry;
mod server;
mod strongbox;

pub use registry::{RegistryMetadata, SharedRegistry, TunnelRegistry, TunnelRegistryEntry};
pub use server::{registry_router, RegistryServer};
pub use strongbox::Strongbox;

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

/// Transport protocol of a decoded tunnel packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketProtocol {
    Tcp,
    Udp,
}

/// One IP packet decoded from the tunnel
#[derive(Debug, Clone)]
pub struct Packet {
    pub protocol: PacketProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Receiving end of a packet subscription
///
/// Created with [`PacketConsumer::new`]; hand the consumer to a
/// [`PacketSource`] and pull packets from the returned receiver.
#[derive(Debug)]
pub struct PacketConsumer {
    id: u64,
    sender: mpsc::UnboundedSender<Packet>,
}

impl PacketConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A multi-producer feed of IP packets decoded from the tunnel
///
/// Implemented by the external tunnel driver. Adding and removing a
/// consumer is thread-safe and idempotent; closing the tunnel stops
/// delivery.
pub trait PacketSource: Send + Sync {
    fn add_packet_consumer(&self, consumer: PacketConsumer);
    fn remove_packet_consumer(&self, consumer_id: u64);
}

/// In-process [`PacketSource`] that fans packets out to every registered
/// consumer. The tunnel driver feeds it with [`PacketBroadcaster::deliver`].
#[derive(Default)]
pub struct PacketBroadcaster {
    consumers: Mutex<Vec<PacketConsumer>>,
}

impl PacketBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fans a packet out to all consumers, dropping any whose receiver has
    /// gone away
    pub fn deliver(&self, packet: Packet) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|c| c.sender.send(packet.clone()).is_ok());
    }
}

impl PacketSource for PacketBroadcaster {
    fn add_packet_consumer(&self, consumer: PacketConsumer) {
        let mut consumers = self.consumers.lock().unwrap();
        if consumers.iter().any(|c| c.id == consumer.id) {
            return;
        }
        consumers.push(consumer);
    }

    fn remove_packet_consumer(&self, consumer_id: u64) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|c| c.id != consumer_id);
    }
}

/// A live carrier into a device
///
/// The address is unique per live tunnel. Closing is idempotent; a closed
/// tunnel must be treated as unusable.
pub struct TunnelConnection {
    /// IPv6 address of the device end inside the tunnel
    pub address: Ipv6Addr,
    /// Port the RSD catalog listens on inside the tunnel
    pub rsd_port: u16,
    packet_source: Arc<dyn PacketSource>,
    closed: AtomicBool,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TunnelConnection {
    pub fn new(
        address: Ipv6Addr,
        rsd_port: u16,
        packet_source: Arc<dyn PacketSource>,
        closer: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            address,
            rsd_port,
            packet_source,
            closed: AtomicBool::new(false),
            closer: Mutex::new(Some(closer)),
        }
    }

    /// The packet feed for this tunnel
    pub fn packet_source(&self) -> Arc<dyn PacketSource> {
        self.packet_source.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the tunnel down. Safe to call multiple times; only the first
    /// call runs the closer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing tunnel to [{}]:{}", self.address, self.rsd_port);
        if let Some(closer) = self.closer.lock().unwrap().take() {
            closer();
        }
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn packet(n: u8) -> Packet {
        Packet {
            protocol: PacketProtocol::Tcp,
            src: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_port: 1000,
            dest_port: 2000,
            payload: vec![n],
        }
    }

    #[tokio::test]
    async fn broadcaster_fans_out() {
        let source = PacketBroadcaster::new();
        let (consumer_a, mut rx_a) = PacketConsumer::new();
        let (consumer_b, mut rx_b) = PacketConsumer::new();
        source.add_packet_consumer(consumer_a);
        source.add_packet_consumer(consumer_b);

        source.deliver(packet(1));
        assert_eq!(rx_a.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx_b.recv().await.unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn remove_consumer_is_idempotent() {
        let source = PacketBroadcaster::new();
        let (consumer, mut rx) = PacketConsumer::new();
        let id = consumer.id();
        source.add_packet_consumer(consumer);
        source.remove_packet_consumer(id);
        source.remove_packet_consumer(id);

        source.deliver(packet(2));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn tunnel_close_runs_closer_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let tunnel = TunnelConnection::new(
            "fe80::1".parse().unwrap(),
            58783,
            Arc::new(PacketBroadcaster::new()),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!tunnel.is_closed());
        tunnel.close();
        tunnel.close();
        assert!(tunnel.is_closed());
        drop(tunnel);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
