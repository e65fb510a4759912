//! Syslog
//!
//! The control connection only arms the stream: after check-in a
//! `StartActivity` request is sent, and the log lines themselves arrive as
//! TCP packets through the tunnel's packet source, not over the control
//! connection.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::plist::{self, PlistValue};
use crate::tunnel::{Packet, PacketConsumer, PacketProtocol, PacketSource};
use crate::RemoteXpcError;

use super::ServiceConnection;

/// An event decoded from the syslog packet stream
#[derive(Debug, Clone, PartialEq)]
pub enum SyslogEvent {
    /// One qualifying packet, stripped to printable ASCII
    Message(String),
    /// A property list embedded in a packet
    Plist(PlistValue),
}

/// Plist headers that can appear embedded in syslog packets
const PLIST_MARKERS: [&[u8]; 4] = [b"<?xml", b"<plist", b"bplist00", b"Ibplist00"];

/// Client for the syslog service
pub struct SyslogService {
    control: ServiceConnection,
    source: Arc<dyn PacketSource>,
    consumer_id: Option<u64>,
    packets: mpsc::UnboundedReceiver<Packet>,
    pending: VecDeque<SyslogEvent>,
}

impl SyslogService {
    /// The service name as advertised in the RSD catalog
    pub const SERVICE_NAME: &'static str = "com.apple.syslog_relay.shim.remote";

    /// Arms the syslog stream
    ///
    /// Sends the `StartActivity` request on the checked-in control
    /// connection and registers as a packet consumer on the tunnel.
    pub async fn start(
        mut control: ServiceConnection,
        source: Arc<dyn PacketSource>,
        pid: Option<i64>,
    ) -> Result<Self, RemoteXpcError> {
        let req = crate::plist!({
            "Request": "StartActivity",
            "MessageFilter": 65535,
            "Pid": pid.unwrap_or(-1),
            "StreamFlags": 60,
        });
        control.send_plist(&req).await?;

        let (consumer, packets) = PacketConsumer::new();
        let consumer_id = consumer.id();
        source.add_packet_consumer(consumer);
        debug!("Syslog armed, consuming packets as consumer {consumer_id}");

        Ok(Self {
            control,
            source,
            consumer_id: Some(consumer_id),
            packets,
            pending: VecDeque::new(),
        })
    }

    /// Returns the next syslog event, or `None` once the stream is torn
    /// down
    pub async fn next_event(&mut self) -> Option<SyslogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let packet = self.packets.recv().await?;
            self.pending.extend(events_from_packet(&packet));
        }
    }

    /// Tears down the packet listener and closes the control connection.
    /// Safe to call multiple times.
    pub async fn stop(&mut self) {
        if let Some(id) = self.consumer_id.take() {
            self.source.remove_packet_consumer(id);
        }
        self.control.close().await;
    }
}

/// Turns one tunnel packet into syslog events
///
/// Only TCP packets whose payload is mostly printable ASCII qualify. Each
/// qualifying packet emits one message event; an embedded plist adds a
/// plist event.
fn events_from_packet(packet: &Packet) -> Vec<SyslogEvent> {
    if packet.protocol != PacketProtocol::Tcp {
        return Vec::new();
    }
    if packet.payload.is_empty() || !is_mostly_printable(&packet.payload) {
        return Vec::new();
    }

    let mut events = Vec::with_capacity(2);
    let text: String = packet
        .payload
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|b| *b as char)
        .collect();
    events.push(SyslogEvent::Message(text));

    if let Some(value) = extract_embedded_plist(&packet.payload) {
        events.push(SyslogEvent::Plist(value));
    }
    events
}

/// More than half the bytes must be printable ASCII
fn is_mostly_printable(payload: &[u8]) -> bool {
    let printable = payload.iter().filter(|b| (0x20..=0x7E).contains(*b)).count();
    printable * 2 > payload.len()
}

fn extract_embedded_plist(payload: &[u8]) -> Option<PlistValue> {
    for marker in PLIST_MARKERS {
        if let Some(mut pos) = find_subslice(payload, marker) {
            if marker == b"Ibplist00" {
                pos += 1; // skip the stray prefix byte
            }
            if let Ok(value) = plist::parse_plist(&payload[pos..]) {
                return Some(value);
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::*;
    use crate::tunnel::PacketBroadcaster;
    use std::net::{IpAddr, Ipv6Addr};

    fn tcp_packet(payload: Vec<u8>) -> Packet {
        Packet {
            protocol: PacketProtocol::Tcp,
            src: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dst: IpAddr::V6(Ipv6Addr::LOCALHOST),
            source_port: 50011,
            dest_port: 61000,
            payload,
        }
    }

    async fn armed_service() -> (
        SyslogService,
        Arc<PacketBroadcaster>,
        tokio::io::DuplexStream,
    ) {
        let (control, mut server) = connected_pair().await;
        let source = Arc::new(PacketBroadcaster::new());

        let server_task = tokio::spawn(async move {
            let req = read_framed(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("StartActivity")
            );
            assert_eq!(
                req.get("MessageFilter").and_then(|x| x.as_signed_integer()),
                Some(65535)
            );
            assert_eq!(
                req.get("Pid").and_then(|x| x.as_signed_integer()),
                Some(-1)
            );
            assert_eq!(
                req.get("StreamFlags").and_then(|x| x.as_signed_integer()),
                Some(60)
            );
            server
        });

        let syslog = SyslogService::start(control, source.clone(), None)
            .await
            .unwrap();
        let server = server_task.await.unwrap();
        (syslog, source, server)
    }

    #[tokio::test]
    async fn printable_packets_become_messages() {
        let (mut syslog, source, _server) = armed_service().await;

        source.deliver(tcp_packet(
            b"Mar 14 01:59:26 iPhone kernel[0]: hello\n".to_vec(),
        ));
        match syslog.next_event().await.unwrap() {
            SyslogEvent::Message(text) => {
                assert!(text.contains("kernel[0]: hello"));
                // non-printables are stripped
                assert!(!text.contains('\n'));
            }
            other => panic!("expected message, got {other:?}"),
        }
        syslog.stop().await;
    }

    #[tokio::test]
    async fn binary_packets_are_filtered_out() {
        let (mut syslog, source, _server) = armed_service().await;

        source.deliver(tcp_packet(vec![0x00, 0x01, 0x02, 0x80, 0xFF, 0x41]));
        source.deliver(tcp_packet(b"a visible line".to_vec()));
        match syslog.next_event().await.unwrap() {
            SyslogEvent::Message(text) => assert_eq!(text, "a visible line"),
            other => panic!("expected message, got {other:?}"),
        }
        syslog.stop().await;
    }

    #[tokio::test]
    async fn embedded_plist_adds_plist_event() {
        let (mut syslog, source, _server) = armed_service().await;

        let mut payload = b"log prefix ".to_vec();
        let inner = crate::plist!({ "MessageType": "Activity" });
        payload.extend_from_slice(plist::create_xml(&inner).as_bytes());
        source.deliver(tcp_packet(payload));

        match syslog.next_event().await.unwrap() {
            SyslogEvent::Message(_) => {}
            other => panic!("expected message first, got {other:?}"),
        }
        match syslog.next_event().await.unwrap() {
            SyslogEvent::Plist(value) => {
                assert_eq!(
                    value
                        .as_dictionary()
                        .and_then(|d| d.get("MessageType"))
                        .and_then(|x| x.as_string()),
                    Some("Activity")
                );
            }
            other => panic!("expected plist event, got {other:?}"),
        }
        syslog.stop().await;
    }

    #[tokio::test]
    async fn stop_removes_consumer_and_ends_stream() {
        let (mut syslog, source, _server) = armed_service().await;
        syslog.stop().await;
        syslog.stop().await; // idempotent

        source.deliver(tcp_packet(b"after stop".to_vec()));
        assert_eq!(syslog.next_event().await, None);
    }
}
