//! Remote Service Discovery
//!
//! Consumes the RSD service catalog a device streams over HTTP/2 on the
//! tunnel-side RSD port and answers service-name lookups with the TCP port
//! each service listens on.

use std::net::{IpAddr, SocketAddr};

use log::{debug, warn};
use tokio::net::{TcpSocket, TcpStream};

use crate::http2::{Http2Client, Setting};
use crate::plist::Dictionary;
use crate::{ReadWrite, RemoteXpcError};

/// Entry from the RSD catalog
///
/// Names are unique within a single catalog snapshot. The port is kept as
/// the decimal string the wire carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Dotted reverse-DNS service name
    pub name: String,
    /// Decimal TCP port, as advertised
    pub port: String,
    /// Additional service properties, when a caller has them from another
    /// source; the free-text catalog scan does not populate these
    pub properties: Option<Dictionary>,
}

/// The stream carrying the RSD handshake
const RSD_STREAM_ID: u32 = 1;
/// Window replenishment granted up front on the handshake stream
const INITIAL_WINDOW_GRANT: u32 = 983_041;

/// Client for the RSD service directory of one tunnel
pub struct RsdClient<R: ReadWrite> {
    http2: Http2Client<R>,
    services: Vec<Service>,
    closed: bool,
}

impl RsdClient<TcpStream> {
    /// Opens a TCP connection to the RSD port inside the tunnel
    ///
    /// The socket disables Nagle and enables keep-alive; RSD addresses are
    /// IPv6 link-local in practice, but any address is accepted.
    pub async fn connect(address: IpAddr, port: u16) -> Result<Self, RemoteXpcError> {
        let socket = match address {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_keepalive(true)?;
        socket.set_nodelay(true)?;
        let stream = socket.connect(SocketAddr::new(address, port)).await?;
        Self::from_stream(stream).await
    }
}

impl<R: ReadWrite> RsdClient<R> {
    /// Runs the RSD handshake over an established transport and extracts
    /// the service catalog
    pub async fn from_stream(stream: R) -> Result<Self, RemoteXpcError> {
        let mut http2 = Http2Client::new(stream).await?;
        http2
            .set_settings(vec![
                Setting::EnableConnectProtocol(1),
                Setting::MaxConcurrentStreams(100),
            ])
            .await?;
        http2.open_stream(RSD_STREAM_ID).await?;
        http2
            .window_update(RSD_STREAM_ID, INITIAL_WINDOW_GRANT)
            .await?;

        let payload = http2.read(RSD_STREAM_ID).await?;
        let services = extract_services(&payload);
        debug!("RSD catalog advertised {} services", services.len());
        if services.is_empty() {
            warn!("RSD handshake payload contained no services");
        }

        Ok(Self {
            http2,
            services,
            closed: false,
        })
    }

    /// All catalog entries, in the order the device advertised them
    pub fn list_all_services(&self) -> &[Service] {
        &self.services
    }

    /// Finds a service by its reverse-DNS name
    pub fn find_service(&self, name: &str) -> Result<&Service, RemoteXpcError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or(RemoteXpcError::ServiceNotFound)
    }

    /// Closes the directory connection, best-effort. Safe to call multiple
    /// times.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.http2.close().await;
        }
    }
}

/// Extracts (service name, port) pairs from the handshake DATA payload
///
/// The payload interleaves reverse-DNS service names with a "Port" key and
/// a decimal port among binary framing. Pairs are collected in order; when
/// two service names appear without an intervening port, the first is
/// discarded.
fn extract_services(payload: &[u8]) -> Vec<Service> {
    let mut services = Vec::new();
    let mut pending_name: Option<String> = None;
    let mut awaiting_port = false;

    for token in tokens(payload) {
        if token == "Port" {
            awaiting_port = pending_name.is_some();
            continue;
        }
        if awaiting_port {
            if let Some(port) = parse_port(token) {
                if let Some(name) = pending_name.take() {
                    services.push(Service {
                        name,
                        port: port.to_string(),
                        properties: None,
                    });
                }
                awaiting_port = false;
                continue;
            }
        }
        if is_service_name(token) {
            if pending_name.is_some() {
                debug!("Service name {token} follows an unported name, dropping the first");
            }
            pending_name = Some(token.to_string());
            awaiting_port = false;
        }
    }

    services
}

/// Iterates over runs of printable, non-space ASCII
fn tokens(payload: &[u8]) -> impl Iterator<Item = &str> {
    payload
        .split(|b| !(0x21..=0x7E).contains(b))
        .filter(|t| !t.is_empty())
        // runs are printable ASCII by construction
        .map(|t| std::str::from_utf8(t).unwrap())
}

fn parse_port(token: &str) -> Option<u16> {
    if token.is_empty() || token.len() > 5 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse::<u16>().ok()
}

/// A reverse-DNS name: at least three dot-separated alphanumeric labels
fn is_service_name(token: &str) -> bool {
    let labels: Vec<&str> = token.split('.').collect();
    if labels.len() < 3 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a payload resembling the XPC wire: names and ports surrounded
    /// by binary noise
    fn catalog(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut out = vec![0x00, 0x01, 0x92, 0x00];
        for (name, port) in entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&[0x00, 0x13, 0x00]);
            if let Some(port) = port {
                out.extend_from_slice(b"Port");
                out.extend_from_slice(&[0x00, 0x00, 0x85]);
                out.extend_from_slice(port.as_bytes());
                out.extend_from_slice(&[0x00, 0xFF]);
            }
        }
        out
    }

    #[test]
    fn extracts_pairs_in_order() {
        let payload = catalog(&[
            ("com.apple.serviceA", Some("1")),
            ("com.apple.serviceB", Some("2")),
            ("com.apple.serviceC", Some("3")),
        ]);
        let services = extract_services(&payload);
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].name, "com.apple.serviceA");
        assert_eq!(services[0].port, "1");
        assert_eq!(services[1].name, "com.apple.serviceB");
        assert_eq!(services[1].port, "2");
        assert_eq!(services[2].name, "com.apple.serviceC");
        assert_eq!(services[2].port, "3");
    }

    #[test]
    fn consecutive_names_drop_the_first() {
        let payload = catalog(&[
            ("com.apple.mobile.lockdown.remote.trusted", None),
            ("com.apple.syslog_relay", Some("50001")),
        ]);
        let services = extract_services(&payload);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "com.apple.syslog_relay");
        assert_eq!(services[0].port, "50001");
    }

    #[test]
    fn ignores_numbers_without_port_key() {
        let mut payload = catalog(&[("com.apple.serviceA", None)]);
        payload.extend_from_slice(b"12345");
        let services = extract_services(&payload);
        assert!(services.is_empty());
    }

    #[test]
    fn rejects_short_tokens_as_names() {
        let payload = b"hello world com.apple Port 10".to_vec();
        let services = extract_services(&payload);
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn handshake_over_in_memory_transport() {
        use crate::http2::frame::{DataFrame, HttpFrame, SettingsFrame};
        use tokio::io::{duplex, AsyncWriteExt};

        let (client, mut server) = duplex(1 << 20);

        let server_task = tokio::spawn(async move {
            let settings = SettingsFrame {
                settings: vec![Setting::MaxConcurrentStreams(100)],
                stream_id: 0,
                flags: 0,
            }
            .serialize();
            server.write_all(&settings).await.unwrap();

            let payload = catalog(&[
                ("com.apple.mobile.heartbeat", Some("50010")),
                ("com.apple.syslog_relay", Some("50011")),
            ]);
            let data = DataFrame::new(1, payload).serialize();
            server.write_all(&data).await.unwrap();
            server
        });

        let mut rsd = RsdClient::from_stream(client).await.unwrap();
        assert_eq!(rsd.list_all_services().len(), 2);
        assert_eq!(
            rsd.find_service("com.apple.syslog_relay").unwrap().port,
            "50011"
        );
        assert!(matches!(
            rsd.find_service("com.apple.absent"),
            Err(RemoteXpcError::ServiceNotFound)
        ));
        rsd.close().await;
        rsd.close().await; // idempotent
        drop(server_task);
    }
}
