//! Service call fabric and domain service clients
//!
//! Every domain service rides on a [`ServiceConnection`]: a TCP connection
//! to a port the RSD catalog advertised, checked in with the device, and
//! exchanging length-prefixed plists.

pub mod diagnostics;
pub mod heartbeat;
pub mod mounter;
pub mod notification_proxy;
pub mod syslog;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::net::TcpSocket;

use crate::plist::{Dictionary, PlistValue};
use crate::{DeviceConnection, ReadWrite, RemoteXpcError};

/// Default deadline for establishing a service connection
pub const CREATE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for a single request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interface for typed clients over an RSD-advertised service
pub trait RsdServiceClient: Sized {
    /// The service name as advertised in the RSD catalog
    fn service_name() -> &'static str;

    /// Wraps an established, checked-in service connection
    fn from_service(service: ServiceConnection) -> Self;
}

/// A checked-in connection to one service inside the tunnel
///
/// Request/response use is serialized: the response to a request is the
/// first complete plist message received after the send, so concurrent use
/// per connection is not permitted.
pub struct ServiceConnection {
    pub conn: DeviceConnection,
}

impl ServiceConnection {
    /// Opens a TCP connection to a resolved (host, port) and performs the
    /// RSD check-in
    pub async fn connect(host: IpAddr, port: u16) -> Result<Self, RemoteXpcError> {
        Self::connect_with_timeout(host, port, CREATE_CONNECTION_TIMEOUT).await
    }

    /// As [`Self::connect`], with an explicit connection deadline
    pub async fn connect_with_timeout(
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, RemoteXpcError> {
        debug!("Dialing service at [{host}]:{port}");
        let socket = match host {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_keepalive(true)?;
        socket.set_nodelay(true)?;
        let connect = socket.connect(SocketAddr::new(host, port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => return Err(RemoteXpcError::Timeout(timeout.as_millis())),
        };

        Self::from_stream(Box::new(stream)).await
    }

    /// Performs the check-in over an already-established transport
    pub async fn from_stream(stream: Box<dyn ReadWrite>) -> Result<Self, RemoteXpcError> {
        let mut conn = DeviceConnection::new(stream, crate::DEFAULT_LABEL);
        conn.rsd_checkin().await?;
        Ok(Self { conn })
    }

    /// Writes one plist request and awaits one response
    ///
    /// The connection stays usable after a timeout; no partial message is
    /// buffered across calls.
    pub async fn send_plist_request(
        &mut self,
        request: &PlistValue,
        timeout: Option<Duration>,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.conn
            .send_and_receive(request, timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .await
    }

    /// Sends a plist without waiting for a response
    pub async fn send_plist(&mut self, request: &PlistValue) -> Result<(), RemoteXpcError> {
        self.conn.send_plist(request).await
    }

    /// Reads the next message with a deadline
    pub async fn read_plist_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.conn.read_plist_timeout(timeout).await
    }

    /// Reads the next message with no deadline
    pub async fn read_plist(&mut self) -> Result<Dictionary, RemoteXpcError> {
        self.conn.read_plist().await
    }

    /// Closes the connection. Safe to call multiple times.
    pub async fn close(&mut self) {
        self.conn.close().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory transports with a scripted device side

    use super::*;
    use crate::plist;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub async fn read_framed(server: &mut DuplexStream) -> Dictionary {
        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        server.read_exact(&mut body).await.unwrap();
        plist::parse_plist(&body).unwrap().into_dictionary().unwrap()
    }

    pub async fn write_framed(server: &mut DuplexStream, value: &PlistValue) {
        let body = plist::create_xml(value);
        server
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        server.write_all(body.as_bytes()).await.unwrap();
    }

    /// Answers the two-message RSD check-in like a device would
    pub async fn answer_checkin(server: &mut DuplexStream) {
        let req = read_framed(server).await;
        assert_eq!(
            req.get("Request").and_then(|x| x.as_string()),
            Some("RSDCheckin")
        );
        assert_eq!(
            req.get("ProtocolVersion").and_then(|x| x.as_string()),
            Some("2")
        );
        assert_eq!(
            req.get("Label").and_then(|x| x.as_string()),
            Some(crate::DEFAULT_LABEL)
        );
        write_framed(server, &crate::plist!({ "Request": "RSDCheckin" })).await;
        write_framed(server, &crate::plist!({ "Request": "StartService" })).await;
    }

    /// A checked-in service connection over an in-memory duplex
    pub async fn connected_pair() -> (ServiceConnection, DuplexStream) {
        let (client, mut server) = duplex(1 << 20);
        let server_task = tokio::spawn(async move {
            answer_checkin(&mut server).await;
            server
        });
        let service = ServiceConnection::from_stream(Box::new(client))
            .await
            .unwrap();
        let server = server_task.await.unwrap();
        (service, server)
    }
}
