//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! Provides functionality for interacting with the usbmuxd service which
//! manages connections to iOS devices over USB and network, and stores
//! pairing records.

use std::{net::SocketAddr, str::FromStr, time::Duration};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    pair_record::PairRecord,
    plist::{self, Dictionary, PlistValue},
    DeviceConnection, ReadWrite, RemoteXpcError,
};

mod raw_packet;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    /// Connected via USB
    Usb,
    /// Connected via network
    Network,
    /// Unknown connection type with description
    Unknown(String),
}

impl ConnectionType {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionType::Usb => "USB",
            ConnectionType::Network => "Network",
            ConnectionType::Unknown(s) => s,
        }
    }
}

/// Identity record for a device attached through the mux
///
/// The numeric `device_id` is unique only within a single mux session; the
/// UDID is the globally stable key.
#[derive(Debug, Clone)]
pub struct Device {
    /// usbmuxd-assigned device ID, link-scoped
    pub device_id: u32,
    /// Unique Device Identifier (SerialNumber), stable across reboots
    pub udid: String,
    /// How the device is connected
    pub connection_type: ConnectionType,
    /// USB product ID
    pub product_id: Option<u64>,
    /// Negotiated connection speed
    pub connection_speed: Option<u64>,
    /// USB location ID
    pub location_id: Option<u64>,
}

/// Event from a `Listen` subscription
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached(Device),
    Detached { device_id: u32 },
    /// Paired notification, carries the device ID
    Paired { device_id: u32 },
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum MuxAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl MuxAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Connects to the usbmuxd service
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, RemoteXpcError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a new mux connection
    pub async fn connect(&self) -> Result<MuxConnection, RemoteXpcError> {
        let socket = self.to_socket().await?;
        Ok(MuxConnection::new(socket))
    }

    /// Creates a MuxAddr from the `USBMUXD_SOCKET_ADDRESS` environment
    /// variable, falling back to the platform default
    pub fn from_env_var() -> Result<Self, std::net::AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for MuxAddr {
    /// Unix: the default socket path. Elsewhere: localhost TCP.
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Active connection to the usbmuxd service
///
/// Tags increase monotonically per connection; responses echo the tag of
/// the request they answer.
pub struct MuxConnection {
    socket: Option<Box<dyn ReadWrite>>,
    tag: u32,
}

impl MuxConnection {
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// Default timeout for a device list request
    pub const LIST_DEVICES_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connects to the default usbmuxd address
    pub async fn default() -> Result<Self, RemoteXpcError> {
        let socket = MuxAddr::default().to_socket().await?;
        Ok(Self::new(socket))
    }

    pub fn new(socket: Box<dyn ReadWrite>) -> Self {
        Self {
            socket: Some(socket),
            tag: 0,
        }
    }

    /// Lists all connected devices
    ///
    /// # Errors
    /// Surfaces a timeout error carrying the requested duration when the
    /// daemon does not answer in time; malformed responses fail with
    /// protocol errors.
    pub async fn list_devices(&mut self, timeout: Duration) -> Result<Vec<Device>, RemoteXpcError> {
        let req = crate::plist!({
            "MessageType": "ListDevices",
            "ClientVersionString": crate::DEFAULT_LABEL,
            "kLibUSBMuxVersion": 3,
        });
        self.write_plist(req).await?;
        let res = match tokio::time::timeout(timeout, self.read_plist()).await {
            Ok(res) => res?,
            Err(_) => return Err(RemoteXpcError::Timeout(timeout.as_millis())),
        };

        let list = res
            .get("DeviceList")
            .and_then(|x| x.as_array())
            .ok_or(RemoteXpcError::MissingField("DeviceList"))?;

        let mut devices = Vec::new();
        for entry in list {
            match parse_device(entry) {
                Ok(d) => devices.push(d),
                Err(e) => {
                    warn!("Skipping malformed device entry: {e:?}");
                }
            }
        }
        Ok(devices)
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<Device, RemoteXpcError> {
        let devices = self.list_devices(Self::LIST_DEVICES_TIMEOUT).await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(RemoteXpcError::DeviceNotFound),
        }
    }

    /// Gets the pairing record for a device
    ///
    /// The response body carries `PairRecordData`, itself a plist blob that
    /// is decoded recursively.
    pub async fn read_pair_record(&mut self, udid: &str) -> Result<PairRecord, RemoteXpcError> {
        debug!("Getting pair record for {udid}");
        let req = crate::plist!({
            "MessageType": "ReadPairRecord",
            "PairRecordID": udid,
        });
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData").and_then(|x| x.as_data()) {
            Some(d) => PairRecord::from_bytes(d),
            None => Err(RemoteXpcError::MissingField("PairRecordData")),
        }
    }

    /// Gets the system BUID
    pub async fn read_buid(&mut self) -> Result<String, RemoteXpcError> {
        let req = crate::plist!({
            "MessageType": "ReadBUID",
        });
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(PlistValue::String(s)) => Ok(s),
            _ => Err(RemoteXpcError::MissingField("BUID")),
        }
    }

    /// Subscribes to device attach/detach events
    ///
    /// After this call succeeds, pull events with [`Self::next_event`]. The
    /// connection can no longer be used for request/response traffic.
    pub async fn listen(&mut self) -> Result<(), RemoteXpcError> {
        let req = crate::plist!({
            "MessageType": "Listen",
            "ClientVersionString": crate::DEFAULT_LABEL,
        });
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(()),
            Some(n) => Err(RemoteXpcError::MuxConnectRefused(n)),
            None => Err(RemoteXpcError::MissingField("Number")),
        }
    }

    /// Reads the next attach/detach event from a `Listen` subscription
    pub async fn next_event(&mut self) -> Result<DeviceEvent, RemoteXpcError> {
        loop {
            let res = self.read_plist().await?;
            match res.get("MessageType").and_then(|x| x.as_string()) {
                Some("Attached") => match parse_attached(&res) {
                    Ok(d) => return Ok(DeviceEvent::Attached(d)),
                    Err(e) => {
                        warn!("Skipping malformed attach event: {e:?}");
                    }
                },
                Some("Detached") => {
                    let device_id = res
                        .get("DeviceID")
                        .and_then(|x| x.as_unsigned_integer())
                        .ok_or(RemoteXpcError::MissingField("DeviceID"))?;
                    return Ok(DeviceEvent::Detached {
                        device_id: device_id as u32,
                    });
                }
                Some("Paired") => {
                    let device_id = res
                        .get("DeviceID")
                        .and_then(|x| x.as_unsigned_integer())
                        .ok_or(RemoteXpcError::MissingField("DeviceID"))?;
                    return Ok(DeviceEvent::Paired {
                        device_id: device_id as u32,
                    });
                }
                other => {
                    warn!("Unhandled mux event {other:?}");
                }
            }
        }
    }

    /// Connects to a TCP port on the device
    ///
    /// On success the underlying socket becomes a raw pipe to the device
    /// port and the mux protocol is abandoned on it; the connection handle
    /// is consumed.
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port to connect to (host byte order)
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, RemoteXpcError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let req = crate::plist!({
            "MessageType": "Connect",
            "DeviceID": device_id,
            "PortNumber": port,
        });
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => {
                let socket = self
                    .socket
                    .take()
                    .ok_or(RemoteXpcError::NoEstablishedConnection)?;
                Ok(DeviceConnection::new(socket, label))
            }
            Some(1) => Err(RemoteXpcError::MuxBadCommand),
            Some(2) => Err(RemoteXpcError::MuxBadDevice),
            Some(3) => Err(RemoteXpcError::MuxConnectionRefused),
            Some(6) => Err(RemoteXpcError::MuxBadVersion),
            Some(n) => Err(RemoteXpcError::MuxConnectRefused(n)),
            None => Err(RemoteXpcError::MissingField("Number")),
        }
    }

    /// Closes the connection. Safe to call multiple times.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
    }

    /// Writes a PLIST message to usbmuxd
    async fn write_plist(&mut self, req: PlistValue) -> Result<(), RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::NoEstablishedConnection)?;
        let dict = req
            .into_dictionary()
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        self.tag += 1;
        let raw = raw_packet::RawPacket::new(
            dict,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );

        let raw: Vec<u8> = raw.into();
        socket.write_all(&raw).await?;
        socket.flush().await?;

        Ok(())
    }

    /// Reads a PLIST message from usbmuxd
    async fn read_plist(&mut self) -> Result<Dictionary, RemoteXpcError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(RemoteXpcError::NoEstablishedConnection)?;
        let mut header_buffer = [0; 16];
        socket.read_exact(&mut header_buffer).await?;

        // Length includes the 16-byte header
        let packet_size = u32::from_le_bytes(header_buffer[..4].try_into().unwrap());
        let packet_size = packet_size
            .checked_sub(raw_packet::HEADER_SIZE)
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        let tag = u32::from_le_bytes(header_buffer[12..16].try_into().unwrap());
        if tag != self.tag {
            debug!("Mux response tag {tag} does not echo request tag {}", self.tag);
        }
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size as usize];
        socket.read_exact(&mut body_buffer).await?;

        let res = plist::parse_plist(&body_buffer)?
            .into_dictionary()
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        debug!("Read from muxer: {res:?}");

        Ok(res)
    }
}

fn parse_device(entry: &PlistValue) -> Result<Device, RemoteXpcError> {
    let entry = entry
        .as_dictionary()
        .ok_or(RemoteXpcError::UnexpectedResponse)?;
    let device_id = entry
        .get("DeviceID")
        .and_then(|x| x.as_unsigned_integer())
        .ok_or(RemoteXpcError::MissingField("DeviceID"))? as u32;
    let properties = entry
        .get("Properties")
        .and_then(|x| x.as_dictionary())
        .ok_or(RemoteXpcError::MissingField("Properties"))?;
    parse_properties(device_id, properties)
}

fn parse_attached(res: &Dictionary) -> Result<Device, RemoteXpcError> {
    let device_id = res
        .get("DeviceID")
        .and_then(|x| x.as_unsigned_integer())
        .ok_or(RemoteXpcError::MissingField("DeviceID"))? as u32;
    let properties = res
        .get("Properties")
        .and_then(|x| x.as_dictionary())
        .ok_or(RemoteXpcError::MissingField("Properties"))?;
    parse_properties(device_id, properties)
}

fn parse_properties(device_id: u32, properties: &Dictionary) -> Result<Device, RemoteXpcError> {
    let udid = properties
        .get("SerialNumber")
        .and_then(|x| x.as_string())
        .ok_or(RemoteXpcError::MissingField("SerialNumber"))?
        .to_string();
    let connection_type = match properties
        .get("ConnectionType")
        .and_then(|x| x.as_string())
        .ok_or(RemoteXpcError::MissingField("ConnectionType"))?
    {
        "USB" => ConnectionType::Usb,
        "Network" => ConnectionType::Network,
        other => ConnectionType::Unknown(other.to_string()),
    };

    Ok(Device {
        device_id,
        udid,
        connection_type,
        product_id: properties
            .get("ProductID")
            .and_then(|x| x.as_unsigned_integer()),
        connection_speed: properties
            .get("ConnectionSpeed")
            .and_then(|x| x.as_unsigned_integer()),
        location_id: properties
            .get("LocationID")
            .and_then(|x| x.as_unsigned_integer()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn mux_response(dict: PlistValue, tag: u32) -> Vec<u8> {
        let raw = raw_packet::RawPacket::new(dict.into_dictionary().unwrap(), 1, 8, tag);
        raw.into()
    }

    #[tokio::test]
    async fn lists_devices() {
        let (client, mut server) = duplex(65536);
        let mut mux = MuxConnection::new(Box::new(client));

        let server_task = tokio::spawn(async move {
            // Consume the request
            let mut header = [0u8; 16];
            server.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) - 16;
            let mut body = vec![0u8; len as usize];
            server.read_exact(&mut body).await.unwrap();
            let req = plist::parse_plist(&body).unwrap();
            assert_eq!(
                req.as_dictionary()
                    .and_then(|d| d.get("MessageType"))
                    .and_then(|x| x.as_string()),
                Some("ListDevices")
            );

            let res = crate::plist!({
                "DeviceList": [
                    {
                        "DeviceID": 3,
                        "Properties": {
                            "ConnectionType": "USB",
                            "SerialNumber": "00008120-001A29E02091A01E",
                            "ProductID": 4776,
                            "ConnectionSpeed": 480000000,
                            "LocationID": 1234567,
                        },
                    },
                ],
            });
            server.write_all(&mux_response(res, 1)).await.unwrap();
        });

        let devices = mux.list_devices(Duration::from_secs(1)).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, 3);
        assert_eq!(devices[0].udid, "00008120-001A29E02091A01E");
        assert_eq!(devices[0].connection_type, ConnectionType::Usb);
        assert_eq!(devices[0].product_id, Some(4776));
    }

    #[tokio::test]
    async fn list_devices_times_out() {
        let (client, _server) = duplex(65536);
        let mut mux = MuxConnection::new(Box::new(client));

        let timeout = Duration::from_millis(50);
        match mux.list_devices(timeout).await {
            Err(RemoteXpcError::Timeout(ms)) => assert_eq!(ms, 50),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_refused_number_surfaces() {
        let (client, mut server) = duplex(65536);
        let mux = MuxConnection::new(Box::new(client));

        let server_task = tokio::spawn(async move {
            let mut header = [0u8; 16];
            server.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) - 16;
            let mut body = vec![0u8; len as usize];
            server.read_exact(&mut body).await.unwrap();

            let res = crate::plist!({ "MessageType": "Result", "Number": 5 });
            server.write_all(&mux_response(res, 1)).await.unwrap();
        });

        match mux.connect_to_device(3, 62078, "test").await {
            Err(RemoteXpcError::MuxConnectRefused(5)) => {}
            other => panic!("expected refusal, got {:?}", other.map(|_| ())),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_swaps_port_to_network_order() {
        let (client, mut server) = duplex(65536);
        let mux = MuxConnection::new(Box::new(client));

        let server_task = tokio::spawn(async move {
            let mut header = [0u8; 16];
            server.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) - 16;
            let mut body = vec![0u8; len as usize];
            server.read_exact(&mut body).await.unwrap();
            let req = plist::parse_plist(&body).unwrap();
            let port = req
                .as_dictionary()
                .and_then(|d| d.get("PortNumber"))
                .and_then(|x| x.as_unsigned_integer())
                .unwrap();
            assert_eq!(port, 62078u16.to_be() as u64);

            let res = crate::plist!({ "MessageType": "Result", "Number": 0 });
            server.write_all(&mux_response(res, 1)).await.unwrap();
        });

        let conn = mux.connect_to_device(3, 62078, "test").await.unwrap();
        assert!(conn.is_connected());
        server_task.await.unwrap();
    }
}
