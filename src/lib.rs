#![doc = include_str!("../README.md")]
// Jackson Coxson

pub mod http2;
pub mod lockdown;
pub mod pair_record;
pub mod pairing;
pub mod plist;
mod plist_macro;
pub mod rsd;
pub mod services;
mod tls;
pub mod tunnel;
pub mod usbmux;

use std::io;

use log::{debug, error, trace};
use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pair_record::PairRecord;
use crate::plist::{Dictionary, PlistError, PlistValue, SplitterConfig};

/// Label sent in every request dictionary that carries one
pub const DEFAULT_LABEL: &str = "appium-internal";

/// A trait combining all required characteristics for a device communication socket
///
/// This serves as a convenience trait for any type that can be used as an asynchronous
/// read/write socket for device communication. Combines common async I/O traits with
/// thread safety and debugging requirements.
///
/// Tokio's TcpStream and UnixStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
///
/// Used to enable dynamic dispatch of different connection types while maintaining
/// the required ReadWrite characteristics.
pub type DeviceSocket = Box<dyn ReadWrite>;

/// A plist-speaking byte stream into the device
///
/// Wraps a transport with length-prefixed property-list framing and provides
/// the message exchange primitives every higher layer builds on. Within one
/// connection all I/O is serialized; callers must not issue concurrent sends.
pub struct DeviceConnection {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<Box<dyn ReadWrite>>,
    /// Reassembles the inbound byte stream into whole plist messages
    splitter: plist::PlistSplitter,
    /// Label identifying this connection to the device
    label: String,
}

impl DeviceConnection {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Label for this connection
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            splitter: plist::PlistSplitter::new(SplitterConfig::default()),
            label: label.into(),
        }
    }

    /// The label this connection reports to the device
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a transport is still attached
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Performs the RSD check-in required as the first exchange on any
    /// service connection inside the tunnel
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if the protocol sequence isn't followed correctly
    pub async fn rsd_checkin(&mut self) -> Result<(), RemoteXpcError> {
        let req = crate::plist!({
            "Label": self.label.clone(),
            "ProtocolVersion": "2",
            "Request": "RSDCheckin",
        });
        self.send_plist(&req).await?;

        let res = self.read_plist().await?;
        match res.get("Request").and_then(|x| x.as_string()) {
            Some("RSDCheckin") => {}
            _ => return Err(RemoteXpcError::UnexpectedResponse),
        }

        let res = self.read_plist().await?;
        match res.get("Request").and_then(|x| x.as_string()) {
            Some("StartService") => {}
            _ => return Err(RemoteXpcError::UnexpectedResponse),
        }

        Ok(())
    }

    /// Sends a plist-formatted message to the device as XML
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: &PlistValue) -> Result<(), RemoteXpcError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {message:?}");

            let message = plist::create_xml(message);
            let len = message.len() as u32;
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(message.as_bytes()).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(RemoteXpcError::NoEstablishedConnection)
        }
    }

    /// Sends a binary plist-formatted message to the device
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if serialization or transmission fails
    pub async fn send_binary_plist(&mut self, message: &PlistValue) -> Result<(), RemoteXpcError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending binary plist: {message:?}");

            let message = plist::create_binary(message);
            let len = message.len() as u32;
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(&message).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(RemoteXpcError::NoEstablishedConnection)
        }
    }

    /// Sends raw binary data to the device
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if transmission fails
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), RemoteXpcError> {
        if let Some(socket) = &mut self.socket {
            let chunks = message.chunks(1024 * 64);
            let chunk_count = chunks.len();
            for (i, part) in chunks.enumerate() {
                trace!("Writing chunk {i}/{chunk_count}");
                socket.write_all(part).await?;
            }
            socket.flush().await?;
            Ok(())
        } else {
            Err(RemoteXpcError::NoEstablishedConnection)
        }
    }

    /// Reads exactly `len` bytes from the device
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if reading fails or connection is closed prematurely
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, RemoteXpcError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = vec![0; len];
            socket.read_exact(&mut buf).await?;
            Ok(buf)
        } else {
            Err(RemoteXpcError::NoEstablishedConnection)
        }
    }

    /// Reads the next whole plist message from the connection
    ///
    /// Messages already buffered by the splitter are drained before the
    /// socket is read again, so no complete message is ever lost to an
    /// earlier oversized read.
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if reading or parsing fails, or the device
    /// reports an error
    pub async fn read_plist(&mut self) -> Result<Dictionary, RemoteXpcError> {
        loop {
            if let Some(message) = self.splitter.next_message() {
                let res = plist::parse_plist(&message)?;
                let res = match res.into_dictionary() {
                    Some(d) => d,
                    None => return Err(RemoteXpcError::UnexpectedResponse),
                };
                debug!("Received plist: {res:?}");

                if let Some(e) = res.get("Error").and_then(|x| x.as_string()) {
                    if let Some(e) = RemoteXpcError::from_device_error_type(e, &res) {
                        return Err(e);
                    } else {
                        return Err(RemoteXpcError::UnknownErrorType(e.to_string()));
                    }
                }
                return Ok(res);
            }

            let socket = match &mut self.socket {
                Some(s) => s,
                None => return Err(RemoteXpcError::NoEstablishedConnection),
            };
            let mut buf = [0u8; 8192];
            let n = socket.read(&mut buf).await?;
            if n == 0 {
                return Err(RemoteXpcError::ConnectionClosed);
            }
            self.splitter.push(&buf[..n]);
        }
    }

    /// Reads the next plist message, failing once the deadline passes
    ///
    /// The connection stays usable after a timeout; no partial message is
    /// discarded.
    pub async fn read_plist_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        match tokio::time::timeout(timeout, self.read_plist()).await {
            Ok(res) => res,
            Err(_) => Err(RemoteXpcError::Timeout(timeout.as_millis())),
        }
    }

    /// Writes one plist and awaits the next decoded plist from the same
    /// connection
    ///
    /// Concurrent senders on one connection are not permitted; callers must
    /// serialize.
    pub async fn send_and_receive(
        &mut self,
        message: &PlistValue,
        timeout: std::time::Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.send_plist(message).await?;
        self.read_plist_timeout(timeout).await
    }

    /// Upgrades the connection to TLS using device pairing credentials
    ///
    /// # Arguments
    /// * `pair_record` - Contains the device's identity and certificates
    ///
    /// # Errors
    /// Returns `RemoteXpcError` if TLS handshake fails or credentials are invalid
    pub async fn start_session(
        &mut self,
        pair_record: &PairRecord,
    ) -> Result<(), RemoteXpcError> {
        if CryptoProvider::get_default().is_none() {
            if let Err(e) =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
            {
                // Another thread may have raced us to install it. Log and
                // continue; the provider that won is equivalent.
                error!("Failed to set crypto provider: {e:?}");
            }
        }
        let config = tls::create_client_config(pair_record)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = match self.socket.take() {
            Some(s) => s,
            None => return Err(RemoteXpcError::NoEstablishedConnection),
        };
        let socket = connector
            .connect(ServerName::try_from("Device").unwrap(), socket)
            .await?;

        self.socket = Some(Box::new(socket));

        Ok(())
    }

    /// Closes the connection. Safe to call multiple times.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RemoteXpcError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("plist codec error")]
    Plist(#[from] PlistError),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("expected field missing: {0}")]
    MissingField(&'static str),
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("device locked")]
    DeviceLocked,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("not connected or services not available")]
    NoEstablishedConnection,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("Timed out waiting for plist response after {0} ms")]
    Timeout(u128),

    #[error("device not found")]
    DeviceNotFound,
    #[error("service not found")]
    ServiceNotFound,
    #[error("not found")]
    NotFound,

    #[error("bad command")]
    MuxBadCommand,
    #[error("bad device")]
    MuxBadDevice,
    #[error("device refused connection")]
    MuxConnectionRefused,
    #[error("mux bad version")]
    MuxBadVersion,
    #[error("mux connect refused: {0}")]
    MuxConnectRefused(u64),

    #[error("unknown http frame type")]
    UnknownFrame(u8),
    #[error("unknown http setting type")]
    UnknownHttpSetting(u16),
    #[error("stream reset")]
    HttpStreamReset,
    #[error("go away packet received")]
    HttpGoAway(String),

    #[error("malformed TLV data")]
    MalformedTlv,
    #[error("type cannot be encoded as OPACK2: {0}")]
    OpackUnsupported(String),
    #[error("cryptography error: {0}")]
    Cryptography(String),

    #[error("{0}")]
    State(String),

    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize),
    #[error("internal error")]
    InternalError(String),
}

impl RemoteXpcError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Returns
    /// Some(RemoteXpcError) if the string maps to a known error type, None otherwise
    fn from_device_error_type(e: &str, context: &Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }
}
