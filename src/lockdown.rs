//! iOS Lockdown Service Client
//!
//! Provides functionality for interacting with the lockdown service on iOS
//! devices, which is the primary service for device management and service
//! discovery. Lockdown speaks length-prefixed plists on TCP port 62078 and
//! upgrades to TLS using the pair record's client certificate.

use std::time::Duration;

use log::{debug, error};

use crate::{
    pair_record::PairRecord,
    plist::{Dictionary, PlistValue},
    usbmux::MuxAddr,
    DeviceConnection, RemoteXpcError,
};

/// Client for the lockdown control channel
///
/// Concurrent senders on one session are not permitted; callers must
/// serialize their exchanges.
pub struct LockdownClient {
    /// The underlying device connection with established lockdown service
    pub conn: DeviceConnection,
    session_id: Option<String>,
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWN_PORT: u16 = 62078;

    /// Default deadline for a single lockdown exchange
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new lockdown client from an existing device connection
    pub fn new(conn: DeviceConnection) -> Self {
        Self {
            conn,
            session_id: None,
        }
    }

    /// Dials lockdown on a device through the mux daemon and runs the
    /// session handshake, including the TLS upgrade when the device asks
    /// for it
    ///
    /// # Arguments
    /// * `addr` - mux daemon endpoint
    /// * `udid` - target device
    pub async fn connect(addr: &MuxAddr, udid: &str) -> Result<Self, RemoteXpcError> {
        let mut mux = addr.connect().await?;
        let device = mux.get_device(udid).await?;
        mux.close().await;

        let mut mux = addr.connect().await?;
        let pair_record = mux.read_pair_record(udid).await?;
        mux.close().await;

        let mux = addr.connect().await?;
        let conn = mux
            .connect_to_device(device.device_id, Self::LOCKDOWN_PORT, crate::DEFAULT_LABEL)
            .await?;

        let mut client = Self::new(conn);
        client.start_session(&pair_record).await?;
        Ok(client)
    }

    /// The session ID the device assigned, once a session is started
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Starts a session with the device, upgrading to TLS when the device
    /// sets `EnableSessionSSL`
    ///
    /// # Errors
    /// A missing or malformed pair record, a TLS negotiation failure, or an
    /// unexpected response shape aborts the handshake.
    pub async fn start_session(
        &mut self,
        pair_record: &PairRecord,
    ) -> Result<(), RemoteXpcError> {
        if !self.conn.is_connected() {
            return Err(RemoteXpcError::NoEstablishedConnection);
        }

        let label = self.conn.label().to_string();
        let req = crate::plist!({
            "Label": label,
            "Request": "StartSession",
            "HostID": pair_record.host_id.as_str(),
            "SystemBUID": pair_record.system_buid.as_str(),
        });
        self.conn.send_plist(&req).await?;
        let response = self.conn.read_plist().await?;

        match response.get("Request").and_then(|x| x.as_string()) {
            Some("StartSession") => {}
            _ => return Err(RemoteXpcError::UnexpectedResponse),
        }

        self.session_id = response
            .get("SessionID")
            .and_then(|x| x.as_string())
            .map(|s| s.to_string());

        let enable_ssl = response
            .get("EnableSessionSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false);

        if enable_ssl {
            debug!("Device requested SSL, upgrading session");
            self.conn.start_session(pair_record).await?;
        }

        Ok(())
    }

    /// Writes a plist and awaits the next decoded plist from the same
    /// connection
    ///
    /// The connection stays usable after a timeout.
    pub async fn send_and_receive(
        &mut self,
        message: &PlistValue,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.conn.send_and_receive(message, timeout).await
    }

    /// Queries the device type
    pub async fn query_type(&mut self) -> Result<String, RemoteXpcError> {
        let label = self.conn.label().to_string();
        let req = crate::plist!({
            "Label": label,
            "Request": "QueryType",
        });
        let res = self.send_and_receive(&req, Self::DEFAULT_TIMEOUT).await?;
        match res.get("Type").and_then(|x| x.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(RemoteXpcError::MissingField("Type")),
        }
    }

    /// Retrieves a specific value from the device
    ///
    /// # Arguments
    /// * `key` - The name of the value to retrieve (e.g., "DeviceName")
    pub async fn get_value(&mut self, key: impl Into<String>) -> Result<PlistValue, RemoteXpcError> {
        let label = self.conn.label().to_string();
        let req = crate::plist!({
            "Label": label,
            "Key": key.into(),
            "Request": "GetValue",
        });
        let mut res = self.send_and_receive(&req, Self::DEFAULT_TIMEOUT).await?;
        match res.remove("Value") {
            Some(v) => Ok(v),
            None => Err(RemoteXpcError::MissingField("Value")),
        }
    }

    /// Retrieves all available values from the device
    pub async fn get_all_values(&mut self) -> Result<Dictionary, RemoteXpcError> {
        let label = self.conn.label().to_string();
        let req = crate::plist!({
            "Label": label,
            "Request": "GetValue",
        });
        let mut res = self.send_and_receive(&req, Self::DEFAULT_TIMEOUT).await?;
        match res.remove("Value").and_then(|v| v.into_dictionary()) {
            Some(d) => Ok(d),
            None => Err(RemoteXpcError::MissingField("Value")),
        }
    }

    /// Requests to start a service on the device
    ///
    /// # Returns
    /// The port the service listens on, and whether the service connection
    /// must be TLS-upgraded
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), RemoteXpcError> {
        let label = self.conn.label().to_string();
        let req = crate::plist!({
            "Label": label,
            "Request": "StartService",
            "Service": identifier.into(),
        });
        let res = self.send_and_receive(&req, Self::DEFAULT_TIMEOUT).await?;

        let ssl = res
            .get("EnableServiceSSL")
            .and_then(|x| x.as_boolean())
            // over USB, this option won't exist
            .unwrap_or(false);

        match res.get("Port").and_then(|x| x.as_unsigned_integer()) {
            Some(port) if port <= u16::MAX as u64 => Ok((port as u16, ssl)),
            _ => {
                error!("Response didn't contain a valid port");
                Err(RemoteXpcError::MissingField("Port"))
            }
        }
    }

    /// Closes the session and the underlying stream. Safe to call multiple
    /// times.
    pub async fn close(&mut self) {
        self.session_id = None;
        self.conn.close().await;
    }
}

impl From<DeviceConnection> for LockdownClient {
    fn from(value: DeviceConnection) -> Self {
        Self::new(value)
    }
}
