//! Diagnostics Relay
//!
//! Queries device diagnostics (IORegistry, MobileGestalt) and requests
//! power state changes.

use crate::plist::{Dictionary, PlistValue};
use crate::RemoteXpcError;

use super::{RsdServiceClient, ServiceConnection};

/// Client for the diagnostics relay service
pub struct DiagnosticsService {
    pub service: ServiceConnection,
}

impl RsdServiceClient for DiagnosticsService {
    fn service_name() -> &'static str {
        "com.apple.mobile.diagnostics_relay.shim.remote"
    }

    fn from_service(service: ServiceConnection) -> Self {
        Self { service }
    }
}

impl DiagnosticsService {
    pub fn new(service: ServiceConnection) -> Self {
        Self { service }
    }

    /// Requests data from the IO registry
    ///
    /// # Arguments
    /// * `current_plane` - The plane to request the tree as
    /// * `entry_name` - The entry to get
    /// * `entry_class` - The class to filter by
    pub async fn ioregistry(
        &mut self,
        current_plane: Option<&str>,
        entry_name: Option<&str>,
        entry_class: Option<&str>,
    ) -> Result<Option<Dictionary>, RemoteXpcError> {
        let mut req = Dictionary::new();
        if let Some(plane) = current_plane {
            req.insert("CurrentPlane", plane);
        }
        if let Some(name) = entry_name {
            req.insert("EntryName", name);
        }
        if let Some(class) = entry_class {
            req.insert("EntryClass", class);
        }
        req.insert("Request", "IORegistry");

        let mut res = self
            .service
            .send_plist_request(&PlistValue::Dictionary(req), None)
            .await?;
        expect_success(&res)?;

        Ok(res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("IORegistry"))
            .and_then(|x| x.into_dictionary()))
    }

    /// Queries MobileGestalt keys
    pub async fn mobilegestalt(
        &mut self,
        keys: Vec<String>,
    ) -> Result<Option<Dictionary>, RemoteXpcError> {
        let keys: Vec<PlistValue> = keys.into_iter().map(PlistValue::String).collect();
        let req = crate::plist!({
            "Request": "MobileGestalt",
            "MobileGestaltKeys": keys,
        });
        let mut res = self.service.send_plist_request(&req, None).await?;
        expect_success(&res)?;

        Ok(res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("MobileGestalt"))
            .and_then(|x| x.into_dictionary()))
    }

    /// Restarts the device
    pub async fn restart(&mut self) -> Result<(), RemoteXpcError> {
        self.action("Restart").await
    }

    /// Shuts the device down
    pub async fn shutdown(&mut self) -> Result<(), RemoteXpcError> {
        self.action("Shutdown").await
    }

    /// Puts the device to sleep
    pub async fn sleep(&mut self) -> Result<(), RemoteXpcError> {
        self.action("Sleep").await
    }

    /// Ends the diagnostics session politely
    pub async fn goodbye(&mut self) -> Result<(), RemoteXpcError> {
        self.action("Goodbye").await?;
        self.service.close().await;
        Ok(())
    }

    async fn action(&mut self, request: &str) -> Result<(), RemoteXpcError> {
        let req = crate::plist!({ "Request": request });
        let res = self.service.send_plist_request(&req, None).await?;
        expect_success(&res)
    }
}

fn expect_success(res: &Dictionary) -> Result<(), RemoteXpcError> {
    match res.get("Status").and_then(|x| x.as_string()) {
        Some("Success") => Ok(()),
        _ => Err(RemoteXpcError::UnexpectedResponse),
    }
}
