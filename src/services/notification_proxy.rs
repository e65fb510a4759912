//! Notification Proxy
//!
//! Observes and posts system notifications. At least one notification must
//! be observed before posting or pulling from the stream; the device
//! otherwise has nothing to relay and the call is a programmer error.

use std::collections::HashSet;
use std::time::Duration;

use crate::plist::Dictionary;
use crate::RemoteXpcError;

use super::{RsdServiceClient, ServiceConnection};

/// Client for the notification proxy service
pub struct NotificationProxyService {
    pub service: ServiceConnection,
    observed: HashSet<String>,
}

impl RsdServiceClient for NotificationProxyService {
    fn service_name() -> &'static str {
        "com.apple.mobile.notification_proxy.shim.remote"
    }

    fn from_service(service: ServiceConnection) -> Self {
        Self::new(service)
    }
}

impl NotificationProxyService {
    pub fn new(service: ServiceConnection) -> Self {
        Self {
            service,
            observed: HashSet::new(),
        }
    }

    /// Registers to observe a notification by name
    pub async fn observe(&mut self, name: impl Into<String>) -> Result<(), RemoteXpcError> {
        let name = name.into();
        let req = crate::plist!({
            "Command": "ObserveNotification",
            "Name": name.as_str(),
        });
        self.service.send_plist(&req).await?;
        self.observed.insert(name);
        Ok(())
    }

    /// Posts a notification to the device
    ///
    /// # Errors
    /// Fails with a state error when nothing has been observed yet.
    pub async fn post(&mut self, name: impl Into<String>) -> Result<(), RemoteXpcError> {
        self.require_observer("post")?;
        let req = crate::plist!({
            "Command": "PostNotification",
            "Name": name.into(),
        });
        self.service.send_plist(&req).await
    }

    /// Returns the next relayed notification, failing once the deadline
    /// passes
    pub async fn expect_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Dictionary, RemoteXpcError> {
        self.require_observer("expect_notification")?;
        self.service.read_plist_timeout(timeout).await
    }

    /// Pulls the next notification; `Ok(None)` once the connection closes
    ///
    /// Successive calls yield notifications in the order the device
    /// produced them, forming a lazy sequence that is finite when the
    /// connection closes.
    pub async fn next_notification(&mut self) -> Result<Option<Dictionary>, RemoteXpcError> {
        self.require_observer("next_notification")?;
        match self.service.read_plist().await {
            Ok(d) => Ok(Some(d)),
            Err(RemoteXpcError::ConnectionClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Collects notifications until the connection closes or `limit` is
    /// reached
    pub async fn expect_notifications(
        &mut self,
        limit: usize,
    ) -> Result<Vec<Dictionary>, RemoteXpcError> {
        let mut out = Vec::new();
        while out.len() < limit {
            match self.next_notification().await? {
                Some(d) => out.push(d),
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn close(&mut self) {
        self.service.close().await;
    }

    fn require_observer(&self, operation: &str) -> Result<(), RemoteXpcError> {
        if self.observed.is_empty() {
            return Err(RemoteXpcError::State(format!(
                "must call observe() before {operation}"
            )));
        }
        Ok(())
    }
}
