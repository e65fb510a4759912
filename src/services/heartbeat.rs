//! Heartbeat Service
//!
//! iOS closes tunnel services when no heartbeat client is connected and
//! responding. The device sends periodic pings; this side answers each one
//! with `{Command:"Polo"}`.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::RemoteXpcError;

use super::{RsdServiceClient, ServiceConnection};

/// Lifecycle of a heartbeat client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Client for the heartbeat service
///
/// Two modes are supported: [`HeartbeatService::run`] drives the recv→Polo
/// loop inline, and [`HeartbeatService::start_in_background`] hands the
/// loop to an internal task and returns immediately.
pub struct HeartbeatService {
    service: Option<ServiceConnection>,
    state: HeartbeatState,
}

impl RsdServiceClient for HeartbeatService {
    fn service_name() -> &'static str {
        "com.apple.mobile.heartbeat.shim.remote"
    }

    fn from_service(service: ServiceConnection) -> Self {
        Self::new(service)
    }
}

impl HeartbeatService {
    pub fn new(service: ServiceConnection) -> Self {
        Self {
            service: Some(service),
            state: HeartbeatState::Idle,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == HeartbeatState::Running
    }

    /// Marks the established connection as running
    ///
    /// In non-blocking use this is all that happens; the caller answers
    /// pings with [`Self::send_polo`] at its own pace.
    pub fn start(&mut self) -> Result<(), RemoteXpcError> {
        if self.service.is_none() {
            return Err(RemoteXpcError::State(
                "heartbeat client already stopped".to_string(),
            ));
        }
        self.state = HeartbeatState::Running;
        Ok(())
    }

    /// Sends a `{Command:"Polo"}` response directly
    pub async fn send_polo(&mut self) -> Result<(), RemoteXpcError> {
        let service = self
            .service
            .as_mut()
            .ok_or(RemoteXpcError::NoEstablishedConnection)?;
        let req = crate::plist!({ "Command": "Polo" });
        service.send_plist(&req).await
    }

    /// Runs the recv→Polo loop inline
    ///
    /// Each message received from the device is answered with a Polo. With
    /// an `interval`, the loop terminates once that many seconds have
    /// elapsed since start; without one it runs until the connection closes
    /// or [`Self::stop`] is observed through an error.
    pub async fn run(&mut self, interval: Option<u64>) -> Result<(), RemoteXpcError> {
        self.start()?;
        let deadline = interval.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        let result = loop {
            let service = match self.service.as_mut() {
                Some(s) => s,
                None => break Ok(()),
            };
            let message = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        message = service.read_plist() => Some(message),
                        _ = tokio::time::sleep_until(deadline) => None,
                    }
                }
                None => Some(service.read_plist().await),
            };

            match message {
                None => {
                    debug!("Heartbeat interval elapsed, stopping");
                    break Ok(());
                }
                Some(Ok(message)) => {
                    if let Some(command) = message.get("Command").and_then(|x| x.as_string()) {
                        debug!("Heartbeat received {command}");
                        if command == "SleepyTime" {
                            // the device is going to sleep and will drop us
                            warn!("Device announced sleep during heartbeat");
                        }
                    }
                    self.send_polo().await?;
                }
                Some(Err(RemoteXpcError::ConnectionClosed)) => break Ok(()),
                Some(Err(e)) => break Err(e),
            }
        };

        self.stop().await;
        result
    }

    /// Spawns the recv→Polo loop on an internal task
    ///
    /// Consumes the client; the returned handle stops the loop and closes
    /// the connection.
    pub fn start_in_background(mut self) -> BackgroundHeartbeat {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = self.run(None) => result,
                _ = &mut stop_rx => Ok(()),
            };
            if let Err(e) = result {
                warn!("Background heartbeat failed: {e}");
            }
            self.stop().await;
        });
        BackgroundHeartbeat {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Closes the connection and clears running state. Safe to call
    /// multiple times.
    pub async fn stop(&mut self) {
        if let Some(mut service) = self.service.take() {
            self.state = HeartbeatState::Stopping;
            service.close().await;
        }
        self.state = HeartbeatState::Stopped;
    }
}

/// Handle to a heartbeat loop running on an internal task
pub struct BackgroundHeartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundHeartbeat {
    /// Stops the loop and waits for the task to wind down. Safe to call
    /// multiple times.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
