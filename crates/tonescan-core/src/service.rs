//! Scanner service
//!
//! The surface the kiosk UI talks to. Wraps a [`DeviceSession`], publishes
//! connection status, and turns protocol errors into displayable state
//! instead of propagating them into UI code.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::protocol::{
    ColorMeasurement, DeviceDescriptor, DeviceSession, ProtocolError, COLORIMETER_VENDOR_ID,
};

/// Connection state shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Open/unlock in progress
    Connecting,
    /// Connected and ready to scan
    Connected,
    /// Host has no serial capability
    Unavailable,
}

/// Observable status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Link state
    pub state: ConnectionState,
    /// A user gesture is needed to (re)connect
    pub needs_manual_connect: bool,
    /// Human-readable description of the last failure
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            needs_manual_connect: false,
            last_error: None,
        }
    }
}

impl ConnectionStatus {
    fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            needs_manual_connect: false,
            last_error: None,
        }
    }

    fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
            needs_manual_connect: false,
            last_error: None,
        }
    }

    fn needs_manual(last_error: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            needs_manual_connect: true,
            last_error,
        }
    }

    fn unavailable(reason: String) -> Self {
        Self {
            state: ConnectionState::Unavailable,
            needs_manual_connect: false,
            last_error: Some(reason),
        }
    }
}

type InflightScan = Shared<BoxFuture<'static, Option<ColorMeasurement>>>;

struct ServiceInner {
    session: DeviceSession,
    status: watch::Sender<ConnectionStatus>,
    vendor_id: u16,
}

/// Connect / scan / disconnect for UI call sites.
///
/// Cheap to clone; clones share the session. At most one scan is in flight:
/// callers that arrive while a scan runs await the same result.
#[derive(Clone)]
pub struct ScannerService {
    inner: Arc<ServiceInner>,
    inflight: Arc<Mutex<Option<InflightScan>>>,
}

impl ScannerService {
    /// Service that filters devices by the colorimeter vendor id
    pub fn new(session: DeviceSession) -> Self {
        Self::with_vendor(session, COLORIMETER_VENDOR_ID)
    }

    /// Service that filters devices by `vendor_id`
    pub fn with_vendor(session: DeviceSession, vendor_id: u16) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(ServiceInner {
                session,
                status,
                vendor_id,
            }),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// Underlying device session
    pub fn session(&self) -> &DeviceSession {
        &self.inner.session
    }

    /// Current status snapshot
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Observe status changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Connect to the first authorized device from the colorimeter vendor.
    ///
    /// Never prompts; with no match the status asks for a manual connect.
    pub async fn auto_connect(&self) -> ConnectionStatus {
        let devices = match self.inner.session.list_devices().await {
            Ok(devices) => devices,
            Err(e) => return self.inner.fail(e),
        };

        let Some(device) = devices
            .into_iter()
            .find(|d| d.matches_vendor(self.inner.vendor_id))
        else {
            tracing::info!(
                "No authorized device with vendor {:#06x}; manual connect required",
                self.inner.vendor_id
            );
            return self.inner.publish(ConnectionStatus::needs_manual(None));
        };

        self.connect_to(&device).await
    }

    /// Prompt the operator for a device and connect to it
    pub async fn manual_connect(&self) -> ConnectionStatus {
        let device = match self
            .inner
            .session
            .request_device(Some(self.inner.vendor_id))
            .await
        {
            Ok(device) => device,
            Err(e) => return self.inner.fail(e),
        };

        self.connect_to(&device).await
    }

    /// Connect to a known device.
    ///
    /// While another connect is in flight this returns the current status
    /// without publishing; the running attempt owns the status.
    pub async fn connect_to(&self, device: &DeviceDescriptor) -> ConnectionStatus {
        if self.inner.session.is_connecting() {
            tracing::debug!("connect_to: another connect is in flight");
            return self.status();
        }

        self.inner.publish(ConnectionStatus::connecting());
        match self.inner.session.connect(device).await {
            Ok(()) => {
                tracing::info!("Colorimeter connected on {}", device.path);
                self.inner.publish(ConnectionStatus::connected())
            }
            Err(ProtocolError::ConnectInProgress) => {
                tracing::debug!("connect_to: lost the race to another connect");
                self.status()
            }
            Err(ProtocolError::AlreadyConnected) => {
                self.inner.publish(ConnectionStatus::connected())
            }
            Err(e) => self.inner.fail(e),
        }
    }

    /// Run a scan. Failures are recorded in the status and yield `None`.
    pub async fn trigger_scan(&self) -> Option<ColorMeasurement> {
        let scan = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    tracing::debug!("trigger_scan: joining in-flight scan");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let fut = async move { inner.run_scan().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = scan.clone().await;

        let mut slot = self.inflight.lock();
        if slot.as_ref().is_some_and(|s| s.ptr_eq(&scan)) {
            *slot = None;
        }
        result
    }

    /// Close the link
    pub async fn disconnect(&self) {
        self.inner.session.disconnect().await;
        self.inner.publish(ConnectionStatus::default());
    }

    /// Release the device before the application exits
    pub async fn shutdown(&self) {
        tracing::info!("Scanner service shutting down");
        self.disconnect().await;
    }
}

impl ServiceInner {
    fn publish(&self, status: ConnectionStatus) -> ConnectionStatus {
        self.status.send_replace(status.clone());
        status
    }

    fn fail(&self, err: ProtocolError) -> ConnectionStatus {
        match err {
            ProtocolError::UnsupportedEnvironment(reason) => {
                tracing::warn!("Serial access unavailable: {}", reason);
                self.publish(ConnectionStatus::unavailable(reason))
            }
            ProtocolError::SelectionCancelled => {
                tracing::info!("Device selection cancelled");
                self.publish(ConnectionStatus::needs_manual(None))
            }
            e => {
                tracing::warn!("Colorimeter connection failed: {}", e);
                self.publish(ConnectionStatus::needs_manual(Some(e.to_string())))
            }
        }
    }

    async fn run_scan(&self) -> Option<ColorMeasurement> {
        match self.session.scan().await {
            Ok(measurement) => {
                if !self.session.is_connected() {
                    // Scan completed but the link could not be reset
                    self.publish(ConnectionStatus::needs_manual(Some(
                        "Link reset after scan failed".to_string(),
                    )));
                }
                Some(measurement)
            }
            Err(e) => {
                tracing::warn!("Scan failed: {}", e);
                self.publish(ConnectionStatus::needs_manual(Some(e.to_string())));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default_is_disconnected() {
        let status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.needs_manual_connect);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase_state() {
        let json = serde_json::to_string(&ConnectionStatus::needs_manual(Some("x".into())))
            .unwrap();
        assert!(json.contains("\"state\":\"disconnected\""));
        assert!(json.contains("\"needs_manual_connect\":true"));
    }
}
