//! Scripted colorimeter double shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonescan_core::protocol::{
    Command, DeviceDescriptor, DeviceSession, LabColor, Link, ProtocolError, SerialOptions,
    SessionConfig, Transport, COLORIMETER_VENDOR_ID,
};

pub const MOCK_PORT: &str = "/dev/ttyACM0";

/// How the device answers one fetch-Lab command
#[derive(Debug, Clone)]
pub enum LabReply {
    /// Deliver these chunks, one per read
    Chunks(Vec<Vec<u8>>),
    /// Never answer
    Silent,
}

impl LabReply {
    /// Whole 12-byte reply in one chunk
    pub fn whole(lab: LabColor) -> Self {
        LabReply::Chunks(vec![lab.to_le_bytes().to_vec()])
    }
}

/// Recorded interaction with the device
#[derive(Default)]
pub struct MockDevice {
    /// Chunks waiting to be read
    pub pending: VecDeque<Vec<u8>>,
    /// Replies for successive fetch-Lab commands; default reply when empty
    pub lab_script: VecDeque<LabReply>,
    pub default_lab: Option<LabColor>,
    /// Appended after each Lab reply
    pub trailing: Vec<u8>,
    /// Reply to fetch-report
    pub report: Vec<Vec<u8>>,
    /// Reply to unlock
    pub unlock_ack: Vec<u8>,
    /// Reply to trigger
    pub trigger_ack: Vec<u8>,
    /// Frames written, in order
    pub writes: Vec<Vec<u8>>,
    /// Pending byte count at the moment each frame was written
    pub pending_at_write: Vec<usize>,
    pub devices: Vec<DeviceDescriptor>,
    pub selection: Option<DeviceDescriptor>,
    pub unsupported: bool,
    pub open_delay: Option<Duration>,
    pub fail_open: bool,
    pub fail_unlock_write: bool,
    pub opens: usize,
    pub closes: usize,
    pub open_links: usize,
}

impl MockDevice {
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    pub fn commands(&self) -> Vec<Option<Command>> {
        self.writes.iter().map(|w| Command::from_bytes(w)).collect()
    }

    pub fn count(&self, cmd: Command) -> usize {
        self.writes.iter().filter(|w| w.as_slice() == cmd.bytes()).count()
    }

    fn handle(&mut self, frame: &[u8]) {
        match Command::from_bytes(frame) {
            Some(Command::Unlock) => {
                if !self.unlock_ack.is_empty() {
                    self.pending.push_back(self.unlock_ack.clone());
                }
            }
            Some(Command::TriggerMeasurement) => {
                if !self.trigger_ack.is_empty() {
                    self.pending.push_back(self.trigger_ack.clone());
                }
            }
            Some(Command::FetchLabResult) => {
                let reply = self.lab_script.pop_front().unwrap_or_else(|| {
                    LabReply::whole(self.default_lab.unwrap_or(LabColor::new(50.0, 10.0, 15.0)))
                });
                if let LabReply::Chunks(chunks) = reply {
                    self.pending.extend(chunks);
                    if !self.trailing.is_empty() {
                        self.pending.push_back(self.trailing.clone());
                    }
                }
            }
            Some(Command::FetchFullReport) => {
                self.pending.extend(self.report.clone());
            }
            Some(Command::QueryName) => self.pending.push_back(b"MOCK\r\n".to_vec()),
            Some(Command::QueryVersion) => self.pending.push_back(b"0.0.1\r\n".to_vec()),
            None => {}
        }
    }
}

pub fn colorimeter(path: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        path: path.to_string(),
        vid: Some(COLORIMETER_VENDOR_ID),
        pid: Some(0x0001),
        manufacturer: None,
        product: Some("Colorimeter".to_string()),
        serial_number: None,
    }
}

#[derive(Clone)]
pub struct MockTransport {
    pub device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let device = MockDevice {
            devices: vec![colorimeter(MOCK_PORT)],
            selection: Some(colorimeter(MOCK_PORT)),
            ..Default::default()
        };
        Self {
            device: Arc::new(Mutex::new(device)),
        }
    }

    pub fn with<F: FnOnce(&mut MockDevice)>(self, f: F) -> Self {
        f(&mut self.device.lock().unwrap());
        self
    }

    pub fn session(&self) -> DeviceSession {
        self.session_with(SessionConfig::default())
    }

    pub fn session_with(&self, config: SessionConfig) -> DeviceSession {
        DeviceSession::new(Arc::new(self.clone()), config)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn list_authorized_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        let device = self.device.lock().unwrap();
        if device.unsupported {
            return Err(ProtocolError::UnsupportedEnvironment("mock".to_string()));
        }
        Ok(device.devices.clone())
    }

    async fn request_device_selection(
        &self,
        _vendor_filter: Option<u16>,
    ) -> Result<DeviceDescriptor, ProtocolError> {
        let device = self.device.lock().unwrap();
        if device.unsupported {
            return Err(ProtocolError::UnsupportedEnvironment("mock".to_string()));
        }
        device.selection.clone().ok_or(ProtocolError::SelectionCancelled)
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        _options: &SerialOptions,
    ) -> Result<Box<dyn Link>, ProtocolError> {
        let delay = self.device.lock().unwrap().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut device = self.device.lock().unwrap();
        if device.fail_open {
            return Err(ProtocolError::LinkOpenFailed {
                port: descriptor.path.clone(),
                reason: "busy".to_string(),
            });
        }
        assert_eq!(device.open_links, 0, "second link opened while one is active");
        device.opens += 1;
        device.open_links += 1;

        Ok(Box::new(MockLink {
            device: self.device.clone(),
            descriptor: descriptor.clone(),
            open: true,
        }))
    }
}

pub struct MockLink {
    device: Arc<Mutex<MockDevice>>,
    descriptor: DeviceDescriptor,
    open: bool,
}

#[async_trait]
impl Link for MockLink {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut device = self.device.lock().unwrap();
        if device.fail_unlock_write && data == Command::Unlock.bytes() {
            return Err(ProtocolError::LinkWriteFailed("unplugged".to_string()));
        }
        let pending = device.pending_bytes();
        device.pending_at_write.push(pending);
        device.writes.push(data.to_vec());
        device.handle(data);
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let chunk = self.device.lock().unwrap().pending.pop_front();
        match chunk {
            Some(chunk) => Ok(chunk),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut device = self.device.lock().unwrap();
            device.closes += 1;
            device.open_links -= 1;
        }
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if self.open {
            if let Ok(mut device) = self.device.lock() {
                device.open_links -= 1;
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tonescan_core=debug")
        .with_test_writer()
        .try_init();
}
