//! Demo Mode - Simulated colorimeter for kiosk demos and diagnostics
//!
//! Behaves like the real firmware at the byte level: commands are ignored
//! until the unlock key arrives, every open relocks the device, and replies
//! arrive in uneven chunks with trailing bytes so the session's accumulation
//! and drain logic runs exactly as it does against hardware.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::serial::{DeviceDescriptor, Link, SerialOptions, Transport};
use crate::protocol::{Command, LabColor, ProtocolError, COLORIMETER_VENDOR_ID};

/// Port path reported by the simulated device
pub const DEMO_PORT: &str = "demo://colorimeter";

const DEMO_PRODUCT_ID: u16 = 0x0101;
const DEMO_NAME: &str = "CM-200 Demo";
const DEMO_VERSION: &str = "2.4.1-sim";

/// Simulated device state, shared by every link opened on it
pub struct DemoColorimeter {
    unlocked: bool,
    /// Chunks waiting to be read by the host
    pending: VecDeque<Vec<u8>>,
    /// Reading captured by the last trigger
    last_reading: Option<LabColor>,
    rng: StdRng,
}

impl Default for DemoColorimeter {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoColorimeter {
    /// Simulator seeded from entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic device for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            unlocked: false,
            pending: VecDeque::new(),
            last_reading: None,
            rng,
        }
    }

    /// Whether the unlock key has been received since the last open
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Bytes queued but not yet read
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    fn on_open(&mut self) {
        self.unlocked = false;
    }

    /// Skin tones cluster in a narrow band of Lab space
    fn sample_skin_tone(&mut self) -> LabColor {
        LabColor::new(
            self.rng.gen_range(35.0..75.0),
            self.rng.gen_range(8.0..18.0),
            self.rng.gen_range(10.0..25.0),
        )
    }

    /// Queue `data` split into 1-3 uneven chunks
    fn queue_chunked(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let max = rest.len().min(8);
            let take = if rest.len() <= 2 {
                rest.len()
            } else {
                self.rng.gen_range(1..=max)
            };
            self.pending.push_back(rest[..take].to_vec());
            rest = &rest[take..];
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some(cmd) = Command::from_bytes(frame) else {
            tracing::debug!("demo: ignoring unknown frame {:02X?}", frame);
            return;
        };

        if cmd != Command::Unlock && !self.unlocked {
            tracing::debug!("demo: locked, ignoring {}", cmd.name());
            return;
        }

        match cmd {
            Command::Unlock => {
                self.unlocked = true;
                self.pending.push_back(b"OK\r\n".to_vec());
            }
            Command::QueryName => {
                self.pending.push_back(format!("{}\r\n", DEMO_NAME).into_bytes());
            }
            Command::QueryVersion => {
                self.pending
                    .push_back(format!("{}\r\n", DEMO_VERSION).into_bytes());
            }
            Command::TriggerMeasurement => {
                let reading = self.sample_skin_tone();
                self.last_reading = Some(reading);
                if self.rng.gen_bool(0.5) {
                    self.pending.push_back(vec![0x06]);
                }
            }
            Command::FetchLabResult => {
                if let Some(reading) = self.last_reading {
                    let mut reply = reading.to_le_bytes().to_vec();
                    reply.extend_from_slice(b"\r\n");
                    self.queue_chunked(&reply);
                }
            }
            Command::FetchFullReport => {
                if let Some(reading) = self.last_reading {
                    let report = format!(
                        "MODE,D65/10\r\nCIELAB,{:.2},{:.2},{:.2}\r\nTEMP,24.5C\r\n",
                        reading.l, reading.a, reading.b
                    );
                    self.queue_chunked(report.as_bytes());
                }
            }
        }
    }
}

/// Transport exposing a single simulated colorimeter
#[derive(Clone)]
pub struct DemoTransport {
    device: Arc<Mutex<DemoColorimeter>>,
    descriptor: DeviceDescriptor,
}

impl Default for DemoTransport {
    fn default() -> Self {
        Self::new(DemoColorimeter::new())
    }
}

impl DemoTransport {
    /// Transport exposing `device` as its only port
    pub fn new(device: DemoColorimeter) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            descriptor: DeviceDescriptor {
                path: DEMO_PORT.to_string(),
                vid: Some(COLORIMETER_VENDOR_ID),
                pid: Some(DEMO_PRODUCT_ID),
                manufacturer: Some("ToneScan".to_string()),
                product: Some(DEMO_NAME.to_string()),
                serial_number: Some("SIM-0001".to_string()),
            },
        }
    }

    /// Shared handle to the simulated device
    pub fn device(&self) -> Arc<Mutex<DemoColorimeter>> {
        self.device.clone()
    }
}

#[async_trait]
impl Transport for DemoTransport {
    async fn list_authorized_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        Ok(vec![self.descriptor.clone()])
    }

    async fn request_device_selection(
        &self,
        vendor_filter: Option<u16>,
    ) -> Result<DeviceDescriptor, ProtocolError> {
        match vendor_filter {
            Some(vid) if !self.descriptor.matches_vendor(vid) => {
                Err(ProtocolError::SelectionCancelled)
            }
            _ => Ok(self.descriptor.clone()),
        }
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        options: &SerialOptions,
    ) -> Result<Box<dyn Link>, ProtocolError> {
        if descriptor.path != self.descriptor.path {
            return Err(ProtocolError::LinkOpenFailed {
                port: descriptor.path.clone(),
                reason: "no such simulated device".to_string(),
            });
        }
        if *options != SerialOptions::default() {
            return Err(ProtocolError::LinkOpenFailed {
                port: descriptor.path.clone(),
                reason: "device requires 115200 8N1 without flow control".to_string(),
            });
        }

        self.device.lock().on_open();
        Ok(Box::new(DemoLink {
            device: self.device.clone(),
            descriptor: descriptor.clone(),
            open: true,
        }))
    }
}

struct DemoLink {
    device: Arc<Mutex<DemoColorimeter>>,
    descriptor: DeviceDescriptor,
    open: bool,
}

#[async_trait]
impl Link for DemoLink {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::LinkWriteFailed("link closed".to_string()));
        }
        self.device.lock().handle_frame(data);
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if !self.open {
            return Err(ProtocolError::LinkReadFailed("link closed".to_string()));
        }
        let chunk = self.device.lock().pending.pop_front();
        match chunk {
            Some(chunk) => Ok(chunk),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
