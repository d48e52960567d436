//! Serial port handling
//!
//! The transport layer: device discovery, opening links and byte-level I/O.
//! The protocol layers above only see the [`Transport`] and [`Link`] traits,
//! so a simulated device or a test double can stand in for real hardware.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::spawn_blocking;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::{ProtocolError, DEFAULT_BAUD_RATE, READ_BUFFER_SIZE};

/// A device the host may open
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Port path (e.g., "/dev/ttyACM0" or "COM3")
    pub path: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl DeviceDescriptor {
    /// Descriptor for a bare port path with no USB identity
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// True when the USB vendor id equals `vendor_id`
    pub fn matches_vendor(&self, vendor_id: u16) -> bool {
        self.vid == Some(vendor_id)
    }
}

impl From<SerialPortInfo> for DeviceDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            path: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Line parameters for opening a link.
///
/// The defaults are what the colorimeter firmware requires; nothing else
/// works with the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOptions {
    /// Line speed
    pub baud_rate: u32,
    /// Bits per character
    pub data_bits: u8,
    /// Stop bits per character
    pub stop_bits: u8,
    /// Parity mode
    pub parity: Parity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Size of a single read
    pub buffer_size: usize,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: false,
            buffer_size: READ_BUFFER_SIZE,
        }
    }
}

impl SerialOptions {
    fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        if self.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        }
    }

    fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }

    fn tokio_flow_control(&self) -> tokio_serial::FlowControl {
        if self.flow_control {
            tokio_serial::FlowControl::Hardware
        } else {
            tokio_serial::FlowControl::None
        }
    }
}

/// One opened link to a device.
///
/// The link exclusively owns the input and output channels of the port.
#[async_trait]
pub trait Link: Send {
    /// The device this link was opened on
    fn descriptor(&self) -> &DeviceDescriptor;

    /// False once [`Link::close`] has run
    fn is_open(&self) -> bool;

    /// Write every byte of `data`
    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Return whatever arrives within `timeout`.
    ///
    /// An empty vector means nothing arrived; only real I/O failures are errors.
    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Release the channels and close the port. Closing twice is a no-op.
    async fn close(&mut self);
}

/// Device discovery and link factory
#[async_trait]
pub trait Transport: Send + Sync {
    /// Devices the host already has access to
    async fn list_authorized_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError>;

    /// Ask the operator to pick a device, optionally limited to one vendor
    async fn request_device_selection(
        &self,
        vendor_filter: Option<u16>,
    ) -> Result<DeviceDescriptor, ProtocolError>;

    /// Open a link with the given line parameters
    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        options: &SerialOptions,
    ) -> Result<Box<dyn Link>, ProtocolError>;
}

/// Interactive device picker supplied by the host application.
///
/// Returning `None` means the operator dismissed the prompt.
pub trait DeviceChooser: Send + Sync {
    /// Pick one of `candidates`
    fn choose(&self, candidates: &[DeviceDescriptor]) -> Option<DeviceDescriptor>;
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Result<Vec<DeviceDescriptor>, ProtocolError> {
    let available = serialport::available_ports()
        .map_err(|e| ProtocolError::UnsupportedEnvironment(e.to_string()))?;

    let mut map: HashMap<String, DeviceDescriptor> = HashMap::new();
    for info in available {
        let d = DeviceDescriptor::from(info);
        map.entry(d.path.clone()).or_insert(d);
    }

    // Linux-only: ports the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| DeviceDescriptor::from_path(full));
                }
            }
        }
    }

    let mut v: Vec<DeviceDescriptor> = map.into_values().collect();
    v.sort_by_key(|d| port_sort_key(&d.path));
    Ok(v)
}

/// Transport over real serial ports
#[derive(Clone, Default)]
pub struct SerialTransport {
    chooser: Option<Arc<dyn DeviceChooser>>,
}

impl SerialTransport {
    /// Transport without an interactive chooser; selection prompts fail
    pub fn new() -> Self {
        Self { chooser: None }
    }

    /// Transport that prompts through `chooser`
    pub fn with_chooser(chooser: Arc<dyn DeviceChooser>) -> Self {
        Self {
            chooser: Some(chooser),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn list_authorized_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        spawn_blocking(list_ports)
            .await
            .map_err(|e| ProtocolError::UnsupportedEnvironment(e.to_string()))?
    }

    async fn request_device_selection(
        &self,
        vendor_filter: Option<u16>,
    ) -> Result<DeviceDescriptor, ProtocolError> {
        let chooser = self.chooser.clone().ok_or_else(|| {
            ProtocolError::UnsupportedEnvironment("no interactive device chooser".to_string())
        })?;

        let candidates: Vec<DeviceDescriptor> = self
            .list_authorized_devices()
            .await?
            .into_iter()
            .filter(|d| vendor_filter.map_or(true, |vid| d.matches_vendor(vid)))
            .collect();

        // Choosers block on operator input
        spawn_blocking(move || chooser.choose(&candidates))
            .await
            .map_err(|e| ProtocolError::UnsupportedEnvironment(e.to_string()))?
            .ok_or(ProtocolError::SelectionCancelled)
    }

    async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        options: &SerialOptions,
    ) -> Result<Box<dyn Link>, ProtocolError> {
        let path = descriptor.path.clone();
        let opts = options.clone();

        let port = spawn_blocking(move || open_stream(&path, &opts))
            .await
            .map_err(|e| ProtocolError::LinkOpenFailed {
                port: descriptor.path.clone(),
                reason: e.to_string(),
            })??;

        tracing::info!(
            "Opened {} at {} baud",
            descriptor.path,
            options.baud_rate
        );

        Ok(Box::new(SerialLink {
            descriptor: descriptor.clone(),
            stream: Some(port),
            buffer_size: options.buffer_size.max(1),
        }))
    }
}

fn open_stream(path: &str, options: &SerialOptions) -> Result<SerialStream, ProtocolError> {
    let mut port = tokio_serial::new(path, options.baud_rate)
        .data_bits(options.tokio_data_bits())
        .parity(options.tokio_parity())
        .stop_bits(options.tokio_stop_bits())
        .flow_control(options.tokio_flow_control())
        .open_native_async()
        .map_err(|e| ProtocolError::LinkOpenFailed {
            port: path.to_string(),
            reason: e.to_string(),
        })?;

    // Keep DTR asserted; toggling it resets some USB bridges
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("open_stream: failed to set DTR high on {}: {} (continuing)", path, e);
    }

    // Stale bytes from a previous session would corrupt the first reply
    if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
        tracing::debug!("open_stream: failed to clear buffers on {}: {}", path, e);
    }

    Ok(port)
}

/// Link over a tokio-serial stream
pub struct SerialLink {
    descriptor: DeviceDescriptor,
    stream: Option<SerialStream>,
    buffer_size: usize,
}

#[async_trait]
impl Link for SerialLink {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        stream
            .write_all(data)
            .await
            .map_err(|e| ProtocolError::LinkWriteFailed(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| ProtocolError::LinkWriteFailed(e.to_string()))
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let mut buffer = vec![0u8; self.buffer_size];

        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Ok(Err(ref e))
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Ok(Err(e)) => Err(ProtocolError::LinkReadFailed(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Closed {}", self.descriptor.path);
        }
    }
}
