//! Colorimeter Protocol Communication
//!
//! Implements the binary request/response protocol spoken by the handheld
//! colorimeter over a USB serial link.
//!
//! Layers, bottom up:
//! - [`serial`]: transport (discovery, open/close, chunked reads)
//! - [`commands`] and [`response`]: stateless frame encoding and decoding
//! - [`session`]: unlock handshake, measurement cycle, drain and link reset

pub mod commands;
mod error;
pub mod response;
pub mod serial;
pub mod session;

pub use commands::Command;
pub use error::ProtocolError;
pub use response::{decode_lab_triple, decode_report, ColorMeasurement, DeviceReport, LabColor};
pub use serial::{DeviceChooser, DeviceDescriptor, Link, SerialOptions, SerialTransport, Transport};
pub use session::{DeviceSession, SessionConfig, SessionState};

/// Baud rate required by the colorimeter firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// USB vendor id of the colorimeter
pub const COLORIMETER_VENDOR_ID: u16 = 0x2AF6;

/// Bytes requested per read
pub const READ_BUFFER_SIZE: usize = 255;
