//! # ToneScan Core Library
//!
//! Device layer for the skin-tone matching kiosk.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial transport and device discovery for the handheld colorimeter
//! - The colorimeter's binary command/response protocol
//! - A device session with unlock handshake, timed reads, drain, link reset
//!   and a single reconnect-and-retry per scan
//! - A scanner service exposing connection status to the UI layer
//! - A simulated colorimeter and a structured self-test
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tonescan_core::protocol::{DeviceSession, SerialTransport, SessionConfig};
//! use tonescan_core::service::ScannerService;
//!
//! let session = DeviceSession::new(Arc::new(SerialTransport::new()), SessionConfig::default());
//! let scanner = ScannerService::new(session);
//!
//! scanner.auto_connect().await;
//! if let Some(measurement) = scanner.trigger_scan().await {
//!     println!("L={} a={} b={}", measurement.lab.l, measurement.lab.a, measurement.lab.b);
//! }
//! ```

pub mod config;
pub mod demo;
pub mod diagnostics;
pub mod protocol;
pub mod service;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::demo::DemoTransport;
    pub use crate::diagnostics::{run_self_test, DiagnosticReport};
    pub use crate::protocol::{
        ColorMeasurement, DeviceDescriptor, DeviceReport, DeviceSession, LabColor,
        ProtocolError, SerialTransport, SessionConfig, SessionState, Transport,
    };
    pub use crate::service::{ConnectionState, ConnectionStatus, ScannerService};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
