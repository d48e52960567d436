//! Response decoding
//!
//! Two reply formats come back from the firmware:
//! - Lab result: exactly 12 bytes, three little-endian IEEE-754 f32 (L, a, b)
//! - Full report: CRLF-delimited ASCII; lines carrying a known marker hold
//!   comma-separated numeric fields, e.g. `CIELAB,58.43,12.01,15.92`

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::ProtocolError;

/// Length of the binary Lab reply
pub const LAB_RESPONSE_LEN: usize = 12;

/// Report marker for CIE-Lab lines
pub const CIELAB_MARKER: &str = "CIELAB";

/// Markers whose lines are kept when decoding a report
pub const REPORT_MARKERS: &[&str] = &[CIELAB_MARKER];

/// A color in CIE-Lab space as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabColor {
    /// Lightness
    pub l: f32,
    /// Green-red axis
    pub a: f32,
    /// Blue-yellow axis
    pub b: f32,
}

impl LabColor {
    /// Color from its three components
    pub fn new(l: f32, a: f32, b: f32) -> Self {
        Self { l, a, b }
    }

    /// Encode in the device's binary layout
    pub fn to_le_bytes(&self) -> [u8; LAB_RESPONSE_LEN] {
        let mut bytes = [0u8; LAB_RESPONSE_LEN];
        LittleEndian::write_f32(&mut bytes[0..4], self.l);
        LittleEndian::write_f32(&mut bytes[4..8], self.a);
        LittleEndian::write_f32(&mut bytes[8..12], self.b);
        bytes
    }

    /// True when all three components are finite numbers
    pub fn is_finite(&self) -> bool {
        self.l.is_finite() && self.a.is_finite() && self.b.is_finite()
    }
}

/// A validated scan result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMeasurement {
    /// Unique id for correlating with downstream results
    pub id: Uuid,
    /// Measured color
    pub lab: LabColor,
    /// When the reading was decoded
    pub measured_at: DateTime<Utc>,
}

impl ColorMeasurement {
    /// Stamp a fresh id and the current time on `lab`
    pub fn new(lab: LabColor) -> Self {
        Self {
            id: Uuid::new_v4(),
            lab,
            measured_at: Utc::now(),
        }
    }
}

/// Numeric content of an ASCII report, keyed by marker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    /// Values per marker, in the order they appeared
    pub entries: BTreeMap<String, Vec<f64>>,
}

impl DeviceReport {
    /// Values recorded under `marker`
    pub fn get(&self, marker: &str) -> Option<&[f64]> {
        self.entries.get(marker).map(Vec::as_slice)
    }

    /// First three CIELAB values, if present
    pub fn lab(&self) -> Option<LabColor> {
        match self.get(CIELAB_MARKER)? {
            [l, a, b, ..] => Some(LabColor::new(*l as f32, *a as f32, *b as f32)),
            _ => None,
        }
    }

    /// True when no marker line carried a value
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode the 12-byte binary Lab reply
pub fn decode_lab_triple(data: &[u8]) -> Result<LabColor, ProtocolError> {
    if data.len() != LAB_RESPONSE_LEN {
        return Err(ProtocolError::MalformedResponse {
            expected: LAB_RESPONSE_LEN,
            actual: data.len(),
        });
    }

    Ok(LabColor {
        l: LittleEndian::read_f32(&data[0..4]),
        a: LittleEndian::read_f32(&data[4..8]),
        b: LittleEndian::read_f32(&data[8..12]),
    })
}

/// Decode an ASCII report.
///
/// A line is kept when it contains a known marker; its numbers are filed
/// under that marker. The field holding the marker is not a value, and
/// fields that are not numbers are skipped. Lines without a marker or
/// without any number are dropped; firmware interleaves diagnostic text.
pub fn decode_report(data: &[u8]) -> DeviceReport {
    let text = String::from_utf8_lossy(data);
    let mut report = DeviceReport::default();

    for line in text.split("\r\n") {
        let line = line.trim();
        let Some(marker) = REPORT_MARKERS.iter().find(|m| line.contains(*m)) else {
            continue;
        };

        let values: Vec<f64> = line
            .split(',')
            .skip(1)
            .filter_map(|f| f.trim().parse::<f64>().ok())
            .collect();
        if values.is_empty() {
            tracing::debug!("decode_report: no values in {:?}", line);
            continue;
        }

        report
            .entries
            .entry(marker.to_string())
            .or_default()
            .extend(values);
    }

    report
}
