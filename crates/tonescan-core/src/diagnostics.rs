//! Diagnostics
//!
//! Self-test runner for technicians. Each step of the device conversation is
//! run in order and recorded as a [`CheckResult`] with its own log lines, so
//! callers decide how to display the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Instant;

use crate::protocol::{DeviceDescriptor, DeviceSession, ProtocolError, SessionState};

/// Outcome of one diagnostic step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Step name, e.g. `connect`
    pub name: String,
    /// Whether the step succeeded
    pub passed: bool,
    /// Wall time spent in the step
    pub elapsed_ms: u64,
    /// Diagnostic output captured for this step
    pub lines: Vec<String>,
}

/// Full self-test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Start of the run
    pub started_at: DateTime<Utc>,
    /// End of the run
    pub finished_at: DateTime<Utc>,
    /// Steps in the order they ran
    pub checks: Vec<CheckResult>,
}

impl DiagnosticReport {
    /// True when every step passed
    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    /// Steps that failed
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

async fn run_check<T, F, D>(
    checks: &mut Vec<CheckResult>,
    name: &str,
    step: F,
    describe: D,
) -> Option<T>
where
    F: Future<Output = Result<T, ProtocolError>>,
    D: FnOnce(&T) -> Vec<String>,
{
    let start = Instant::now();
    let result = step.await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let (passed, lines, value) = match result {
        Ok(value) => (true, describe(&value), Some(value)),
        Err(e) => (false, vec![format!("error: {}", e)], None),
    };

    tracing::info!(
        "diagnostics: {} {} ({}ms)",
        name,
        if passed { "passed" } else { "FAILED" },
        elapsed_ms
    );
    checks.push(CheckResult {
        name: name.to_string(),
        passed,
        elapsed_ms,
        lines,
    });
    value
}

/// Run discovery, connect, identity queries, a scan, a full report and a
/// disconnect against the session's transport.
///
/// Steps that need a link are skipped (and recorded as failed) once
/// connecting has failed. The session is left disconnected.
pub async fn run_self_test(session: &DeviceSession, vendor_id: u16) -> DiagnosticReport {
    let started_at = Utc::now();
    let mut checks = Vec::new();

    let devices = run_check(
        &mut checks,
        "discover",
        session.list_devices(),
        |devices: &Vec<DeviceDescriptor>| {
            devices
                .iter()
                .map(|d| format!("{} vid={:04x?} pid={:04x?}", d.path, d.vid, d.pid))
                .collect()
        },
    )
    .await
    .unwrap_or_default();

    let target = devices.into_iter().find(|d| d.matches_vendor(vendor_id));
    let connected = match target {
        Some(device) => run_check(
            &mut checks,
            "connect",
            session.connect(&device),
            |_| vec![format!("unlocked {}", device.path)],
        )
        .await
        .is_some(),
        None => {
            checks.push(CheckResult {
                name: "connect".to_string(),
                passed: false,
                elapsed_ms: 0,
                lines: vec![format!("no device with vendor id {:#06x}", vendor_id)],
            });
            false
        }
    };

    if connected {
        run_check(&mut checks, "query-name", session.query_name(), |name| {
            vec![format!("name: {}", name)]
        })
        .await;
        run_check(
            &mut checks,
            "query-version",
            session.query_version(),
            |version| vec![format!("version: {}", version)],
        )
        .await;
        run_check(&mut checks, "scan", session.scan(), |m| {
            vec![format!("L={:.2} a={:.2} b={:.2}", m.lab.l, m.lab.a, m.lab.b)]
        })
        .await;

        // A failed scan closes the link; report needs it open
        if session.is_connected() {
            run_check(&mut checks, "full-report", session.fetch_full_report(), |r| {
                r.entries
                    .iter()
                    .map(|(k, v)| format!("{}: {:?}", k, v))
                    .collect()
            })
            .await;
        }
    }

    session.disconnect().await;
    checks.push(CheckResult {
        name: "disconnect".to_string(),
        passed: session.state() == SessionState::Idle,
        elapsed_ms: 0,
        lines: vec![format!("state: {:?}", session.state())],
    });

    DiagnosticReport {
        started_at,
        finished_at: Utc::now(),
        checks,
    }
}

/// Debug switches for a running session
pub struct DebugControls<'a> {
    session: &'a DeviceSession,
}

impl<'a> DebugControls<'a> {
    /// Controls for `session`
    pub fn new(session: &'a DeviceSession) -> Self {
        Self { session }
    }

    /// Toggle frame hex dumps
    pub fn set_verbose(&self, verbose: bool) {
        tracing::info!("Wire tracing {}", if verbose { "enabled" } else { "disabled" });
        self.session.set_verbose(verbose);
    }

    /// Whether hex dumps are on
    pub fn verbose(&self) -> bool {
        self.session.is_verbose()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}
