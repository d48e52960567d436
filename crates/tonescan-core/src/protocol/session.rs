//! Device session
//!
//! Owns the open link and runs the protocol state machine:
//! unlock after every open, trigger → fetch → accumulate → decode → drain,
//! then a close/reopen of the link before the next scan. One failed scan is
//! retried after a full reconnect.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};

use super::response::{decode_lab_triple, decode_report, LAB_RESPONSE_LEN};
use super::serial::{DeviceDescriptor, Link, SerialOptions, Transport};
use super::{ColorMeasurement, Command, DeviceReport, LabColor, ProtocolError};

/// Timing and retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait after the unlock frame before draining its reply
    pub unlock_settle_ms: u64,
    /// Wait after triggering so the device starts integrating
    pub trigger_settle_ms: u64,
    /// Wait after a fetch command before reading
    pub fetch_settle_ms: u64,
    /// Per-read timeout while accumulating a reply
    pub chunk_timeout_ms: u64,
    /// Overall deadline for one reply
    pub measurement_deadline_ms: u64,
    /// Per-read timeout while draining
    pub drain_timeout_ms: u64,
    /// Upper bound on a single drain
    pub drain_deadline_ms: u64,
    /// Quiet gap that ends a variable-length ASCII reply
    pub report_idle_ms: u64,
    /// Measurement attempts per scan (2 = one retry)
    pub scan_attempts: u8,
    /// Line parameters
    pub serial: SerialOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unlock_settle_ms: 100,
            trigger_settle_ms: 100,
            fetch_settle_ms: 50,
            chunk_timeout_ms: 100,
            measurement_deadline_ms: 5000,
            drain_timeout_ms: 50,
            drain_deadline_ms: 1000,
            report_idle_ms: 200,
            scan_attempts: 2,
            serial: SerialOptions::default(),
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link
    Idle,
    /// Opening the port
    Connecting,
    /// Port open, handshake in flight
    Unlocking,
    /// Open and unlocked
    Ready,
    /// Measurement cycle in flight
    Scanning,
    /// Last cycle failed
    Faulted,
    /// Closing and reopening the link
    Reconnecting,
}

/// Clears the connect-in-progress flag on every exit path
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ProtocolError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ProtocolError::ConnectInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SessionInner {
    link: Option<Box<dyn Link>>,
    /// Last device successfully opened; reused by resets and retries
    descriptor: Option<DeviceDescriptor>,
}

/// A conversation with one colorimeter.
///
/// All operations are serialized on an internal lock; a second `connect`
/// while one is in flight is rejected rather than queued.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    state: watch::Sender<SessionState>,
    connecting: AtomicBool,
    verbose: AtomicBool,
}

impl DeviceSession {
    /// Idle session over `transport`
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            transport,
            config,
            inner: Mutex::new(SessionInner {
                link: None,
                descriptor: None,
            }),
            state,
            connecting: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
        }
    }

    /// Timing and retry configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// True while a connect is between open and unlock
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// True when a link is open and unlocked
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Ready | SessionState::Scanning | SessionState::Reconnecting
        )
    }

    /// Enable hex dumps of every frame (target `tonescan::wire`)
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Whether frame hex dumps are enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Device the session last opened, if any
    pub async fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.inner.lock().await.descriptor.clone()
    }

    /// Devices the host already has access to
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ProtocolError> {
        self.transport.list_authorized_devices().await
    }

    /// Prompt the operator for a device
    pub async fn request_device(
        &self,
        vendor_filter: Option<u16>,
    ) -> Result<DeviceDescriptor, ProtocolError> {
        self.transport.request_device_selection(vendor_filter).await
    }

    /// Open the link and unlock the firmware.
    ///
    /// Fails with [`ProtocolError::ConnectInProgress`] if another connect is
    /// in flight and [`ProtocolError::AlreadyConnected`] if a link is open.
    pub async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<(), ProtocolError> {
        let _guard = ConnectGuard::acquire(&self.connecting)?;
        let mut inner = self.inner.lock().await;
        if inner.link.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.open_and_unlock(&mut inner, descriptor).await
    }

    /// Close the link. Safe from any state.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut link) = inner.link.take() {
            link.close().await;
        }
        self.set_state(SessionState::Idle);
    }

    /// Run one measurement cycle and return the Lab reading.
    ///
    /// A recoverable failure is retried once after reconnecting to the same
    /// device. Once the call fails for good the link is drained and closed.
    pub async fn scan(&self) -> Result<ColorMeasurement, ProtocolError> {
        let mut inner = self.inner.lock().await;
        if inner.link.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        let attempts = self.config.scan_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.set_state(SessionState::Scanning);
            let result = match inner.link.as_mut() {
                Some(link) => self.measure(link.as_mut()).await,
                None => Err(ProtocolError::NotConnected),
            };

            let err = match result {
                Ok(lab) => {
                    self.hard_reset(&mut inner).await;
                    let measurement = ColorMeasurement::new(lab);
                    tracing::info!(
                        "Scan {} complete: L={:.2} a={:.2} b={:.2}",
                        measurement.id,
                        lab.l,
                        lab.a,
                        lab.b
                    );
                    return Ok(measurement);
                }
                Err(e) => e,
            };

            self.set_state(SessionState::Faulted);

            if err.is_recoverable() && attempt < attempts {
                tracing::warn!(
                    "Scan attempt {}/{} failed: {}; reconnecting",
                    attempt,
                    attempts,
                    err
                );
                if let Err(reconnect_err) = self.reconnect(&mut inner).await {
                    tracing::warn!("Reconnect for scan retry failed: {}", reconnect_err);
                    self.abandon(&mut inner).await;
                    return Err(ProtocolError::MeasurementFailed {
                        attempts: attempt,
                        source: Box::new(reconnect_err),
                    });
                }
                attempt += 1;
                continue;
            }

            tracing::warn!("Scan failed on attempt {}/{}: {}", attempt, attempts, err);
            self.abandon(&mut inner).await;
            if err.is_recoverable() || attempt > 1 {
                return Err(ProtocolError::MeasurementFailed {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            return Err(err);
        }
    }

    /// Trigger a measurement and fetch the ASCII report instead of the
    /// binary triple. The link is kept open afterwards.
    pub async fn fetch_full_report(&self) -> Result<DeviceReport, ProtocolError> {
        let mut inner = self.inner.lock().await;
        let Some(link) = inner.link.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        self.set_state(SessionState::Scanning);
        match self.report_cycle(link.as_mut()).await {
            Ok(report) => {
                self.set_state(SessionState::Ready);
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Full report failed: {}", e);
                self.set_state(SessionState::Faulted);
                self.abandon(&mut inner).await;
                Err(e)
            }
        }
    }

    /// Device name (`80`)
    pub async fn query_name(&self) -> Result<String, ProtocolError> {
        self.query_text(Command::QueryName).await
    }

    /// Firmware version (`A0 03 C0`)
    pub async fn query_version(&self) -> Result<String, ProtocolError> {
        self.query_text(Command::QueryVersion).await
    }

    async fn query_text(&self, cmd: Command) -> Result<String, ProtocolError> {
        let mut inner = self.inner.lock().await;
        let link = inner.link.as_mut().ok_or(ProtocolError::NotConnected)?;

        self.send(link.as_mut(), cmd).await?;
        sleep(ms(self.config.fetch_settle_ms)).await;
        let data = self.read_until_idle(link.as_mut()).await?;
        if data.is_empty() {
            return Err(ProtocolError::MeasurementTimeout {
                received: 0,
                expected: 1,
            });
        }

        Ok(String::from_utf8_lossy(&data)
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("session: {:?} -> {:?}", previous, state);
        }
    }

    async fn open_and_unlock(
        &self,
        inner: &mut SessionInner,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), ProtocolError> {
        self.set_state(SessionState::Connecting);
        tracing::info!("Connecting to colorimeter on {}", descriptor.path);

        let mut link = match self.transport.open(descriptor, &self.config.serial).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Failed to open {}: {}", descriptor.path, e);
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        };

        self.set_state(SessionState::Unlocking);
        if let Err(e) = self.unlock(link.as_mut()).await {
            tracing::warn!("Unlock failed on {}: {}", descriptor.path, e);
            link.close().await;
            self.set_state(SessionState::Idle);
            return Err(e);
        }

        inner.link = Some(link);
        inner.descriptor = Some(descriptor.clone());
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// The firmware's unlock acknowledgement carries no contract; it is
    /// drained and ignored.
    async fn unlock(&self, link: &mut dyn Link) -> Result<(), ProtocolError> {
        self.send(link, Command::Unlock).await?;
        sleep(ms(self.config.unlock_settle_ms)).await;
        self.drain_best_effort(link, "unlock").await;
        Ok(())
    }

    /// One trigger/fetch/accumulate/decode/drain pass
    async fn measure(&self, link: &mut dyn Link) -> Result<LabColor, ProtocolError> {
        self.send(link, Command::TriggerMeasurement).await?;
        sleep(ms(self.config.trigger_settle_ms)).await;
        self.drain_best_effort(link, "trigger").await;

        self.send(link, Command::FetchLabResult).await?;
        sleep(ms(self.config.fetch_settle_ms)).await;

        let raw = accumulate(
            link,
            LAB_RESPONSE_LEN,
            ms(self.config.chunk_timeout_ms),
            ms(self.config.measurement_deadline_ms),
        )
        .await?;
        self.trace_rx(&raw);

        let lab = decode_lab_triple(&raw)?;
        if !lab.is_finite() {
            return Err(ProtocolError::InvalidReading {
                l: lab.l,
                a: lab.a,
                b: lab.b,
            });
        }

        // Trailing bytes would be read as the head of the next reply
        let trailing = self.drain(link).await?;
        if trailing > 0 {
            tracing::debug!("measure: drained {} trailing bytes", trailing);
        }

        Ok(lab)
    }

    async fn report_cycle(&self, link: &mut dyn Link) -> Result<DeviceReport, ProtocolError> {
        self.send(link, Command::TriggerMeasurement).await?;
        sleep(ms(self.config.trigger_settle_ms)).await;
        self.drain_best_effort(link, "trigger").await;

        self.send(link, Command::FetchFullReport).await?;
        sleep(ms(self.config.fetch_settle_ms)).await;

        let data = self.read_until_idle(link).await?;
        if data.is_empty() {
            return Err(ProtocolError::MeasurementTimeout {
                received: 0,
                expected: 1,
            });
        }

        let report = decode_report(&data);
        if report.is_empty() {
            tracing::warn!(
                "Full report of {} bytes contained no recognized lines",
                data.len()
            );
        }
        Ok(report)
    }

    /// Close the link and reopen it on the same device.
    ///
    /// The firmware leaves its state inconsistent after a measurement unless
    /// the link is torn down. A failed reopen leaves the session idle.
    async fn hard_reset(&self, inner: &mut SessionInner) {
        let Some(mut link) = inner.link.take() else {
            return;
        };
        let descriptor = link.descriptor().clone();
        link.close().await;
        drop(link);

        self.set_state(SessionState::Reconnecting);
        if let Err(e) = self.open_and_unlock(inner, &descriptor).await {
            tracing::warn!("Link reset after scan failed: {}; session is idle", e);
        }
    }

    /// Disconnect, rediscover the device and connect again
    async fn reconnect(&self, inner: &mut SessionInner) -> Result<(), ProtocolError> {
        self.set_state(SessionState::Reconnecting);
        let previous = inner
            .link
            .as_ref()
            .map(|l| l.descriptor().clone())
            .or_else(|| inner.descriptor.clone())
            .ok_or(ProtocolError::NotConnected)?;

        if let Some(mut link) = inner.link.take() {
            link.close().await;
        }

        let devices = self.transport.list_authorized_devices().await?;
        let target = devices
            .iter()
            .find(|d| d.path == previous.path)
            .or_else(|| {
                previous
                    .vid
                    .and_then(|vid| devices.iter().find(|d| d.matches_vendor(vid)))
            })
            .cloned()
            .ok_or(ProtocolError::DeviceNotFound)?;

        self.open_and_unlock(inner, &target).await
    }

    /// Drop a link that can no longer be trusted
    async fn abandon(&self, inner: &mut SessionInner) {
        if let Some(mut link) = inner.link.take() {
            self.drain_best_effort(link.as_mut(), "abandon").await;
            link.close().await;
        }
        self.set_state(SessionState::Idle);
    }

    async fn send(&self, link: &mut dyn Link, cmd: Command) -> Result<(), ProtocolError> {
        tracing::debug!("send: {}", cmd.name());
        if self.is_verbose() {
            tracing::debug!(target: "tonescan::wire", "tx {:02X?}", cmd.bytes());
        }
        link.write(cmd.bytes()).await
    }

    fn trace_rx(&self, data: &[u8]) {
        if self.is_verbose() && !data.is_empty() {
            tracing::debug!(target: "tonescan::wire", "rx {:02X?}", data);
        }
    }

    /// Discard input until the line goes quiet; returns bytes discarded
    async fn drain(&self, link: &mut dyn Link) -> Result<usize, ProtocolError> {
        let deadline = Instant::now() + ms(self.config.drain_deadline_ms);
        let mut discarded = 0;

        loop {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "drain: device still sending after {}ms ({} bytes discarded)",
                    self.config.drain_deadline_ms,
                    discarded
                );
                break;
            }
            let chunk = link.read_chunk(ms(self.config.drain_timeout_ms)).await?;
            if chunk.is_empty() {
                break;
            }
            self.trace_rx(&chunk);
            discarded += chunk.len();
        }

        Ok(discarded)
    }

    /// Drain where silence and read errors are both acceptable
    async fn drain_best_effort(&self, link: &mut dyn Link, context: &str) {
        match self.drain(link).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("{}: discarded {} reply bytes", context, n),
            Err(e) => tracing::debug!("{}: ignoring reply read error: {}", context, e),
        }
    }

    /// Collect a variable-length reply that ends when the line goes quiet
    async fn read_until_idle(&self, link: &mut dyn Link) -> Result<Vec<u8>, ProtocolError> {
        let data = read_until_idle(
            link,
            ms(self.config.chunk_timeout_ms),
            ms(self.config.report_idle_ms),
            ms(self.config.measurement_deadline_ms),
        )
        .await?;
        self.trace_rx(&data);
        Ok(data)
    }
}

/// Read exactly `expected` bytes, polling with `chunk_timeout` until
/// `deadline` has elapsed.
///
/// Bytes beyond `expected` in the final chunk are discarded.
pub(crate) async fn accumulate(
    link: &mut dyn Link,
    expected: usize,
    chunk_timeout: Duration,
    deadline: Duration,
) -> Result<Vec<u8>, ProtocolError> {
    let deadline = Instant::now() + deadline;
    let mut buffer = vec![0u8; expected];
    let mut offset = 0;

    while offset < expected {
        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(
                "accumulate: timed out after reading {} of {} bytes",
                offset,
                expected
            );
            return Err(ProtocolError::MeasurementTimeout {
                received: offset,
                expected,
            });
        }

        let chunk = link.read_chunk(chunk_timeout.min(deadline - now)).await?;
        if chunk.is_empty() {
            continue;
        }

        let take = chunk.len().min(expected - offset);
        buffer[offset..offset + take].copy_from_slice(&chunk[..take]);
        offset += take;

        if take < chunk.len() {
            tracing::debug!(
                "accumulate: discarding {} surplus bytes",
                chunk.len() - take
            );
        }
    }

    Ok(buffer)
}

/// Read until `idle` passes without data (after the first byte) or
/// `deadline` elapses. Returns an empty vector if nothing arrived.
pub(crate) async fn read_until_idle(
    link: &mut dyn Link,
    chunk_timeout: Duration,
    idle: Duration,
    deadline: Duration,
) -> Result<Vec<u8>, ProtocolError> {
    let deadline = Instant::now() + deadline;
    let mut data = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let wait = if data.is_empty() { chunk_timeout } else { idle };
        let chunk = link.read_chunk(wait.min(deadline - now)).await?;
        if chunk.is_empty() {
            if !data.is_empty() {
                break;
            }
            continue;
        }
        data.extend_from_slice(&chunk);
    }

    Ok(data)
}
