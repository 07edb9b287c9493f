//! Peripheral session
//!
//! Owns the connection lifecycle (`Disconnected -> Scanning -> Connected ->
//! Disconnected`) and routes every inbound notification through the frame
//! decoder into the gesture classifier. All entry points take the current
//! session-relative time; nothing here sleeps or awaits.

use crate::domain::gestures::GestureClassifier;
use crate::domain::models::{
    AppEvent, ConnectionStatus, GestureKind, MessageSeverity, SensorSnapshot, StatusMessage,
};
use crate::domain::settings::{FrameValidation, Settings};
use crate::domain::timers::{earliest, TimerHandle, Timers};
use crate::error::LinkError;
use crate::infrastructure::bluetooth::connection::{
    AttemptId, Discovery, DiscoveryRequest, PacketId, PeripheralLink,
};
use crate::infrastructure::bluetooth::protocol::{
    decode_frame, read_memory_strides, DeviceProfile, OutboundCommand,
};
use crate::infrastructure::bluetooth::transport::{
    CommandTransport, SendOutcome, TransportConfig, WriteTarget,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Scanning,
    Connected,
}

#[derive(Debug)]
enum SessionTimer {
    /// No notification for the whole watchdog window
    DataStall,
    /// One stride of a paced memory dump
    ReadStride(OutboundCommand),
}

pub struct PeripheralSession<D: Discovery> {
    profile: DeviceProfile,
    validation: FrameValidation,
    data_stall_timeout: Duration,
    chunk_interval: Duration,
    settle_delay: Duration,
    read_stride: u8,

    discovery: D,
    link: Option<D::Link>,
    state: SessionState,
    pending_attempt: Option<AttemptId>,
    next_attempt: u64,

    classifier: GestureClassifier,
    transport: CommandTransport,
    timers: Timers<SessionTimer>,
    stall_timer: Option<TimerHandle>,

    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<D: Discovery> PeripheralSession<D> {
    pub fn new(
        settings: &Settings,
        profile: DeviceProfile,
        discovery: D,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let target = profile.write_char.map(|characteristic| WriteTarget {
            service: profile.service,
            characteristic,
        });
        let classifier =
            GestureClassifier::new(settings.gestures.clone(), profile.layout.sensor_profile());
        let link = &settings.link;

        Self {
            validation: settings.frame_validation,
            data_stall_timeout: Duration::from_millis(link.data_stall_timeout_ms),
            chunk_interval: Duration::from_millis(link.chunk_interval_ms),
            settle_delay: Duration::from_millis(link.settle_delay_ms),
            read_stride: link.read_memory_stride,
            transport: CommandTransport::new(TransportConfig::from(link), target),
            profile,
            discovery,
            link: None,
            state: SessionState::Disconnected,
            pending_attempt: None,
            next_attempt: 0,
            classifier,
            timers: Timers::new(),
            stall_timer: None,
            event_sender,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
            && self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    /// Read-only view of the latest sensor and gesture state.
    /// Still answers after a disconnect, with the last known values.
    pub fn sensors(&self) -> &GestureClassifier {
        &self.classifier
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.classifier.snapshot(self.is_connected())
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn is_transport_busy(&self) -> bool {
        self.transport.is_busy()
    }

    /// Begin a connection attempt. No-op while scanning or connected.
    pub fn scan(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!("Scan ignored, session is {:?}", self.state);
            return;
        }

        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.pending_attempt = Some(attempt);
        self.state = SessionState::Scanning;

        info!("Searching for {:?} ({})", self.profile.name, self.profile.service);
        self.send_status(ConnectionStatus::Scanning);
        self.send_log(
            &format!("Searching for {}...", self.profile.name),
            MessageSeverity::Info,
        );

        self.discovery.search_and_connect(DiscoveryRequest {
            attempt,
            name: self.profile.name.clone(),
            service: self.profile.service,
        });
    }

    /// Resolution of a [`scan`](Self::scan) attempt
    pub fn on_discovery_resolved(
        &mut self,
        attempt: AttemptId,
        result: Result<D::Link, LinkError>,
        now: Duration,
    ) {
        if self.pending_attempt != Some(attempt) {
            match result {
                Ok(mut link) => {
                    warn!("Ignoring success from stale connection attempt {:?}", attempt);
                    link.disconnect();
                }
                Err(e) => warn!(
                    "Ignoring failure from stale connection attempt {:?}: {}",
                    attempt, e
                ),
            }
            return;
        }
        self.pending_attempt = None;

        match result {
            Ok(link) => self.on_connect(link, now),
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.state = SessionState::Disconnected;
                self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                self.send_status(ConnectionStatus::Error);
            }
        }
    }

    fn on_connect(&mut self, mut link: D::Link, now: Duration) {
        if let Err(e) = link.start_notifications(self.profile.service, self.profile.notify_char) {
            error!("Could not enable notifications: {}", e);
            link.disconnect();
            self.state = SessionState::Disconnected;
            self.send_log(
                &format!("Could not enable notifications: {}", e),
                MessageSeverity::Error,
            );
            self.send_status(ConnectionStatus::Error);
            return;
        }

        // Sensor and gesture state belong to one connection
        self.classifier.reset();
        self.link = Some(link);
        self.state = SessionState::Connected;
        self.arm_stall_watchdog(now);

        info!("Connected to {}", self.profile.name);
        self.send_log("Connection established!", MessageSeverity::Success);
        self.send_status(ConnectionStatus::Connected);
    }

    /// Route one inbound payload: decode, classify, emit edge events
    pub fn on_notification(&mut self, bytes: &[u8], now: Duration) {
        if self.state != SessionState::Connected {
            trace!("Notification while {:?}, ignored", self.state);
            return;
        }
        self.advance(now);
        if self.state != SessionState::Connected {
            return;
        }
        self.arm_stall_watchdog(now);

        debug!("Received: {:02X?}", bytes);
        let _ = self
            .event_sender
            .send(AppEvent::Notification(bytes.to_vec()));

        let frame = match decode_frame(bytes, &self.profile.layout, self.validation) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                return;
            }
        };

        let flag_was_set = self.classifier.state().green_flag;
        let before = GestureKind::ALL.map(|kind| self.classifier.is_gesture(kind));

        self.classifier.ingest(&frame, now);

        if flag_was_set && !frame.green_flag {
            debug!("Green flag released");
            let _ = self.event_sender.send(AppEvent::GreenFlag);
        }
        for (kind, was_active) in GestureKind::ALL.into_iter().zip(before) {
            if !was_active && self.classifier.is_gesture(kind) {
                debug!("Gesture: {}", kind.name());
                let _ = self.event_sender.send(AppEvent::Gesture(kind));
            }
        }
    }

    pub fn on_write_complete(&mut self, id: PacketId, result: Result<(), LinkError>, now: Duration) {
        self.advance(now);
        self.transport.on_write_complete(id, result);
    }

    /// The peripheral dropped the connection on its own
    pub fn on_link_lost(&mut self) {
        if self.state == SessionState::Connected {
            warn!("Peripheral disconnected");
            self.send_log("Peripheral disconnected", MessageSeverity::Warning);
        }
        self.disconnect();
    }

    /// Tear down the connection and every session timer. Safe to repeat.
    pub fn disconnect(&mut self) {
        self.stall_timer = None;
        self.timers.clear();
        self.transport.reset();
        self.pending_attempt = None;

        if let Some(mut link) = self.link.take() {
            link.disconnect();
            info!("Disconnected from device");
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }

        if self.state != SessionState::Disconnected {
            self.state = SessionState::Disconnected;
            self.send_status(ConnectionStatus::Disconnected);
        }
    }

    /// Hand a raw payload to the transport. Dropped silently when busy or
    /// disconnected. Returns when the caller's settle delay ends.
    pub fn send(&mut self, payload: &[u8], now: Duration) -> Duration {
        self.advance(now);
        self.dispatch(payload, now);
        now + self.settle_delay
    }

    fn dispatch(&mut self, payload: &[u8], now: Duration) {
        match self.transport.send(payload, self.link.as_mut(), now) {
            SendOutcome::Scheduled { packets } => {
                trace!("Command of {} packet(s) scheduled", packets)
            }
            outcome => debug!("Command dropped: {:?}", outcome),
        }
    }

    pub fn send_command(&mut self, command: &OutboundCommand, now: Duration) -> Duration {
        self.send(&command.encode(), now)
    }

    pub fn set_led(&mut self, index: u8, on: bool, now: Duration) -> Duration {
        self.send_command(&OutboundCommand::SetLed { index, on }, now)
    }

    pub fn erase_flash(&mut self, address: u32, now: Duration) -> Duration {
        self.send_command(&OutboundCommand::EraseFlash { address }, now)
    }

    pub fn write_flash(&mut self, bytes: Vec<u8>, now: Duration) -> Duration {
        self.send_command(&OutboundCommand::WriteFlash(bytes), now)
    }

    pub fn display_text(&mut self, text: &str, now: Duration) -> Duration {
        self.send_command(&OutboundCommand::DisplayText(text.to_string()), now)
    }

    pub fn display_led(&mut self, rows: [u8; 5], now: Duration) -> Duration {
        self.send_command(&OutboundCommand::DisplayLed(rows), now)
    }

    /// Dump `length` bytes: one read per stride, paced on the chunk interval.
    /// Each stride goes through [`send`](Self::send) and may be dropped when busy.
    pub fn read_memory(&mut self, address: u32, length: u32, now: Duration) -> Duration {
        self.advance(now);
        for (n, command) in read_memory_strides(address, length, self.read_stride)
            .into_iter()
            .enumerate()
        {
            self.timers.arm(
                now + self.chunk_interval * n as u32,
                SessionTimer::ReadStride(command),
            );
        }
        self.advance(now);
        now + self.settle_delay
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        earliest(
            earliest(self.timers.next_deadline(), self.transport.next_deadline()),
            self.classifier.next_deadline(),
        )
    }

    /// Fire every timer due at or before `now`, in deadline order
    pub fn advance(&mut self, now: Duration) {
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= now) {
            self.classifier.advance(deadline);
            self.transport.advance(deadline, self.link.as_mut());

            while let Some((_, timer)) = self.timers.pop_due(deadline) {
                match timer {
                    SessionTimer::DataStall => {
                        self.stall_timer = None;
                        self.on_data_stall();
                    }
                    SessionTimer::ReadStride(command) => {
                        self.dispatch(&command.encode(), deadline);
                    }
                }
            }
        }
    }

    fn on_data_stall(&mut self) {
        let err = LinkError::DataStall(self.data_stall_timeout.as_millis() as u64);
        warn!("{}", err);
        self.send_log(&err.to_string(), MessageSeverity::Error);
        self.send_status(ConnectionStatus::Error);
        self.disconnect();
    }

    fn arm_stall_watchdog(&mut self, now: Duration) {
        if let Some(handle) = self.stall_timer.take() {
            self.timers.cancel(handle);
        }
        self.stall_timer = Some(
            self.timers
                .arm(now + self.data_stall_timeout, SessionTimer::DataStall),
        );
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
