//! Bluetooth Service Module
//!
//! Runs a [`PeripheralSession`] on a tokio task. The loop multiplexes link
//! completions, requests from [`ServiceHandle`]s and the session's next
//! timer deadline, and converts wall-clock time into the session's logical
//! clock (time since the service started).

use crate::domain::models::{AppEvent, SensorSnapshot};
use crate::domain::settings::Settings;
use crate::error::LinkError;
use crate::infrastructure::bluetooth::connection::{BleLink, Discovery, LinkEvent};
use crate::infrastructure::bluetooth::protocol::{DeviceProfile, OutboundCommand};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::session::PeripheralSession;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Requests accepted by the service loop
#[derive(Debug)]
pub enum SessionRequest {
    Scan,
    Disconnect,
    Command {
        command: OutboundCommand,
        /// Receives the instant the caller's settle delay ends
        reply: oneshot::Sender<Instant>,
    },
    ReadMemory {
        address: u32,
        length: u32,
        reply: oneshot::Sender<Instant>,
    },
}

/// Cloneable front end for a running [`BluetoothService`]
#[derive(Clone)]
pub struct ServiceHandle {
    requests: mpsc::UnboundedSender<SessionRequest>,
    snapshot: watch::Receiver<SensorSnapshot>,
}

impl ServiceHandle {
    pub fn scan(&self) -> Result<(), LinkError> {
        self.request(SessionRequest::Scan)
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.request(SessionRequest::Disconnect)
    }

    /// Send a command and wait out the post-send settle delay.
    ///
    /// Completes even when the command was dropped because the link was
    /// busy or down.
    pub async fn send_command(&self, command: OutboundCommand) -> Result<(), LinkError> {
        let (reply, settled) = oneshot::channel();
        self.request(SessionRequest::Command { command, reply })?;
        Self::settle(settled).await
    }

    /// Dump memory in stride-sized reads; results arrive as notifications
    pub async fn read_memory(&self, address: u32, length: u32) -> Result<(), LinkError> {
        let (reply, settled) = oneshot::channel();
        self.request(SessionRequest::ReadMemory {
            address,
            length,
            reply,
        })?;
        Self::settle(settled).await
    }

    /// Latest published sensor view
    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot.clone()
    }

    fn request(&self, request: SessionRequest) -> Result<(), LinkError> {
        self.requests
            .send(request)
            .map_err(|_| LinkError::Disconnected)
    }

    async fn settle(settled: oneshot::Receiver<Instant>) -> Result<(), LinkError> {
        let until = settled.await.map_err(|_| LinkError::Disconnected)?;
        tokio::time::sleep_until(until).await;
        Ok(())
    }
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<D: Discovery> {
    session: PeripheralSession<D>,
    epoch: Instant,
    link_events: mpsc::UnboundedReceiver<LinkEvent<D::Link>>,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
    snapshot: watch::Sender<SensorSnapshot>,
}

impl BluetoothService<BleScanner> {
    /// Service backed by the platform's Bluetooth adapter
    pub fn with_ble(
        settings: &Settings,
        profile: DeviceProfile,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, ServiceHandle) {
        let (link_tx, link_rx) = mpsc::unbounded_channel::<LinkEvent<BleLink>>();
        let scanner = BleScanner::new(
            link_tx,
            Duration::from_millis(settings.link.scan_timeout_ms),
        );
        let session = PeripheralSession::new(settings, profile, scanner, event_sender);
        Self::new(session, link_rx)
    }
}

impl<D: Discovery> BluetoothService<D> {
    pub fn new(
        session: PeripheralSession<D>,
        link_events: mpsc::UnboundedReceiver<LinkEvent<D::Link>>,
    ) -> (Self, ServiceHandle) {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(session.snapshot());

        let service = Self {
            session,
            epoch: Instant::now(),
            link_events,
            requests,
            snapshot,
        };
        let handle = ServiceHandle {
            requests: request_tx,
            snapshot: snapshot_rx,
        };
        (service, handle)
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn instant(&self, at: Duration) -> Instant {
        self.epoch + at
    }

    /// Drive the session until every [`ServiceHandle`] is dropped
    pub async fn run(mut self) {
        info!("Bluetooth service started");

        loop {
            let deadline = self.session.next_deadline().map(|d| self.instant(d));

            tokio::select! {
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    let now = self.now();
                    self.session.advance(now);
                }
            }

            self.publish();
        }

        self.session.disconnect();
        self.publish();
        info!("Bluetooth service stopped");
    }

    fn on_link_event(&mut self, event: LinkEvent<D::Link>) {
        let now = self.now();
        match event {
            LinkEvent::Discovered { attempt, result } => {
                self.session.on_discovery_resolved(attempt, result, now)
            }
            LinkEvent::Notification(bytes) => self.session.on_notification(&bytes, now),
            LinkEvent::WriteComplete { id, result } => {
                self.session.on_write_complete(id, result, now)
            }
            LinkEvent::Disconnected => self.session.on_link_lost(),
        }
    }

    fn on_request(&mut self, request: SessionRequest) {
        let now = self.now();
        match request {
            SessionRequest::Scan => self.session.scan(),
            SessionRequest::Disconnect => self.session.disconnect(),
            SessionRequest::Command { command, reply } => {
                let settled = self.session.send_command(&command, now);
                let _ = reply.send(self.instant(settled));
            }
            SessionRequest::ReadMemory {
                address,
                length,
                reply,
            } => {
                debug!("Reading {} byte(s) from {:#X}", length, address);
                let settled = self.session.read_memory(address, length, now);
                let _ = reply.send(self.instant(settled));
            }
        }
    }

    fn publish(&self) {
        let next = self.session.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionStatus;
    use crate::domain::settings::DeviceVariant;
    use crate::infrastructure::bluetooth::connection::fake::{FakeDiscovery, FakeLink};
    use crate::infrastructure::bluetooth::connection::PeripheralLink;
    use tokio::task::JoinHandle;

    struct Running {
        handle: ServiceHandle,
        discovery: FakeDiscovery,
        link_tx: mpsc::UnboundedSender<LinkEvent<FakeLink>>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        task: JoinHandle<()>,
    }

    fn spawn_service(variant: DeviceVariant) -> Running {
        let settings = Settings::default();
        let discovery = FakeDiscovery::default();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let session = PeripheralSession::new(
            &settings,
            DeviceProfile::for_variant(variant),
            discovery.clone(),
            event_tx,
        );
        let (service, handle) = BluetoothService::new(session, link_rx);
        let task = tokio::spawn(service.run());

        Running {
            handle,
            discovery,
            link_tx,
            events,
            task,
        }
    }

    async fn wait_for_status(events: &mut mpsc::UnboundedReceiver<AppEvent>, status: ConnectionStatus) {
        while let Some(event) = events.recv().await {
            if event == AppEvent::ConnectionStatus(status) {
                return;
            }
        }
        panic!("event channel closed before {:?}", status);
    }

    async fn connect(running: &mut Running) -> FakeLink {
        running.handle.scan().unwrap();
        wait_for_status(&mut running.events, ConnectionStatus::Scanning).await;

        let attempt = running.discovery.requests()[0].attempt;
        let link = FakeLink::new();
        running
            .link_tx
            .send(LinkEvent::Discovered {
                attempt,
                result: Ok(link.clone()),
            })
            .unwrap();
        wait_for_status(&mut running.events, ConnectionStatus::Connected).await;
        link
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_update_snapshot() {
        let mut running = spawn_service(DeviceVariant::Gen1);
        connect(&mut running).await;
        assert!(running.handle.snapshot().connected);

        let mut snapshots = running.handle.subscribe();
        snapshots.borrow_and_update();
        let mut frame = vec![0x00, 0x00, 0b0000_1000, 40, 0];
        frame.extend_from_slice(&10_000_000i32.to_be_bytes());
        frame.extend_from_slice(&0i32.to_be_bytes());
        running
            .link_tx
            .send(LinkEvent::Notification(frame))
            .unwrap();

        snapshots.changed().await.unwrap();
        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.tilt_x, -40);
        assert_eq!(snapshot.frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_stall_tears_down_session() {
        let mut running = spawn_service(DeviceVariant::Gen1);
        let link = connect(&mut running).await;
        let connected_at = Instant::now();

        wait_for_status(&mut running.events, ConnectionStatus::Error).await;

        assert!(connected_at.elapsed() >= Duration::from_millis(4500));
        assert!(!link.is_connected());
        wait_for_status(&mut running.events, ConnectionStatus::Disconnected).await;
        assert!(!running.handle.snapshot().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_waits_for_settle_delay() {
        let mut running = spawn_service(DeviceVariant::Gen2);
        let link = connect(&mut running).await;

        let started = Instant::now();
        running
            .handle
            .send_command(OutboundCommand::SetLed { index: 1, on: true })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(link.writes().len(), 1);
        assert_eq!(link.writes()[0].data, vec![0xF8, 0x04, 0x01, 0x01, 0x44]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_write_is_paced_on_chunk_interval() {
        let mut running = spawn_service(DeviceVariant::Gen2);
        let link = connect(&mut running).await;

        running
            .handle
            .send_command(OutboundCommand::WriteFlash(vec![0xAB; 50]))
            .await
            .unwrap();

        // Settle delay (100 ms) covers all three chunks at 0/50/100 ms
        tokio::time::sleep(Duration::from_millis(1)).await;
        let writes = link.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2].data.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reports_disconnected() {
        let mut running = spawn_service(DeviceVariant::Gen1);
        connect(&mut running).await;

        running.link_tx.send(LinkEvent::Disconnected).unwrap();
        wait_for_status(&mut running.events, ConnectionStatus::Disconnected).await;

        // A fresh scan starts a new attempt
        running.handle.scan().unwrap();
        wait_for_status(&mut running.events, ConnectionStatus::Scanning).await;
        assert_eq!(running.discovery.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_stops_when_handles_dropped() {
        let mut running = spawn_service(DeviceVariant::Gen1);
        let link = connect(&mut running).await;

        drop(running.handle);
        running.task.await.unwrap();
        assert!(!link.is_connected());
    }
}
