//! BLE Connection Module
//!
//! Narrow capability interface the session drives (write, notify,
//! connection state, disconnect) and its btleplug implementation.
//!
//! Writes and notifications complete asynchronously. Their results come back
//! as [`LinkEvent`]s on a channel that the service loop feeds into the
//! session, so the session itself never blocks or awaits.

use crate::error::LinkError;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Identifies one packet write so its acknowledgment can be routed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub u64);

/// Identifies one scan/connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub id: PacketId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub attempt: AttemptId,
    pub name: String,
    pub service: Uuid,
}

/// A connected peripheral
pub trait PeripheralLink {
    /// Start a write. Completion is reported later as [`LinkEvent::WriteComplete`].
    fn write(&mut self, request: WriteRequest) -> Result<(), LinkError>;

    /// Subscribe to a characteristic. Payloads arrive as [`LinkEvent::Notification`].
    fn start_notifications(&mut self, service: Uuid, characteristic: Uuid)
        -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Release the connection. Safe to call more than once.
    fn disconnect(&mut self);
}

/// Resolves a device by service identifier and yields a connected link
pub trait Discovery {
    type Link: PeripheralLink;

    /// Start an attempt. The outcome is reported later as [`LinkEvent::Discovered`].
    fn search_and_connect(&mut self, request: DiscoveryRequest);
}

/// Asynchronous completions delivered to the session, in arrival order
#[derive(Debug)]
pub enum LinkEvent<L> {
    Discovered {
        attempt: AttemptId,
        result: Result<L, LinkError>,
    },
    Notification(Vec<u8>),
    WriteComplete {
        id: PacketId,
        result: Result<(), LinkError>,
    },
    /// The peripheral dropped the connection
    Disconnected,
}

/// [`PeripheralLink`] backed by a connected btleplug peripheral
pub struct BleLink {
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<LinkEvent<BleLink>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleLink {
    /// Wrap a peripheral whose services have already been discovered
    pub fn new(peripheral: Peripheral, events: mpsc::UnboundedSender<LinkEvent<BleLink>>) -> Self {
        Self {
            peripheral,
            events,
            connected: Arc::new(AtomicBool::new(true)),
            tasks: Vec::new(),
        }
    }

    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, LinkError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| LinkError::NotFound(format!("characteristic {}", uuid)))
    }
}

impl PeripheralLink for BleLink {
    fn write(&mut self, request: WriteRequest) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }

        let characteristic = self.characteristic(request.service, request.characteristic)?;
        let write_type = if request.with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        trace!("Sent: {:02X?}", request.data);

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peripheral
                .write(&characteristic, &request.data, write_type)
                .await
                .map_err(LinkError::from);
            if let Err(e) = &result {
                debug!("Write {:?} failed: {}", request.id, e);
            }
            let _ = events.send(LinkEvent::WriteComplete {
                id: request.id,
                result,
            });
        });

        Ok(())
    }

    fn start_notifications(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), LinkError> {
        let notify_char = self.characteristic(service, characteristic)?;
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = peripheral.subscribe(&notify_char).await {
                error!("Failed to enable notifications: {}", e);
                connected.store(false, Ordering::SeqCst);
                let _ = events.send(LinkEvent::Disconnected);
                return;
            }
            info!("Notifications enabled successfully");

            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to open notification stream: {}", e);
                    connected.store(false, Ordering::SeqCst);
                    let _ = events.send(LinkEvent::Disconnected);
                    return;
                }
            };

            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    let _ = events.send(LinkEvent::Notification(notification.value));
                }
            }

            // Stream ends when the peripheral goes away
            if connected.swap(false, Ordering::SeqCst) {
                warn!("Notification stream closed");
                let _ = events.send(LinkEvent::Disconnected);
            }
        });
        self.tasks.push(task);

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if was_connected {
            let peripheral = self.peripheral.clone();
            tokio::spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Peripheral disconnect failed: {}", e);
                }
            });
        }
    }
}
