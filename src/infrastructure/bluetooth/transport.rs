//! Outbound command transport.
//!
//! Splits a payload into link-sized packets written on a fixed timer grid,
//! behind a single-command busy gate. A command issued while the gate is
//! closed is dropped, never queued. A safety timeout reopens the gate when
//! no acknowledgment ever arrives.

use crate::domain::settings::{GateRelease, LinkSettings};
use crate::domain::timers::{TimerHandle, Timers};
use crate::error::LinkError;
use crate::infrastructure::bluetooth::connection::{PacketId, PeripheralLink, WriteRequest};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub packet_size: usize,
    pub chunk_interval: Duration,
    pub busy_timeout: Duration,
    pub gate_release: GateRelease,
    pub with_response: bool,
}

impl From<&LinkSettings> for TransportConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            packet_size: settings.packet_size.max(1),
            chunk_interval: Duration::from_millis(settings.chunk_interval_ms),
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
            gate_release: settings.gate_release,
            with_response: settings.write_with_response,
        }
    }
}

/// Where command packets are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// What happened to a `send` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Packets placed on the timer grid
    Scheduled { packets: usize },
    /// Another command holds the gate
    DroppedBusy,
    DroppedDisconnected,
    /// Device has no command characteristic, or the payload was empty
    DroppedNoop,
}

#[derive(Debug)]
enum TransportTimer {
    Chunk { packet: Vec<u8>, last: bool },
    BusyTimeout,
}

pub struct CommandTransport {
    config: TransportConfig,
    target: Option<WriteTarget>,
    busy: bool,
    busy_timeout: Option<TimerHandle>,
    timers: Timers<TransportTimer>,
    next_packet: u64,
    in_flight: HashMap<PacketId, InFlight>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    /// Final chunk of its command
    last: bool,
    written_at: Duration,
}

impl CommandTransport {
    pub fn new(config: TransportConfig, target: Option<WriteTarget>) -> Self {
        Self {
            config,
            target,
            busy: false,
            busy_timeout: None,
            timers: Timers::new(),
            next_packet: 0,
            in_flight: HashMap::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Packets written whose acknowledgment has not arrived
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Schedule `payload` for transmission. Chunk `i` is written at
    /// `now + i * chunk_interval`; chunk 0 goes out before returning.
    pub fn send<L: PeripheralLink>(
        &mut self,
        payload: &[u8],
        link: Option<&mut L>,
        now: Duration,
    ) -> SendOutcome {
        let Some(link) = link.filter(|l| l.is_connected()) else {
            debug!("Not connected, command dropped");
            return SendOutcome::DroppedDisconnected;
        };
        if self.busy {
            debug!("{}", LinkError::Busy);
            return SendOutcome::DroppedBusy;
        }
        if self.target.is_none() || payload.is_empty() {
            debug!("Nothing to send");
            return SendOutcome::DroppedNoop;
        }

        self.busy = true;
        self.arm_busy_timeout(now);

        let chunks: Vec<&[u8]> = payload.chunks(self.config.packet_size).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.timers.arm(
                now + self.config.chunk_interval * i as u32,
                TransportTimer::Chunk {
                    packet: chunk.to_vec(),
                    last: i + 1 == count,
                },
            );
        }
        trace!("Scheduled {} packet(s) for {} byte command", count, payload.len());

        self.advance(now, Some(link));
        SendOutcome::Scheduled { packets: count }
    }

    /// Fire chunk writes and the safety timeout due at or before `now`
    pub fn advance<L: PeripheralLink>(&mut self, now: Duration, mut link: Option<&mut L>) {
        while let Some((deadline, timer)) = self.timers.pop_due(now) {
            match timer {
                TransportTimer::Chunk { packet, last } => {
                    self.write_chunk(packet, last, link.as_deref_mut(), deadline)
                }
                TransportTimer::BusyTimeout => {
                    self.busy_timeout = None;
                    self.prune_in_flight(deadline);
                    if self.busy {
                        warn!(
                            "No acknowledgment within {:?}, clearing busy gate",
                            self.config.busy_timeout
                        );
                        self.busy = false;
                    }
                }
            }
        }
    }

    fn write_chunk<L: PeripheralLink>(
        &mut self,
        packet: Vec<u8>,
        last: bool,
        link: Option<&mut L>,
        now: Duration,
    ) {
        let (Some(link), Some(target)) = (link, self.target) else {
            debug!("Link gone, chunk skipped");
            return;
        };
        if !link.is_connected() {
            debug!("Link gone, chunk skipped");
            return;
        }

        // Each chunk holds the gate until something acknowledges it
        self.busy = true;
        if self.busy_timeout.is_none() {
            self.arm_busy_timeout(now);
        }

        let id = PacketId(self.next_packet);
        self.next_packet += 1;

        let request = WriteRequest {
            id,
            service: target.service,
            characteristic: target.characteristic,
            data: packet,
            with_response: self.config.with_response,
        };
        match link.write(request) {
            Ok(()) => {
                self.in_flight.insert(
                    id,
                    InFlight {
                        last,
                        written_at: now,
                    },
                );
            }
            Err(e) => warn!("Packet write failed: {}", e),
        }
    }

    /// Route an acknowledgment. Failed writes leave the gate to the timeout.
    pub fn on_write_complete(&mut self, id: PacketId, result: Result<(), LinkError>) {
        let Some(InFlight { last, .. }) = self.in_flight.remove(&id) else {
            trace!("Acknowledgment for unknown packet {:?}", id);
            return;
        };
        if let Err(e) = result {
            warn!("Packet {:?} not acknowledged: {}", id, e);
            return;
        }

        let release = match self.config.gate_release {
            GateRelease::FirstAck => true,
            GateRelease::LastChunk => last,
        };
        if release {
            self.busy = false;
            if let Some(handle) = self.busy_timeout.take() {
                self.timers.cancel(handle);
            }
        }
    }

    /// Drop pending chunks and reopen the gate (used on disconnect)
    pub fn reset(&mut self) {
        self.timers.clear();
        self.busy_timeout = None;
        self.busy = false;
        self.in_flight.clear();
    }

    /// Forget packets that have waited a full safety timeout. Their late
    /// acknowledgments are ignored.
    fn prune_in_flight(&mut self, now: Duration) {
        let before = self.in_flight.len();
        let window = self.config.busy_timeout;
        self.in_flight
            .retain(|_, packet| now.saturating_sub(packet.written_at) < window);
        if self.in_flight.len() < before {
            debug!("Gave up on {} unacknowledged packet(s)", before - self.in_flight.len());
        }
    }

    fn arm_busy_timeout(&mut self, now: Duration) {
        if let Some(handle) = self.busy_timeout.take() {
            self.timers.cancel(handle);
        }
        self.busy_timeout = Some(
            self.timers
                .arm(now + self.config.busy_timeout, TransportTimer::BusyTimeout),
        );
    }
}
