//! BLE Scanner Module
//!
//! Resolves a peripheral by service identifier (or advertised name) and
//! hands back a connected [`BleLink`].

use crate::error::LinkError;
use crate::infrastructure::bluetooth::connection::{
    BleLink, Discovery, DiscoveryRequest, LinkEvent,
};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// btleplug-backed [`Discovery`]
pub struct BleScanner {
    events: mpsc::UnboundedSender<LinkEvent<BleLink>>,
    scan_timeout: Duration,
    searches: Vec<JoinHandle<()>>,
}

impl BleScanner {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent<BleLink>>, scan_timeout: Duration) -> Self {
        Self {
            events,
            scan_timeout,
            searches: Vec::new(),
        }
    }

    /// Abort every outstanding search
    pub fn stop(&mut self) {
        for search in self.searches.drain(..) {
            if !search.is_finished() {
                info!("Stopping BLE scan...");
                search.abort();
            }
        }
    }

    /// Check if a search is still running
    pub fn is_scanning(&self) -> bool {
        self.searches.iter().any(|s| !s.is_finished())
    }

    async fn find_and_connect(
        request: &DiscoveryRequest,
        events: mpsc::UnboundedSender<LinkEvent<BleLink>>,
        scan_timeout: Duration,
    ) -> Result<BleLink, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Discovery("No Bluetooth adapters found".to_string()))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![request.service],
            })
            .await?;

        let found = Self::find_device(&adapter, request, scan_timeout).await;
        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }
        let peripheral = found?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;
        info!("Connected, {} characteristic(s)", peripheral.characteristics().len());

        Ok(BleLink::new(peripheral, events))
    }

    /// Poll the adapter until a peripheral advertises the service or name
    async fn find_device(
        adapter: &Adapter,
        request: &DiscoveryRequest,
        scan_timeout: Duration,
    ) -> Result<Peripheral, LinkError> {
        let deadline = Instant::now() + scan_timeout;

        while Instant::now() < deadline {
            for peripheral in adapter.peripherals().await? {
                let Some(props) = peripheral.properties().await? else {
                    continue;
                };
                let name_matches =
                    !request.name.is_empty() && props.local_name.as_deref() == Some(&request.name);
                if props.services.contains(&request.service) || name_matches {
                    debug!(
                        "Found {:?} at {}",
                        props.local_name.unwrap_or_default(),
                        props.address
                    );
                    return Ok(peripheral);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(LinkError::NotFound(format!(
            "{:?} not found within {} ms",
            request.name,
            scan_timeout.as_millis()
        )))
    }
}

impl Discovery for BleScanner {
    type Link = BleLink;

    /// Earlier searches keep running; the session discards their results
    /// as stale.
    fn search_and_connect(&mut self, request: DiscoveryRequest) {
        self.searches.retain(|s| !s.is_finished());

        let events = self.events.clone();
        let scan_timeout = self.scan_timeout;
        let search = tokio::spawn(async move {
            let result = Self::find_and_connect(&request, events.clone(), scan_timeout).await;
            let _ = events.send(LinkEvent::Discovered {
                attempt: request.attempt,
                result,
            });
        });
        self.searches.push(search);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
