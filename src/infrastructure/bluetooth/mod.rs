//! Bluetooth Module
//!
//! BLE communication with the sensor peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    BluetoothService                       │
//! │  (tokio loop: link events, requests, timer deadlines)     │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   PeripheralSession                       │
//! │  (lifecycle, watchdog, routing; synchronous, clocked)     │
//! └──────┬──────────────┬──────────────┬─────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌──────────────────┐
//! │  Protocol  │ │ Transport  │ │ Connection /     │
//! │            │ │            │ │ Scanner          │
//! │ - UUIDs    │ │ - Chunking │ │ - Link trait     │
//! │ - Frames   │ │ - Pacing   │ │ - Discovery      │
//! │ - Commands │ │ - Busy gate│ │ - btleplug       │
//! └────────────┘ └────────────┘ └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device profiles, frame decoding and command encodings
//! - [`transport`] - Packet chunking and the in-flight busy gate
//! - [`connection`] - Link/discovery capability traits and the btleplug link
//! - [`scanner`] - BLE device discovery
//! - [`session`] - Connection lifecycle and notification routing
//! - [`service`] - Async driver for the session

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

// Re-export main service for convenience
pub use service::{BluetoothService, ServiceHandle};
