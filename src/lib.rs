//! Sensor frame decoding, gesture classification and paced command
//! transport for small BLE block-programming peripherals.

pub mod domain;
pub mod error;
pub mod infrastructure;
