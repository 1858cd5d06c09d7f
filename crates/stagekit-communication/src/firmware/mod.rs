//! Firmware-specific motion drivers

pub mod grbl;
