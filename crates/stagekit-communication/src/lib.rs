//! # StageKit Communication
//!
//! Serial port access and firmware drivers for StageKit.
//! The GRBL driver implements the motion device contract on top of a
//! line-oriented serial connection.

pub mod communication;
pub mod firmware;

pub use communication::serial::{list_ports, LineReader, RealSerialPort, SerialPort, SerialPortInfo};
pub use firmware::grbl::{GrblDriver, GrblSettings};
