//! Transport layer

pub mod serial;
