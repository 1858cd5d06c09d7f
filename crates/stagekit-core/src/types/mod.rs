//! Common type aliases used across StageKit crates.

pub mod aliases;

pub use aliases::*;
