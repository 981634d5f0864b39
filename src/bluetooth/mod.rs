//! Bluetooth socket layer.
//!
//! This module provides the transport stack seam, its BlueZ implementation,
//! and the session and registry actors that own live sockets.

pub mod bluez;
#[cfg(test)]
pub mod mock;
pub mod registry;
pub mod session;
pub mod stack;
