//! Flashing engine for ConBee / RaspBee / Hive Zigbee coordinators.
//!
//! The core is a single-threaded, event driven state machine
//! ([`flasher::Flasher`]) that talks to the device bootloader over a
//! serial UART through the [`platform::Platform`] capability interface.
//! The binary wires it to a real serial port ([`serial::SerialPlatform`]);
//! tests drive it with a scripted mock.

pub mod bytes;
pub mod device;
pub mod error;
pub mod firmware;
pub mod flasher;
pub mod framing;
pub mod platform;
pub mod serial;
pub mod text;

pub use error::{Error, Result};
