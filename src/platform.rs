//! The capability interface between the flashing core and the host.
//!
//! The state machine owns no I/O: serial access, the single timer,
//! hardware reset side channels, device enumeration and terminal output
//! all go through this trait. `serial.rs` implements it on top of a real
//! serial port; the mock below scripts it for tests.

use crate::device::{Baudrate, Device};
use crate::error::Result;

pub trait Platform {
    /// Monotonic milliseconds.
    fn time_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);

    /// Arms the single timer; replaces any pending one. The platform
    /// synthesizes one `Timeout` event when it elapses.
    fn set_timeout(&mut self, ms: u64);
    fn clear_timeout(&mut self);

    /// Ends the platform main loop after the current event.
    fn shutdown(&mut self);

    fn connect(&mut self, path: &str, baudrate: Baudrate) -> Result<()>;
    /// Closes the port. The platform synthesizes a `Disconnected` event.
    fn disconnect(&mut self);

    /// Buffered serial output. `flush` pushes everything buffered out
    /// synchronously; a frame buffered between two flushes is never torn.
    fn write(&mut self, data: &[u8]);
    fn putc(&mut self, byte: u8);
    fn flush(&mut self);

    /// ConBee I MCU reset via the FTDI CBUS0 pin. 0 on success.
    fn reset_ftdi(&mut self, index: u32, serial: &str) -> i32;
    /// RaspBee MCU reset via GPIO17. 0 on success.
    fn reset_raspbee(&mut self) -> i32;

    fn enumerate(&mut self, max: usize) -> Vec<Device>;
    fn read_file(&mut self, path: &str) -> std::io::Result<Vec<u8>>;

    /// User-facing output sink (not the log).
    fn print(&mut self, s: &str);
    fn get_win_size(&self) -> (u32, u32);
    fn set_cursor(&mut self, x: u32, y: u32);

    /// Sniffer relay socket.
    fn sniff_open(&mut self, host: &str, port: u16) -> bool;
    fn sniff_send(&mut self, data: &[u8]);
    fn sniff_close(&mut self);
}
