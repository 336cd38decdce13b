//! SLIP-style framing shared by the application command channel and the
//! V3 bootloader.
//!
//! A frame on the wire is `END payload END` where `END` (0xC0) and `ESC`
//! (0xDB) inside the payload are escaped as `ESC 0xDC` / `ESC 0xDD`. The
//! payload ends with a 16-bit little-endian additive checksum: the two's
//! complement of the byte sum of the message.

use crate::platform::Platform;

pub const FR_END: u8 = 0xC0;
pub const FR_ESC: u8 = 0xDB;
const T_FR_END: u8 = 0xDC;
const T_FR_ESC: u8 = 0xDD;

pub const RX_BUF_SIZE: usize = 256;

/// Two's complement of the byte sum, the trailing checksum of a frame.
pub fn checksum(msg: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in msg {
        sum = sum.wrapping_add(u16::from(b));
    }
    sum.wrapping_neg()
}

fn put_escaped(pl: &mut dyn Platform, c: u8) {
    match c {
        FR_ESC => {
            pl.putc(FR_ESC);
            pl.putc(T_FR_ESC);
        }
        FR_END => {
            pl.putc(FR_ESC);
            pl.putc(T_FR_END);
        }
        _ => pl.putc(c),
    }
}

/// Frames `msg` and hands it to the platform as one contiguous write.
pub fn send_flagged(pl: &mut dyn Platform, msg: &[u8]) {
    pl.putc(FR_END);

    for &c in msg {
        put_escaped(pl, c);
    }

    let crc = checksum(msg);
    put_escaped(pl, (crc & 0xFF) as u8);
    put_escaped(pl, (crc >> 8) as u8);

    pl.putc(FR_END);
    pl.flush();
}

/// Unframed write, used for V1 bootloader pages and sniffer commands.
pub fn send_raw(pl: &mut dyn Platform, data: &[u8]) {
    for &c in data {
        pl.putc(c);
    }
    pl.flush();
}

/// Re-entrant frame decoder. Feed it arbitrary chunks; complete frames
/// with a valid checksum are handed to `on_packet` without the checksum
/// bytes.
pub struct RxState {
    buf: [u8; RX_BUF_SIZE],
    pos: usize,
    escaped: bool,
}

impl Default for RxState {
    fn default() -> Self {
        Self::new()
    }
}

impl RxState {
    pub fn new() -> Self {
        RxState {
            buf: [0; RX_BUF_SIZE],
            pos: 0,
            escaped: false,
        }
    }

    /// Consumes `chunk` and returns the number of checksum failures seen.
    pub fn receive<F: FnMut(&[u8])>(&mut self, chunk: &[u8], mut on_packet: F) -> u32 {
        let mut errors = 0;

        for &c in chunk {
            if c == FR_END {
                if self.escaped {
                    // END inside an escape sequence voids the frame
                    self.pos = 0;
                } else if self.pos > 2 {
                    let crc = checksum(&self.buf[..self.pos - 2]);
                    let crc1 =
                        u16::from_le_bytes([self.buf[self.pos - 2], self.buf[self.pos - 1]]);
                    if crc == crc1 {
                        on_packet(&self.buf[..self.pos - 2]);
                    } else {
                        errors += 1;
                    }
                    self.pos = 0;
                } else {
                    self.pos = 0;
                }
                self.escaped = false;
                continue;
            }

            if c == FR_ESC {
                self.escaped = true;
                continue;
            }

            let c = if self.escaped {
                self.escaped = false;
                match c {
                    T_FR_ESC => FR_ESC,
                    T_FR_END => FR_END,
                    _ => {
                        self.pos = 0;
                        continue;
                    }
                }
            } else {
                c
            };

            if self.pos < self.buf.len() {
                self.buf[self.pos] = c;
                self.pos += 1;
            } else {
                self.pos = 0;
            }
        }

        errors
    }
}
