//! Real platform: serial port I/O, the main event loop, device
//! enumeration and the debug TCP listener.

use crate::device::{Baudrate, Device};
use crate::error::{Error, Result};
use crate::flasher::{Event, Flasher};
use crate::platform::Platform;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

const READ_TIMEOUT_MS: u64 = 5;
const RX_BUF_SIZE: usize = 1024;

const USB_VENDOR_DRESDEN: u16 = 0x1CF1;
const USB_VENDOR_FTDI: u16 = 0x0403;
const USB_VENDOR_WCH: u16 = 0x1A86;
const USB_VENDOR_ESPRESSIF: u16 = 0x303A;

pub struct SerialPlatform {
    start: Instant,
    port: Option<Box<dyn serialport::SerialPort>>,
    txbuf: Vec<u8>,
    timer: Option<u64>,
    running: bool,
    disconnect_pending: bool,
    sniff_socket: Option<std::net::UdpSocket>,
    listener: Option<std::net::TcpListener>,
    clients: Vec<std::net::TcpStream>,
    console: Option<std::sync::mpsc::Receiver<String>>,
}

impl SerialPlatform {
    pub fn new(interactive: bool, listen_port: Option<u16>) -> Result<Self> {
        let listener = match listen_port {
            Some(port) => {
                let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
                listener.set_nonblocking(true)?;
                log::info!("listening on port {port}");
                Some(listener)
            }
            None => None,
        };

        let console = interactive.then(|| {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                for line in std::io::stdin().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            rx
        });

        Ok(SerialPlatform {
            start: Instant::now(),
            port: None,
            txbuf: Vec::new(),
            timer: None,
            running: false,
            disconnect_pending: false,
            sniff_socket: None,
            listener,
            clients: Vec::new(),
            console,
        })
    }

    /// Platform main loop. Polls the serial port at the read timeout
    /// cadence and dispatches at most one external event per iteration,
    /// preceded by the synthetic `Loop` event.
    pub fn run(&mut self, fl: &mut Flasher) {
        self.running = true;

        fl.handle(self, Event::Started);

        while self.running {
            fl.handle(self, Event::Loop);

            if let Some(chunk) = self.poll_serial() {
                fl.received(self, &chunk);
            } else if std::mem::take(&mut self.disconnect_pending) {
                fl.handle(self, Event::Disconnected);
            } else if self.timer_elapsed() {
                fl.handle(self, Event::Timeout);
            } else if let Some(line) = self.poll_console() {
                fl.console_line(self, &line);
            }

            self.net_step();
        }

        self.port = None;
    }

    fn poll_serial(&mut self) -> Option<Vec<u8>> {
        let Some(port) = self.port.as_mut() else {
            // keep the loop pace without a port to poll
            std::thread::sleep(Duration::from_millis(READ_TIMEOUT_MS));
            return None;
        };

        let mut buf = [0u8; RX_BUF_SIZE];
        match port.read(&mut buf) {
            Ok(0) => {
                self.port = None;
                self.disconnect_pending = true;
                None
            }
            Ok(n) => Some(buf[..n].to_vec()),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => None,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => None,
            Err(err) => {
                log::debug!("read failed: {err}");
                self.port = None;
                self.disconnect_pending = true;
                None
            }
        }
    }

    fn timer_elapsed(&mut self) -> bool {
        if let Some(deadline) = self.timer {
            if self.time_ms() >= deadline {
                self.timer = None;
                return true;
            }
        }
        false
    }

    fn poll_console(&mut self) -> Option<String> {
        self.console.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Accepts and drains debug listener clients; received bytes are
    /// only logged.
    fn net_step(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        while let Ok((client, addr)) = listener.accept() {
            log::debug!("client connected: {addr}");
            if client.set_nonblocking(true).is_ok() {
                self.clients.push(client);
            }
        }

        let mut buf = [0u8; RX_BUF_SIZE];
        self.clients.retain_mut(|client| match client.read(&mut buf) {
            Ok(0) => false,
            Ok(n) => {
                log::debug!("NET received {n} bytes");
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        });
    }
}

impl Platform for SerialPlatform {
    fn time_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn set_timeout(&mut self, ms: u64) {
        self.timer = Some(self.time_ms() + ms);
    }

    fn clear_timeout(&mut self) {
        self.timer = None;
    }

    fn shutdown(&mut self) {
        log::debug!("shutdown");
        self.running = false;
    }

    fn connect(&mut self, path: &str, baudrate: Baudrate) -> Result<()> {
        if self.port.is_some() {
            log::debug!("device already connected {path}");
            return Ok(());
        }

        match serialport::new(path, baudrate.bits_per_second())
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()
        {
            Ok(port) => {
                log::debug!(
                    "connected to {path}, baudrate: {}",
                    baudrate.bits_per_second()
                );
                self.txbuf.clear();
                self.port = Some(port);
                Ok(())
            }
            Err(err) => {
                log::debug!("failed to open device {path}: {err}");
                Err(Error::ConnectFailed(path.to_string()))
            }
        }
    }

    fn disconnect(&mut self) {
        log::debug!("disconnect");
        self.txbuf.clear();
        if self.port.take().is_some() {
            self.disconnect_pending = true;
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.txbuf.extend_from_slice(data);
    }

    fn putc(&mut self, byte: u8) {
        self.txbuf.push(byte);
    }

    fn flush(&mut self) {
        let Some(port) = self.port.as_mut() else {
            self.txbuf.clear();
            self.disconnect_pending = true;
            return;
        };

        if log::log_enabled!(log::Level::Debug) {
            let hex: String = self.txbuf.iter().map(|b| format!("{b:02X}")).collect();
            log::debug!("send: {hex} ({})", self.txbuf.len());
        }

        let result = port.write_all(&self.txbuf).and_then(|()| port.flush());
        if let Err(err) = result {
            log::debug!("write failed: {err}");
            self.port = None;
            self.disconnect_pending = true;
        }
        self.txbuf.clear();
    }

    fn reset_ftdi(&mut self, _index: u32, _serial: &str) -> i32 {
        // CBUS bit-bang needs libftdi, not carried on this platform
        log::debug!("FTDI reset not supported on this platform");
        -1
    }

    fn reset_raspbee(&mut self) -> i32 {
        log::debug!("RaspBee GPIO reset not supported on this platform");
        -1
    }

    fn enumerate(&mut self, max: usize) -> Vec<Device> {
        let mut out = Vec::new();

        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(err) => {
                log::debug!("enumeration failed: {err}");
                return out;
            }
        };

        for port in ports {
            if out.len() >= max {
                break;
            }

            let serialport::SerialPortType::UsbPort(info) = &port.port_type else {
                continue;
            };

            let product = info.product.as_deref().unwrap_or("");
            let (name, baudrate) = match info.vid {
                USB_VENDOR_DRESDEN => {
                    if product.contains("ConBee III") {
                        ("ConBee_III".to_string(), Baudrate::B115200)
                    } else {
                        ("ConBee_II".to_string(), Baudrate::B115200)
                    }
                }
                USB_VENDOR_FTDI => ("ConBee".to_string(), Baudrate::B38400),
                USB_VENDOR_ESPRESSIF => ("Espressif".to_string(), Baudrate::B115200),
                USB_VENDOR_WCH => {
                    let name = if product.is_empty() { "Serial" } else { product };
                    (name.to_string(), Baudrate::Unknown)
                }
                _ => continue,
            };

            let serial = info.serial_number.clone().unwrap_or_default();
            let stable_path = stable_path_for(&serial);

            out.push(Device {
                name,
                serial,
                path: port.port_name,
                stable_path,
                baudrate,
            });
        }

        // only consider the RaspBee UART when no USB device was found
        #[cfg(target_os = "linux")]
        if out.is_empty() && std::path::Path::new("/dev/ttyAMA0").exists() {
            out.push(Device {
                name: "RaspBee".to_string(),
                serial: String::new(),
                path: "/dev/ttyAMA0".to_string(),
                stable_path: String::new(),
                baudrate: Baudrate::B38400,
            });
        }

        out
    }

    fn read_file(&mut self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn print(&mut self, s: &str) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(s.as_bytes());
        let _ = stdout.flush();
    }

    fn get_win_size(&self) -> (u32, u32) {
        let dim = |name: &str, fallback: u32| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        (dim("COLUMNS", 80), dim("LINES", 24))
    }

    fn set_cursor(&mut self, x: u32, y: u32) {
        self.print(&format!("\x1b[{y};{x}H"));
    }

    fn sniff_open(&mut self, host: &str, port: u16) -> bool {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))
            .and_then(|socket| socket.connect((host, port)).map(|()| socket));

        match socket {
            Ok(socket) => {
                self.sniff_socket = Some(socket);
                true
            }
            Err(err) => {
                log::debug!("failed to open sniffer socket to {host}:{port}: {err}");
                false
            }
        }
    }

    fn sniff_send(&mut self, data: &[u8]) {
        if let Some(socket) = self.sniff_socket.as_ref() {
            if let Err(err) = socket.send(data) {
                log::debug!("sniffer send failed: {err}");
            }
        }
    }

    fn sniff_close(&mut self) {
        self.sniff_socket = None;
    }
}

/// `/dev/serial/by-id` entry for a serial number, when the platform
/// provides one.
#[cfg(target_os = "linux")]
fn stable_path_for(serial: &str) -> String {
    if serial.is_empty() {
        return String::new();
    }

    let Ok(entries) = std::fs::read_dir("/dev/serial/by-id") else {
        return String::new();
    };

    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().contains(serial) {
            return entry.path().to_string_lossy().into_owned();
        }
    }

    String::new()
}

#[cfg(not(target_os = "linux"))]
fn stable_path_for(_serial: &str) -> String {
    String::new()
}
