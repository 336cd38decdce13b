//! The flashing engine: an event driven state machine that walks a
//! coordinator from running application to bootloader, uploads the
//! firmware and verifies the result.
//!
//! All I/O happens through the [`Platform`] facade. Exactly one handler
//! runs per event; transitions are plain assignments to the `(state,
//! substate)` pair inside the handler. Timeouts are the primary error
//! signal, bounded overall by the `-t` retry deadline.

use crate::bytes::{ByteReader, ByteWriter};
use crate::device::{self, Baudrate, Device, DeviceKind};
use crate::firmware::GcfFile;
use crate::framing::{self, RxState};
use crate::platform::Platform;
use crate::text::{TextScanner, TextStatus, TextWriter};

const BTL_MAGIC: u8 = 0x81;
const BTL_ID_REQUEST: u8 = 0x02;
const BTL_ID_RESPONSE: u8 = 0x82;
const BTL_FW_UPDATE_REQUEST: u8 = 0x03;
const BTL_FW_UPDATE_RESPONSE: u8 = 0x83;
const BTL_FW_DATA_REQUEST: u8 = 0x04;
const BTL_FW_DATA_RESPONSE: u8 = 0x84;

const V1_PAGE_SIZE: u32 = 256;

const ASCII_BUF_SIZE: usize = 512;
const LINE_BUF_SIZE: usize = 384;
const MAX_DEVICES: usize = 4;

const SNIFF_UDP_PORT: u16 = 17754;
const SNIFF_FRAME_START: u8 = 0x01;
const SNIFF_FRAME_END: u8 = 0x04;

const FMT_GREEN: &str = "\x1b[32m";
const FMT_RESET: &str = "\x1b[0m";

const FMT_BLOCK_OPEN: &str = "\u{2591}";
const FMT_BLOCK_DONE: &str = "\u{2593}";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Task {
    #[default]
    None,
    Reset,
    Program,
    List,
    Connect,
    Sniff,
    Help,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    Action,
    Started,
    Loop,
    Timeout,
    Connected,
    Disconnected,
    AsciiReceived,
    PacketReceived,
    ResetSuccess,
    ResetFailed,
    UartResetSuccess,
    UartResetFailed,
    FtdiResetSuccess,
    FtdiResetFailed,
    RaspBeeResetSuccess,
    RaspBeeResetFailed,
    UartResetPacket,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Void,
    Init,
    Reset,
    ResetUart,
    ResetFtdi,
    ResetRaspBee,
    ListDevices,
    Program,
    BootloaderConnect,
    BootloaderQuery,
    V1ProgramSync,
    V1ProgramWriteHeader,
    V1ProgramUpload,
    V1ProgramValidate,
    V3ProgramSync,
    V3ProgramUpload,
    V3ProgramWaitId,
    Connect,
    Connected,
    SniffConnect,
    SniffConfig,
    SniffConfigConfirm,
    SniffSyncData,
    SniffRecvData,
    SniffTeardown,
}

/// How the run ended, mapped to the process exit code by `main`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    Pending,
    Success,
    ConfigError,
    Failed,
}

/// Parsed command line, handed to the core once at startup.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub task: Task,
    pub device: String,
    pub file_path: String,
    pub timeout_secs: Option<u64>,
    pub debug_level: u8,
    pub sniff_channel: u8,
    pub sniff_host: String,
    pub interactive: bool,
}

pub struct Flasher {
    config: Config,

    state: State,
    substate: State,
    task: Task,

    // ASCII accumulator for V1 bootloader text and the sniffer stream
    ascii: [u8; ASCII_BUF_SIZE],
    wp: usize,
    rp: usize,

    // last received framed bootloader payload
    packet: [u8; framing::RX_BUF_SIZE],
    packet_len: usize,

    rx: RxState,
    crc_errors: u32,

    file: Option<GcfFile>,
    dev_kind: DeviceKind,
    baudrate: Baudrate,
    dev_path: String,
    dev_serial: String,
    devices: Vec<Device>,

    start_time: u64,
    max_time: u64,

    retry: u32,
    remaining: u32,
    seq: u8,

    sniff_seq: u32,
    sniff_wp: usize,
    sniff_len: usize,
    sniff_packet: [u8; 256],

    outcome: Outcome,
}

impl Flasher {
    pub fn new(config: Config) -> Self {
        Flasher {
            config,
            state: State::Init,
            substate: State::Void,
            task: Task::None,
            ascii: [0; ASCII_BUF_SIZE],
            wp: 0,
            rp: 0,
            packet: [0; framing::RX_BUF_SIZE],
            packet_len: 0,
            rx: RxState::new(),
            crc_errors: 0,
            file: None,
            dev_kind: DeviceKind::Unknown,
            baudrate: Baudrate::Unknown,
            dev_path: String::new(),
            dev_serial: String::new(),
            devices: Vec::new(),
            start_time: 0,
            max_time: 0,
            retry: 0,
            remaining: 0,
            seq: 1,
            sniff_seq: 0,
            sniff_wp: 0,
            sniff_len: 0,
            sniff_packet: [0; 256],
            outcome: Outcome::Pending,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn crc_errors(&self) -> u32 {
        self.crc_errors
    }

    /// Dispatches one event to the current state. States may dispatch
    /// follow-up events recursively; each runs exactly one handler.
    pub fn handle(&mut self, pl: &mut dyn Platform, event: Event) {
        log::trace!(
            "state: {:?}/{:?}, event: {:?}",
            self.state,
            self.substate,
            event
        );

        if event == Event::Loop && self.state != State::SniffSyncData {
            return;
        }

        match self.state {
            State::Void => {}
            State::Init => self.st_init(pl, event),
            State::Reset => self.st_reset(pl, event),
            State::ListDevices => self.st_list_devices(pl, event),
            State::Program => self.st_program(pl, event),
            State::BootloaderConnect => self.st_bootloader_connect(pl, event),
            State::BootloaderQuery => self.st_bootloader_query(pl, event),
            State::V1ProgramSync => self.st_v1_program_sync(pl, event),
            State::V1ProgramWriteHeader => self.st_v1_program_write_header(pl, event),
            State::V1ProgramUpload => self.st_v1_program_upload(pl, event),
            State::V1ProgramValidate => self.st_v1_program_validate(pl, event),
            State::V3ProgramSync => self.st_v3_program_sync(pl, event),
            State::V3ProgramUpload => self.st_v3_program_upload(pl, event),
            State::V3ProgramWaitId => self.st_v3_program_wait_id(pl, event),
            State::Connect => self.st_connect(pl, event),
            State::Connected => self.st_connected(pl, event),
            State::SniffConnect => self.st_sniff_connect(pl, event),
            State::SniffConfig => self.st_sniff_config(pl, event),
            State::SniffConfigConfirm => self.st_sniff_config_confirm(pl, event),
            State::SniffSyncData => self.st_sniff_sync_data(pl, event),
            State::SniffRecvData => self.st_sniff_recv_data(pl, event),
            State::SniffTeardown => self.st_sniff_teardown(pl, event),
            // substates are only reachable through State::Reset
            State::ResetUart | State::ResetFtdi | State::ResetRaspBee => {}
        }
    }

    /// Entry point for raw bytes from the serial port. Depending on the
    /// current state the chunk feeds the ASCII accumulator, the framing
    /// decoder, or both; ASCII events fire before packet events derived
    /// from the same chunk.
    pub fn received(&mut self, pl: &mut dyn Platform, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let wants_ascii = self.task == Task::Sniff
            || matches!(
                self.state,
                State::BootloaderQuery
                    | State::V1ProgramSync
                    | State::V1ProgramWriteHeader
                    | State::V1ProgramUpload
                    | State::V1ProgramValidate
            );

        if wants_ascii {
            let mut added = 0;
            for &ch in data {
                if self.wp < ASCII_BUF_SIZE - 2 {
                    self.ascii[self.wp] = ch;
                    self.wp += 1;
                    added += 1;
                } else {
                    // sanity rollback
                    self.wp = 0;
                }
            }

            if added > 0 {
                self.handle(pl, Event::AsciiReceived);
            }

            if self.task == Task::Sniff {
                return;
            }
        }

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let errors = self.rx.receive(data, |p| frames.push(p.to_vec()));
        self.crc_errors += errors;
        if errors > 0 {
            log::debug!("{errors} frame checksum errors");
        }

        for frame in frames {
            self.packet_received(pl, &frame);
        }
    }

    /// One complete, checksum-verified frame payload.
    fn packet_received(&mut self, pl: &mut dyn Platform, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data[0] != BTL_MAGIC && self.task == Task::Connect {
            let mut buf = [0u8; 560];
            let mut w = TextWriter::new(&mut buf);
            w.put_str("packet: ");
            w.put_long(data.len() as i64);
            w.put_str(" bytes, ");
            w.put_hex(data);
            w.put_str("\n");
            pl.print(w.as_str());
        } else {
            debug_hex("recv_packet", data);
        }

        if data[0] == 0x0B && data.len() >= 8 {
            // write parameter response
            if data[7] == 0x26 {
                // watchdog timeout accepted, the device reboots
                self.handle(pl, Event::UartResetPacket);
            }
        } else if data[0] == BTL_MAGIC && data.len() >= 2 && data.len() <= self.packet.len() {
            self.packet[..data.len()].copy_from_slice(data);
            self.packet_len = data.len();
            self.handle(pl, Event::PacketReceived);
        }
    }

    /// Interactive console line (`-i`).
    pub fn console_line(&mut self, pl: &mut dyn Platform, line: &str) {
        if line.is_empty() {
            pl.print("use 'help' to see a list of available commands\n");
            return;
        }

        let mut rs = TextScanner::new(line.as_bytes());

        if rs.starts_with("help") {
            pl.print("commands:\n");
            pl.print(
                "rp <id> [hex payload]         | read config parameter id (decimal) and optional\n\
                 \u{20}                             | payload as 0x... hex string\n",
            );
        } else if rs.starts_with("read ") || rs.starts_with("rp ") {
            rs.find(" ");
            rs.skip_whitespace();
            let param = rs.get_long();
            if rs.status() != TextStatus::Ok || !(0..=255).contains(&param) {
                pl.print("invalid argument for parameter <id>\n");
                return;
            }

            rs.skip_whitespace();

            let mut line_buf = [0u8; LINE_BUF_SIZE];
            let mut w = TextWriter::new(&mut line_buf);
            w.put_str("> reading parameter: ");
            w.put_long(param);

            let mut args = [0u8; 32];
            let mut arg_len = 0;
            if rs.starts_with("0x") {
                rs.seek(rs.pos() + 2);
                while arg_len < args.len() {
                    let Some(byte) = get_hexbyte(&mut rs) else {
                        break;
                    };
                    args[arg_len] = byte;
                    arg_len += 1;
                    w.put_str(" ");
                    w.put_long(i64::from(byte));
                }
            }

            w.put_str("\n");
            pl.print(w.as_str());

            let seq = self.seq;
            self.seq = self.seq.wrapping_add(1);
            self.command_read_parameter(pl, seq, param as u8, &args[..arg_len]);
        }
    }

    // ---- states ---------------------------------------------------------

    fn st_init(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Started || event == Event::Timeout {
            if event == Event::Started {
                self.start_time = pl.time_ms();
            }
            if self.process_config(pl) {
                self.handle(pl, Event::Action);
            } else {
                self.outcome = Outcome::ConfigError;
                pl.shutdown();
            }
        }
    }

    fn st_reset(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                self.wp = 0;
                self.substate = State::ResetUart;
                self.st_reset_uart(pl, Event::Action);
            }
            Event::UartResetSuccess | Event::FtdiResetSuccess | Event::RaspBeeResetSuccess => {
                self.substate = State::Void;

                if self.task == Task::Reset {
                    self.outcome = Outcome::Success;
                    pl.shutdown();
                } else if self.task == Task::Program {
                    self.state = State::Program;
                    self.handle(pl, Event::ResetSuccess);
                }
            }
            Event::UartResetFailed => {
                if self.dev_kind == DeviceKind::ConBee1 {
                    if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                        self.substate = State::ResetFtdi;
                        self.st_reset_ftdi(pl, Event::Action);
                        return;
                    }
                } else if self.dev_kind == DeviceKind::RaspBee1
                    || self.dev_kind == DeviceKind::RaspBee2
                {
                    if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                        self.substate = State::ResetRaspBee;
                        self.st_reset_raspbee(pl, Event::Action);
                        return;
                    }
                }

                // pretend it worked, the device may already sit in the
                // bootloader with no application responding
                pl.set_timeout(500);
                self.handle(pl, Event::UartResetSuccess);
            }
            Event::FtdiResetFailed => {
                pl.set_timeout(1);
                self.handle(pl, Event::FtdiResetSuccess);
            }
            Event::RaspBeeResetFailed => {
                pl.set_timeout(1);
                self.handle(pl, Event::RaspBeeResetSuccess);
            }
            _ => match self.substate {
                State::ResetUart => self.st_reset_uart(pl, event),
                State::ResetFtdi => self.st_reset_ftdi(pl, event),
                State::ResetRaspBee => self.st_reset_raspbee(pl, event),
                _ => {}
            },
        }
    }

    fn st_reset_uart(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                pl.set_timeout(3000);

                if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                    if self.task == Task::Reset {
                        self.command_query_firmware_version(pl);
                    }
                    self.command_reset_uart(pl);
                }
            }
            Event::PacketReceived => {
                if self.packet[1] == BTL_ID_RESPONSE {
                    // already in the bootloader
                    pl.clear_timeout();
                    pl.set_timeout(100);
                    self.handle(pl, Event::UartResetSuccess);
                }
            }
            Event::Disconnected => {
                // the USB endpoint dropped while the MCU restarts
                pl.clear_timeout();
                pl.set_timeout(500);
                self.handle(pl, Event::UartResetSuccess);
            }
            Event::UartResetPacket => {
                pl.print("command UART reset done\n");
                if self.dev_kind == DeviceKind::RaspBee1 || self.dev_kind == DeviceKind::ConBee1 {
                    // FTDI bridge, no disconnect will follow
                    pl.clear_timeout();
                    self.handle(pl, Event::UartResetSuccess);
                }
            }
            Event::Timeout => {
                pl.print("command reset timeout\n");
                self.substate = State::Void;
                pl.disconnect();
                self.handle(pl, Event::UartResetFailed);
            }
            _ => {}
        }
    }

    fn st_reset_ftdi(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            if pl.reset_ftdi(0, &self.dev_serial) == 0 {
                pl.print("FTDI reset done\n");
                self.handle(pl, Event::FtdiResetSuccess);
            } else {
                pl.print("FTDI reset failed\n");
                self.handle(pl, Event::FtdiResetFailed);
            }
        }
    }

    fn st_reset_raspbee(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            if pl.reset_raspbee() == 0 {
                pl.print("RaspBee reset done\n");
                self.handle(pl, Event::RaspBeeResetSuccess);
            } else {
                pl.print("RaspBee reset failed\n");
                self.handle(pl, Event::RaspBeeResetFailed);
            }
        }
    }

    fn st_list_devices(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            self.get_devices(pl);

            if self.devices.is_empty() {
                pl.print("no devices found\n");
            }

            pl.print("Path              | Serial      | Type\n");
            pl.print("------------------+-------------+---------------\n");

            for dev in &self.devices {
                let mut buf = [0u8; LINE_BUF_SIZE];
                let mut w = TextWriter::new(&mut buf);

                w.put_str(&dev.path);
                while w.pos() < 18 {
                    w.put_str(" ");
                }
                w.put_str("| ");

                w.put_str(&dev.serial);
                while w.pos() < 32 {
                    w.put_str(" ");
                }
                w.put_str("| ");

                w.put_str(&dev.name);
                w.put_str("\n");

                pl.print(w.as_str());
            }

            self.outcome = Outcome::Success;
            pl.shutdown();
        }
    }

    fn st_program(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                self.get_devices(pl);
                pl.print("flash firmware\n");
                self.state = State::Reset;
                self.handle(pl, event);
            }
            Event::ResetSuccess => {
                if self.dev_kind == DeviceKind::RaspBee1 || self.dev_kind == DeviceKind::ConBee1 {
                    // wait for the bootloader banner
                    pl.set_timeout(5000);
                    self.state = State::BootloaderQuery;
                } else {
                    pl.set_timeout(500);
                    self.state = State::BootloaderConnect;
                }
            }
            Event::ResetFailed => {
                self.outcome = Outcome::Failed;
                pl.shutdown();
            }
            _ => {}
        }
    }

    fn st_bootloader_connect(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Timeout => {
                if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                    self.state = State::BootloaderQuery;
                    self.handle(pl, Event::Action);
                } else {
                    pl.set_timeout(500);
                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("retry connect bootloader ");
                    w.put_str(&self.dev_path);
                    w.put_str("\n");
                    pl.print(w.as_str());
                }
            }
            Event::AsciiReceived => {
                // short cut, we are already in the bootloader
                pl.clear_timeout();
                pl.set_timeout(100);

                self.state = State::BootloaderQuery;
                self.substate = State::Void;
                self.handle(pl, Event::AsciiReceived);
            }
            _ => {}
        }
    }

    fn st_bootloader_query(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                self.retry = 0;
                self.wp = 0;
                self.ascii.fill(0);

                // ConBee I and RaspBee I announce themselves unsolicited
                pl.set_timeout(200);
            }
            Event::Timeout => {
                self.retry += 1;
                let file_type = self.file.as_ref().map_or(0, |f| f.file_type());

                if self.retry == 3 {
                    pl.print("query bootloader failed\n");
                    self.retry_or_give_up(pl);
                } else if file_type < 30 {
                    // V1 bootloader of ConBee II; also catches devices
                    // without any installed firmware
                    pl.print("query bootloader id V1\n");
                    framing::send_raw(pl, b"ID");
                    pl.set_timeout(200);
                } else {
                    // V3 bootloader of RaspBee II, Hive
                    pl.print("query bootloader id V3\n");
                    framing::send_flagged(pl, &[BTL_MAGIC, BTL_ID_REQUEST]);
                    pl.set_timeout(200);
                }
            }
            Event::AsciiReceived => {
                if self.wp > 32 && self.ascii[self.wp - 1] == b'\n' {
                    let mut sc = TextScanner::new(&self.ascii[..self.wp]);
                    if sc.find("Bootloader") {
                        pl.clear_timeout();
                        pl.print("bootloader detected\n");

                        self.state = State::V1ProgramSync;
                        self.handle(pl, Event::Action);
                    }
                }
            }
            Event::PacketReceived => {
                if self.packet[1] == BTL_ID_RESPONSE {
                    let mut r = ByteReader::new(&self.packet[2..self.packet_len]);
                    let btl_version = r.get_u32();
                    let app_crc = r.get_u32();

                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("bootloader version 0x");
                    w.put_u32hex(btl_version);
                    w.put_str(", app crc 0x");
                    w.put_u32hex(app_crc);
                    w.put_str("\n\n");
                    pl.print(w.as_str());

                    self.state = State::V3ProgramSync;
                    self.handle(pl, Event::Action);
                }
            }
            Event::Disconnected => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v1_program_sync(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                self.wp = 0;
                self.ascii[0] = 0;

                framing::send_raw(pl, &[0x1A, 0x1C, 0xA9, 0xAE]);
                pl.set_timeout(500);
            }
            Event::AsciiReceived => {
                let mut sc = TextScanner::new(&self.ascii[..self.wp]);
                if self.wp > 4 && sc.find("READY") {
                    pl.clear_timeout();

                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("bootloader synced: ");
                    put_printable(&mut w, &self.ascii[..self.wp]);
                    w.put_str("\n");
                    pl.print(w.as_str());

                    self.state = State::V1ProgramWriteHeader;
                    self.handle(pl, Event::Action);
                } else {
                    pl.set_timeout(500);
                }
            }
            Event::Timeout => {
                pl.print("failed to sync bootloader\n");
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v1_program_write_header(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            let Some(file) = self.file.as_ref() else {
                return;
            };

            self.wp = 0;
            self.ascii[0] = 0;

            let mut buf = [0u8; 10];
            let mut w = ByteWriter::new(&mut buf);
            w.put_u32(file.payload_size());
            w.put_u32(file.target_address());
            w.put_u8(file.file_type());
            w.put_u8(file.crc8());

            self.state = State::V1ProgramUpload;

            framing::send_raw(pl, &buf);
            pl.set_timeout(1000);
        }
    }

    fn st_v1_program_upload(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::AsciiReceived => {
                // firmware GET requests (6 bytes): "GET" U16 page ";"
                if self.wp < 6 || self.ascii[0] != b'G' || self.ascii[5] != b';' {
                    return;
                }

                let page = u32::from(u16::from_le_bytes([self.ascii[3], self.ascii[4]]));

                let payload_size = self.file.as_ref().map_or(0, |f| f.payload_size());
                let offset = page.saturating_mul(V1_PAGE_SIZE);

                if offset >= payload_size {
                    self.retry_or_give_up(pl);
                    return;
                }

                self.remaining = payload_size - offset;
                let size = self.remaining.min(V1_PAGE_SIZE);

                if page % 20 == 0 || self.remaining < V1_PAGE_SIZE {
                    self.update_progress(pl);
                }

                self.wp = 0;
                self.ascii[0] = 0;

                if let Some(file) = self.file.as_ref() {
                    framing::send_raw(pl, file.payload(offset as usize, size as usize));
                }

                if self.remaining - size == 0 {
                    self.state = State::V1ProgramValidate;
                    pl.print("\ndone, wait validation...\n");
                    pl.set_timeout(25600);
                } else {
                    pl.set_timeout(2000);
                }
            }
            Event::Timeout => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v1_program_validate(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::AsciiReceived => {
                let mut sc = TextScanner::new(&self.ascii[..self.wp]);

                if self.wp > 6 && sc.find("#VALID CRC") {
                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str(FMT_GREEN);
                    w.put_str("firmware successful written\n");
                    w.put_str(FMT_RESET);
                    pl.print(w.as_str());

                    self.outcome = Outcome::Success;
                    pl.shutdown();
                } else {
                    pl.set_timeout(1000);
                }
            }
            Event::Timeout => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v3_program_sync(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Action => {
                let Some(file) = self.file.as_ref() else {
                    return;
                };

                pl.sleep_ms(50);
                pl.set_timeout(1000);

                let mut cmd = [0u8; 15];
                let mut w = ByteWriter::new(&mut cmd);
                w.put_u8(BTL_MAGIC);
                w.put_u8(BTL_FW_UPDATE_REQUEST);
                w.put_u32(file.payload_size());
                w.put_u32(file.target_address());
                w.put_u8(file.file_type());
                w.put_u32(file.crc32());

                framing::send_flagged(pl, &cmd);
            }
            Event::PacketReceived => {
                if self.packet[1] == BTL_FW_UPDATE_RESPONSE {
                    if self.packet[2] == 0x00 {
                        pl.set_timeout(3000);
                        self.state = State::V3ProgramUpload;
                    } else {
                        log::debug!("update request rejected, status {}", self.packet[2]);
                    }
                }
            }
            Event::Timeout => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v3_program_upload(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::PacketReceived => {
                if self.packet[1] == BTL_FW_DATA_REQUEST && self.packet_len == 8 {
                    pl.set_timeout(5000);

                    let mut r = ByteReader::new(&self.packet[2..8]);
                    let offset = r.get_u32();
                    let mut length = u32::from(r.get_u16());

                    log::debug!("BTL data request, offset: {offset}, length: {length}");

                    let payload_size = self.file.as_ref().map_or(0, |f| f.payload_size());

                    let mut status = 0u8;
                    self.remaining = 0;

                    if u64::from(offset) + u64::from(length) > u64::from(payload_size) {
                        status = 1;
                    } else if length as usize > ASCII_BUF_SIZE - 32 {
                        status = 2;
                    } else if length == 0 {
                        status = 3;
                    } else {
                        self.remaining = payload_size - offset;
                        length = length.min(self.remaining);
                    }

                    let mut buf = [0u8; ASCII_BUF_SIZE];
                    let mut w = ByteWriter::new(&mut buf);
                    w.put_u8(BTL_MAGIC);
                    w.put_u8(BTL_FW_DATA_RESPONSE);
                    w.put_u8(status);
                    w.put_u32(offset);
                    w.put_u16(length as u16);

                    if status == 0 {
                        if let Some(file) = self.file.as_ref() {
                            w.put_bytes(file.payload(offset as usize, length as usize));
                        }
                    } else {
                        let mut line = [0u8; LINE_BUF_SIZE];
                        let mut lw = TextWriter::new(&mut line);
                        lw.put_str("failed to handle data request, status: ");
                        lw.put_long(i64::from(status));
                        lw.put_str("\n");
                        pl.print(lw.as_str());
                    }

                    let end = w.pos();
                    framing::send_flagged(pl, &buf[..end]);

                    self.update_progress(pl);

                    if self.remaining == length {
                        pl.print("\ndone, wait (up to 20 seconds) for verification\n");
                        pl.set_timeout(20000);
                        self.state = State::V3ProgramWaitId;
                    }
                } else {
                    log::debug!("unexpected command {:02X}", self.packet[1]);
                }
            }
            Event::Timeout => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_v3_program_wait_id(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::PacketReceived => {
                if self.packet[1] == BTL_ID_RESPONSE {
                    let mut r = ByteReader::new(&self.packet[2..self.packet_len]);
                    let _btl_version = r.get_u32();
                    let app_crc = r.get_u32();

                    let crc32 = self.file.as_ref().map_or(0, |f| f.crc32());
                    if crc32 != 0 {
                        let mut buf = [0u8; LINE_BUF_SIZE];
                        let mut w = TextWriter::new(&mut buf);
                        w.put_str("app checksum 0x");
                        w.put_u32hex(app_crc);
                        if app_crc == crc32 {
                            w.put_str(" (OK)");
                        } else {
                            w.put_str(" (expected 0x");
                            w.put_u32hex(crc32);
                            w.put_str(")");
                        }
                        w.put_str("\n");
                        pl.print(w.as_str());
                    }

                    pl.print("finished\n");
                    self.outcome = Outcome::Success;
                    pl.shutdown();
                }
            }
            Event::Timeout => {
                self.retry_or_give_up(pl);
            }
            _ => {}
        }
    }

    fn st_connect(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                self.state = State::Connected;
                pl.set_timeout(1000);
            } else {
                self.state = State::Init;
                pl.print("failed to connect\n");
                pl.set_timeout(10000);
            }
        }
    }

    fn st_connected(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Timeout => {
                if !self.config.interactive {
                    self.command_query_status(pl);
                }
                pl.set_timeout(10000);
            }
            Event::Disconnected => {
                pl.clear_timeout();
                self.state = State::Init;
                pl.print("disconnected\n");
                pl.set_timeout(1000);
            }
            _ => {}
        }
    }

    // ---- sniffer --------------------------------------------------------

    fn st_sniff_connect(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::Action {
            self.sniff_seq = 0;
            pl.sniff_open(&self.config.sniff_host, SNIFF_UDP_PORT);

            if pl.connect(&self.dev_path, self.baudrate).is_ok() {
                self.state = State::SniffConfig;
                pl.set_timeout(250);
            } else {
                self.state = State::SniffTeardown;
                pl.print("failed to connect\n");
                pl.set_timeout(10000);
            }
        }
    }

    fn st_sniff_config(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::Timeout => {
                let mut buf = [0u8; 128];
                let mut w = TextWriter::new(&mut buf);
                w.put_str("\nidle\n");
                w.put_str("\nchan ");
                w.put_long(i64::from(self.config.sniff_channel));
                w.put_str("\n");
                w.put_str("\nsniff\n");

                let end = w.pos();
                framing::send_raw(pl, &buf[..end]);

                self.wp = 0;

                self.state = State::SniffConfigConfirm;
                pl.set_timeout(1000);
            }
            Event::Disconnected => {
                pl.clear_timeout();
                self.state = State::SniffTeardown;
                pl.set_timeout(1000);
            }
            _ => {}
        }
    }

    fn st_sniff_config_confirm(&mut self, pl: &mut dyn Platform, event: Event) {
        match event {
            Event::AsciiReceived => {
                let mut sc = TextScanner::new(&self.ascii[..self.wp]);

                if sc.find("Receiving...OK") {
                    pl.clear_timeout();
                    self.state = State::SniffSyncData;
                    self.sniff_wp = 0;
                    self.sniff_len = 0;
                    pl.print("sniffing started, send traffic to host ");
                    pl.print(&self.config.sniff_host);
                    pl.print(" port 17754\n");
                    pl.set_timeout(3_600_000);
                    self.wp = 0;
                    self.rp = 0;
                }
            }
            Event::Timeout => {
                self.state = State::SniffTeardown;
                pl.set_timeout(1000);
            }
            Event::Disconnected => {
                pl.clear_timeout();
                self.state = State::SniffTeardown;
                pl.set_timeout(1000);
            }
            _ => {}
        }
    }

    fn st_sniff_sync_data(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::AsciiReceived || event == Event::Loop {
            self.sniff_len = 0;

            if self.rp < self.wp {
                while self.rp < self.wp && self.ascii[self.rp] != SNIFF_FRAME_START {
                    self.rp += 1; // forward to start marker
                }

                let i = self.rp;

                // a frame is 0x01, length, payload bytes, 0x04
                if i + 1 < self.wp && self.ascii[i] == SNIFF_FRAME_START {
                    self.sniff_wp = 0;
                    self.sniff_len = usize::from(self.ascii[i + 1]);

                    if self.sniff_len < 8 {
                        // below the 8 byte dummy timestamp, noise
                        self.rp += 1;
                        return;
                    }

                    if 2 + self.sniff_len < self.wp - self.rp {
                        if self.ascii[i + 2 + self.sniff_len] == SNIFF_FRAME_END {
                            self.rp = i + 2;
                            self.state = State::SniffRecvData;
                            self.handle(pl, Event::AsciiReceived);
                        } else {
                            // invalid frame
                            self.rp += 1;
                        }
                    }

                    return;
                }
            }

            // no sync data found
            self.rp = 0;
            self.wp = 0;
        }

        if event == Event::Timeout {
            self.state = State::SniffTeardown;
            pl.set_timeout(1000);
        } else if event == Event::Disconnected {
            pl.clear_timeout();
            self.state = State::SniffTeardown;
            pl.set_timeout(1000);
        }
    }

    fn st_sniff_recv_data(&mut self, pl: &mut dyn Platform, event: Event) {
        if event == Event::AsciiReceived {
            while self.rp < self.wp {
                if self.sniff_wp >= self.sniff_packet.len() {
                    break;
                }
                self.sniff_packet[self.sniff_wp] = self.ascii[self.rp];
                self.sniff_wp += 1;
                self.rp += 1;

                if self.sniff_wp == self.sniff_len + 1 {
                    // extra 0x04 end marker
                    break;
                }
            }

            // move unprocessed bytes to the front
            let mut i = 0;
            while self.rp < self.wp {
                self.ascii[i] = self.ascii[self.rp];
                self.rp += 1;
                i += 1;
            }
            self.rp = 0;
            self.wp = i;

            if self.sniff_wp == self.sniff_len + 1 {
                if self.sniff_packet[self.sniff_len] == SNIFF_FRAME_END {
                    if self.config.debug_level != 0 {
                        let mut buf = [0u8; 560];
                        let mut w = TextWriter::new(&mut buf);
                        w.put_str("pkg(");
                        w.put_long(self.sniff_len as i64);
                        w.put_str("/");
                        w.put_long(i64::from(self.sniff_seq));
                        w.put_str(") ");
                        for b in &self.sniff_packet[..self.sniff_len] {
                            w.put_u8hex(*b);
                            w.put_str(" ");
                        }
                        w.put_str("\n");
                        pl.print(w.as_str());
                    }

                    self.relay_zep(pl);
                }

                self.sniff_wp = 0;
                self.sniff_len = 0;
                self.state = State::SniffSyncData;
            }
        }

        if event == Event::Timeout {
            self.state = State::SniffTeardown;
            pl.set_timeout(1000);
        } else if event == Event::Disconnected {
            pl.clear_timeout();
            self.state = State::SniffTeardown;
            pl.set_timeout(1000);
        }
    }

    /// Wraps the captured frame into a ZEP v2 datagram and hands it to
    /// the platform relay socket.
    ///
    /// ```text
    /// |Preamble|Version|Type|Channel|Device|CRC/LQI|LQI|NTP Timestamp|Seq#|Reserved|Length|
    /// |  "EX"  | 1 byte| 1  |   1   |  2   |   1   | 1 |      8      | 4  |   10   |  1   |
    /// ```
    ///
    /// Ack frames (type 2) carry only preamble, version, type and
    /// sequence number.
    fn relay_zep(&mut self, pl: &mut dyn Platform) {
        let mut buf = [0u8; 320];
        let mut w = ByteWriter::new(&mut buf);

        w.put_u8(b'E');
        w.put_u8(b'X');
        w.put_u8(2); // version

        // frames shorter than timestamp + minimal MAC header are acks
        let data = self.sniff_len >= 8 + 5;
        w.put_u8(if data { 1 } else { 2 });

        if data {
            w.put_u8(self.config.sniff_channel);
            w.put_u8(0); // device ID
            w.put_u8(0); // device ID
            w.put_u8(0); // CRC/LQI mode
            w.put_u8(0); // LQI val

            for _ in 0..8 {
                w.put_u8(0); // NTP timestamp
            }
        }

        w.put_u32_be(self.sniff_seq);
        self.sniff_seq = self.sniff_seq.wrapping_add(1);

        if data {
            for _ in 0..10 {
                w.put_u8(0); // reserved
            }

            w.put_u8((self.sniff_len - 8) as u8);
            w.put_bytes(&self.sniff_packet[8..self.sniff_len]);
        }

        let end = w.pos();
        pl.sniff_send(&buf[..end]);
    }

    fn st_sniff_teardown(&mut self, pl: &mut dyn Platform, _event: Event) {
        pl.sniff_close();
        pl.clear_timeout();
        self.state = State::Init;
        pl.print("sniffer stop\n");
        pl.set_timeout(1000);
    }

    // ---- helpers --------------------------------------------------------

    /// Applies the parsed command line: loads and validates the firmware
    /// file, enumerates devices, classifies the target and selects the
    /// initial state. Runs again on every retry round.
    fn process_config(&mut self, pl: &mut dyn Platform) -> bool {
        self.state = State::Void;
        self.substate = State::Void;
        self.dev_path = self.config.device.clone();
        self.dev_serial.clear();
        self.dev_kind = DeviceKind::Unknown;
        self.baudrate = Baudrate::Unknown;
        self.file = None;
        self.task = self.config.task;

        if let Some(secs) = self.config.timeout_secs {
            self.max_time = self.start_time + secs * 1000;
        }

        if self.task == Task::Program {
            let content = match pl.read_file(&self.config.file_path) {
                Ok(content) => content,
                Err(err) => {
                    log::debug!("failed to read {}: {err}", self.config.file_path);
                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("failed to read file: ");
                    w.put_str(&self.config.file_path);
                    w.put_str("\n");
                    pl.print(w.as_str());
                    return false;
                }
            };

            let size = content.len();
            match GcfFile::parse(&self.config.file_path, content) {
                Ok(file) => {
                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("read file success: ");
                    w.put_str(&self.config.file_path);
                    w.put_str(" (");
                    w.put_long(size as i64);
                    w.put_str(" bytes)\n");
                    pl.print(w.as_str());
                    self.file = Some(file);
                }
                Err(err) => {
                    log::debug!("{err}");
                    let mut buf = [0u8; LINE_BUF_SIZE];
                    let mut w = TextWriter::new(&mut buf);
                    w.put_str("invalid file: ");
                    w.put_str(&self.config.file_path);
                    w.put_str("\n");
                    pl.print(w.as_str());
                    return false;
                }
            }
        }

        self.get_devices(pl);

        let file_type = self.file.as_ref().map_or(0, |f| f.file_type());
        let target = self.file.as_ref().map_or(0, |f| f.target_address());
        let (kind, baudrate) = device::classify(&self.dev_path, file_type, target);
        self.dev_kind = kind;
        if self.baudrate == Baudrate::Unknown {
            self.baudrate = baudrate;
        }

        match self.task {
            Task::Program => {
                if self.dev_path.is_empty() {
                    pl.print("missing -d argument\n");
                    return false;
                }

                // without -t retry for 10 seconds
                if self.max_time < self.start_time || self.max_time == 0 {
                    self.max_time = self.start_time + 10 * 1000;
                }

                let fw_version = self.file.as_ref().map_or(0, |f| f.fw_version());
                self.dev_kind = device::refine_raspbee(self.dev_kind, fw_version, target);

                self.state = State::Program;
            }
            Task::Connect => {
                if self.dev_path.is_empty() {
                    pl.print("missing -d argument\n");
                    return false;
                }
                self.state = State::Connect;
            }
            Task::Sniff => {
                if self.dev_path.is_empty() {
                    pl.print("missing -d argument\n");
                    return false;
                }
                self.state = State::SniffConnect;
            }
            Task::Reset => {
                if self.dev_path.is_empty() {
                    pl.print("missing -d argument\n");
                    return false;
                }
                self.state = State::Reset;
            }
            Task::List => {
                self.state = State::ListDevices;
            }
            Task::Help | Task::None => {
                print_help(pl);
                self.outcome = Outcome::Success;
                pl.shutdown();
            }
        }

        true
    }

    /// Enumerates devices and back-fills the serial number (and default
    /// baud rate) when `-d` matched one of them.
    fn get_devices(&mut self, pl: &mut dyn Platform) {
        self.devices = pl.enumerate(MAX_DEVICES);

        if !self.dev_path.is_empty() && self.dev_serial.is_empty() {
            for dev in &self.devices {
                if dev.serial.is_empty() {
                    continue;
                }

                let by_path = !dev.path.is_empty() && self.dev_path.contains(&dev.path);
                let by_stable =
                    !dev.stable_path.is_empty() && self.dev_path.contains(&dev.stable_path);

                if by_path || by_stable {
                    self.dev_serial = dev.serial.clone();
                    if self.baudrate == Baudrate::Unknown {
                        self.baudrate = dev.baudrate;
                    }
                    break;
                }
            }
        }
    }

    /// Bounded retry: back to `Init` while wall time remains, otherwise
    /// give up and shut down.
    fn retry_or_give_up(&mut self, pl: &mut dyn Platform) {
        let now = pl.time_ms();

        if self.max_time > now {
            let mut buf = [0u8; LINE_BUF_SIZE];
            let mut w = TextWriter::new(&mut buf);
            w.put_str("retry: ");
            w.put_long(((self.max_time - now) / 1000) as i64);
            w.put_str(" seconds left\n");
            pl.print(w.as_str());

            self.state = State::Init;
            self.substate = State::Void;
            pl.set_timeout(250);
        } else {
            self.outcome = Outcome::Failed;
            pl.shutdown();
        }
    }

    fn update_progress(&mut self, pl: &mut dyn Platform) {
        let total = self.file.as_ref().map_or(0, |f| f.payload_size());
        if total == 0 {
            return;
        }

        let (w, h) = pl.get_win_size();
        let w = w as usize;
        let wmax = if w.saturating_sub(2) <= 80 { w } else { 80 };

        let done = u64::from(total - self.remaining);
        let mut percent = done * 100 / u64::from(total);
        if percent > 95 {
            percent = 100;
        }

        let mut buf = [0u8; 512];
        let mut tw = TextWriter::new(&mut buf);

        tw.put_str("\r ");

        // right align the percent number
        if percent < 10 {
            tw.put_str("  ");
        } else if percent < 100 {
            tw.put_str(" ");
        }

        tw.put_long(percent as i64);
        tw.put_str("% uploading ");

        let bar = wmax.saturating_sub(tw.pos() + 2);
        let ndone = (done * bar as u64 / u64::from(total)) as usize;

        for i in 0..bar {
            if i <= ndone {
                tw.put_str(FMT_BLOCK_DONE);
            } else {
                tw.put_str(FMT_BLOCK_OPEN);
            }
        }

        while tw.pos() < wmax {
            tw.put_str(" ");
        }

        pl.set_cursor(0, h.saturating_sub(1));
        pl.print(tw.as_str());
    }

    // ---- application-mode commands --------------------------------------

    /// Write parameter 0x26: watchdog timeout two seconds. The running
    /// firmware acknowledges and reboots into the bootloader.
    fn command_reset_uart(&mut self, pl: &mut dyn Platform) {
        let cmd = [
            0x0B, // command: write parameter
            0x03, // seq
            0x00, // status
            0x0C, 0x00, // frame length (12)
            0x05, 0x00, // buffer length (5)
            0x26, // param: watchdog timeout (2 seconds)
            0x02, 0x00, 0x00, 0x00,
        ];

        log::debug!("send uart reset");

        framing::send_flagged(pl, &cmd);
    }

    fn command_query_status(&mut self, pl: &mut dyn Platform) {
        let mut cmd = [
            0x07, // command: device state
            0x02, // seq
            0x00, // status
            0x08, 0x00, // frame length (8)
            0x00, 0x00, 0x00, // dummy bytes
        ];

        cmd[1] = self.seq;
        self.seq = self.seq.wrapping_add(1);

        framing::send_flagged(pl, &cmd);
    }

    fn command_query_firmware_version(&mut self, pl: &mut dyn Platform) {
        let cmd = [
            0x0D, // command: version
            0x05, // seq
            0x00, // status
            0x09, 0x00, // frame length (9)
            0x00, 0x00, 0x00, 0x00, // dummy bytes
        ];

        framing::send_flagged(pl, &cmd);
    }

    fn command_read_parameter(&mut self, pl: &mut dyn Platform, seq: u8, id: u8, data: &[u8]) {
        let mut cmd = [0u8; 127];
        let mut w = ByteWriter::new(&mut cmd);
        w.put_u8(0x0A); // command: read parameter
        w.put_u8(seq);
        w.put_u8(0x00); // status
        w.put_u16((3 + 2 + 2 + 1 + data.len()) as u16); // frame length
        w.put_u16((data.len() + 1) as u16); // dynamic buffer length
        w.put_u8(id);
        w.put_bytes(data);

        let end = w.pos();
        framing::send_flagged(pl, &cmd[..end]);
    }
}

fn debug_hex(msg: &str, data: &[u8]) {
    if log::log_enabled!(log::Level::Debug) {
        let mut buf = [0u8; 1024];
        let mut w = TextWriter::new(&mut buf);
        w.put_hex(data);
        log::debug!("{msg}: {hex} ({len})", hex = w.as_str(), len = data.len());
    }
}

/// Two hex characters to one byte; `None` without consuming input when
/// the next two characters are not hex digits.
fn get_hexbyte(sc: &mut TextScanner) -> Option<u8> {
    if sc.status() != TextStatus::Ok || sc.remaining() < 2 {
        return None;
    }

    let mut byte = 0u8;
    let start = sc.pos();

    for _ in 0..2 {
        let nib = match sc.peek() {
            c @ b'0'..=b'9' => c - b'0',
            c @ b'a'..=b'f' => c - b'a' + 10,
            c @ b'A'..=b'F' => c - b'A' + 10,
            _ => {
                sc.seek(start);
                return None;
            }
        };
        byte = (byte << 4) | nib;
        sc.seek(sc.pos() + 1);
    }

    Some(byte)
}

fn put_printable(w: &mut TextWriter, data: &[u8]) {
    for &ch in data {
        if (0x20..=0x7E).contains(&ch) {
            let c = [ch];
            if let Ok(s) = std::str::from_utf8(&c) {
                w.put_str(s);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::GCF_MAGIC;
    use crate::platform::mock::MockPlatform;

    const WATCHDOG_CMD: [u8; 12] = [
        0x0B, 0x03, 0x00, 0x0C, 0x00, 0x05, 0x00, 0x26, 0x02, 0x00, 0x00, 0x00,
    ];

    fn frame(msg: &[u8]) -> Vec<u8> {
        let mut pl = MockPlatform::new();
        framing::send_flagged(&mut pl, msg);
        pl.tx_flushed().to_vec()
    }

    fn gcf(file_type: u8, target: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GCF_MAGIC.to_le_bytes());
        buf.push(file_type);
        buf.extend_from_slice(&target.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(0x77); // crc8, opaque to the flasher
        buf.extend_from_slice(payload);
        buf
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn program_setup(device: &str, content: Vec<u8>) -> (MockPlatform, Flasher) {
        let mut pl = MockPlatform::new();
        pl.files.insert("fw.GCF".to_string(), content);

        let fl = Flasher::new(Config {
            task: Task::Program,
            device: device.to_string(),
            file_path: "fw.GCF".to_string(),
            ..Config::default()
        });

        (pl, fl)
    }

    #[test]
    fn test_v1_program_full_run() {
        let payload = test_payload(700);
        let (mut pl, mut fl) = program_setup("/dev/ttyUSB0", gcf(7, 0, &payload));

        fl.handle(&mut pl, Event::Started);

        // reset over the application command channel
        assert_eq!(
            pl.connected_with(),
            Some(&("/dev/ttyUSB0".to_string(), Baudrate::B38400))
        );
        assert_eq!(pl.flushes()[0], frame(&WATCHDOG_CMD));

        // write parameter response for the watchdog id, FTDI bridge
        // keeps the port alive so this concludes the reset
        let ack = [0x0B, 0x03, 0x00, 0x0C, 0x00, 0x05, 0x00, 0x26];
        fl.received(&mut pl, &frame(&ack));
        assert_eq!(fl.state, State::BootloaderQuery);
        assert!(pl.printed().contains("command UART reset done"));

        // unsolicited bootloader banner
        fl.received(&mut pl, b"V1 Bootloader ready to rumble whatever\n");
        assert_eq!(fl.state, State::V1ProgramSync);
        assert_eq!(pl.flushes()[1], vec![0x1A, 0x1C, 0xA9, 0xAE]);

        fl.received(&mut pl, b"READY");
        assert_eq!(fl.state, State::V1ProgramUpload);
        // 10 byte header: size, target, file type, crc8
        let mut header = Vec::new();
        header.extend_from_slice(&700u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.push(7);
        header.push(0x77);
        assert_eq!(pl.flushes()[2], header);

        // three page requests cover the 700 byte payload
        fl.received(&mut pl, b"GET\x00\x00;");
        assert_eq!(pl.flushes()[3], payload[0..256].to_vec());
        fl.received(&mut pl, b"GET\x01\x00;");
        assert_eq!(pl.flushes()[4], payload[256..512].to_vec());
        fl.received(&mut pl, b"GET\x02\x00;");
        assert_eq!(pl.flushes()[5], payload[512..700].to_vec());

        assert_eq!(fl.state, State::V1ProgramValidate);
        assert_eq!(pl.timeout_armed(), Some(25600));

        fl.received(&mut pl, b"#VALID CRC\n");
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
        assert_eq!(fl.crc_errors(), 0);
    }

    #[test]
    fn test_v3_program_full_run() {
        let payload = test_payload(500);
        let (mut pl, mut fl) = program_setup("/dev/ttyACM0", gcf(30, 0x5000, &payload));

        fl.handle(&mut pl, Event::Started);

        assert_eq!(
            pl.connected_with(),
            Some(&("/dev/ttyACM0".to_string(), Baudrate::B115200))
        );
        assert_eq!(pl.flushes()[0], frame(&WATCHDOG_CMD));

        // the CDC endpoint drops while the MCU reboots
        fl.handle(&mut pl, Event::Disconnected);
        assert_eq!(fl.state, State::BootloaderConnect);
        assert_eq!(pl.timeout_armed(), Some(500));

        // reconnect and query the V3 bootloader id
        fl.handle(&mut pl, Event::Timeout);
        assert_eq!(fl.state, State::BootloaderQuery);
        fl.handle(&mut pl, Event::Timeout);
        assert_eq!(
            pl.flushes()[1],
            frame(&[BTL_MAGIC, BTL_ID_REQUEST]),
            "ID request after the initial banner wait"
        );

        let mut id = vec![BTL_MAGIC, BTL_ID_RESPONSE];
        id.extend_from_slice(&0x00030200u32.to_le_bytes()); // bootloader version
        id.extend_from_slice(&0xDEADBEEFu32.to_le_bytes()); // current app crc
        fl.received(&mut pl, &frame(&id));

        assert_eq!(fl.state, State::V3ProgramSync);
        let mut update = vec![BTL_MAGIC, BTL_FW_UPDATE_REQUEST];
        update.extend_from_slice(&500u32.to_le_bytes());
        update.extend_from_slice(&0x5000u32.to_le_bytes());
        update.push(30);
        update.extend_from_slice(&0u32.to_le_bytes()); // no crc32 in plain files
        assert_eq!(pl.flushes()[2], frame(&update));

        fl.received(&mut pl, &frame(&[BTL_MAGIC, BTL_FW_UPDATE_RESPONSE, 0x00]));
        assert_eq!(fl.state, State::V3ProgramUpload);

        // first data request, full chunk
        let mut req = vec![BTL_MAGIC, BTL_FW_DATA_REQUEST];
        req.extend_from_slice(&0u32.to_le_bytes());
        req.extend_from_slice(&256u16.to_le_bytes());
        fl.received(&mut pl, &frame(&req));

        let mut resp = vec![BTL_MAGIC, BTL_FW_DATA_RESPONSE, 0x00];
        resp.extend_from_slice(&0u32.to_le_bytes());
        resp.extend_from_slice(&256u16.to_le_bytes());
        resp.extend_from_slice(&payload[0..256]);
        assert_eq!(pl.flushes()[3], frame(&resp));
        assert_eq!(fl.state, State::V3ProgramUpload);

        // the bootloader asks for exactly the remaining bytes; the
        // final chunk moves the machine to the verify wait
        let mut req = vec![BTL_MAGIC, BTL_FW_DATA_REQUEST];
        req.extend_from_slice(&256u32.to_le_bytes());
        req.extend_from_slice(&244u16.to_le_bytes());
        fl.received(&mut pl, &frame(&req));

        let mut resp = vec![BTL_MAGIC, BTL_FW_DATA_RESPONSE, 0x00];
        resp.extend_from_slice(&256u32.to_le_bytes());
        resp.extend_from_slice(&244u16.to_le_bytes());
        resp.extend_from_slice(&payload[256..500]);
        assert_eq!(pl.flushes()[4], frame(&resp));
        assert_eq!(fl.state, State::V3ProgramWaitId);
        assert_eq!(pl.timeout_armed(), Some(20000));

        fl.received(&mut pl, &frame(&id));
        assert!(pl.printed().contains("finished"));
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_v3_update_response_carries_status() {
        let payload = test_payload(64);
        let (mut pl, mut fl) = program_setup("/dev/ttyACM0", gcf(30, 0x5000, &payload));

        fl.handle(&mut pl, Event::Started);
        fl.handle(&mut pl, Event::Disconnected);
        fl.handle(&mut pl, Event::Timeout);
        fl.handle(&mut pl, Event::Timeout);

        let mut id = vec![BTL_MAGIC, BTL_ID_RESPONSE];
        id.extend_from_slice(&[0u8; 8]);
        fl.received(&mut pl, &frame(&id));
        assert_eq!(fl.state, State::V3ProgramSync);

        // a negative status must not start the upload
        fl.received(&mut pl, &frame(&[BTL_MAGIC, BTL_FW_UPDATE_RESPONSE, 0x05]));
        assert_eq!(fl.state, State::V3ProgramSync);

        fl.received(&mut pl, &frame(&[BTL_MAGIC, BTL_FW_UPDATE_RESPONSE, 0x00]));
        assert_eq!(fl.state, State::V3ProgramUpload);
    }

    #[test]
    fn test_v3_data_request_out_of_range() {
        let payload = test_payload(64);
        let (mut pl, mut fl) = program_setup("/dev/ttyACM0", gcf(30, 0x5000, &payload));

        fl.handle(&mut pl, Event::Started);
        fl.handle(&mut pl, Event::Disconnected);
        fl.handle(&mut pl, Event::Timeout);
        fl.handle(&mut pl, Event::Timeout);
        let mut id = vec![BTL_MAGIC, BTL_ID_RESPONSE];
        id.extend_from_slice(&[0u8; 8]);
        fl.received(&mut pl, &frame(&id));
        fl.received(&mut pl, &frame(&[BTL_MAGIC, BTL_FW_UPDATE_RESPONSE, 0x00]));
        pl.clear_tx();

        let mut req = vec![BTL_MAGIC, BTL_FW_DATA_REQUEST];
        req.extend_from_slice(&60u32.to_le_bytes());
        req.extend_from_slice(&100u16.to_le_bytes());
        fl.received(&mut pl, &frame(&req));

        // status 1, offset echoed, no data
        let mut resp = vec![BTL_MAGIC, BTL_FW_DATA_RESPONSE, 0x01];
        resp.extend_from_slice(&60u32.to_le_bytes());
        resp.extend_from_slice(&100u16.to_le_bytes());
        assert_eq!(pl.flushes()[0], frame(&resp));
        assert_eq!(fl.state, State::V3ProgramUpload);
        assert!(pl.printed().contains("failed to handle data request"));
    }

    #[test]
    fn test_program_retries_until_deadline() {
        let payload = test_payload(64);
        let (mut pl, mut fl) = program_setup("/dev/ttyUSB0", gcf(7, 0, &payload));

        fl.handle(&mut pl, Event::Started);
        // no -t argument defaults to a 10 second retry window
        assert_eq!(fl.max_time, pl.time_ms() + 10_000);

        // reset times out, FTDI reset is unavailable, bootloader query
        // comes up empty three times
        fl.handle(&mut pl, Event::Timeout);
        assert_eq!(pl.ftdi_reset_calls, 1);
        assert_eq!(fl.state, State::BootloaderQuery);

        for _ in 0..3 {
            fl.handle(&mut pl, Event::Timeout);
        }

        // back to Init with the 250 ms re-entry timer
        assert_eq!(fl.state, State::Init);
        assert_eq!(pl.timeout_armed(), Some(250));
        assert!(pl.printed().contains("seconds left"));
        assert!(pl.is_running());

        // past the deadline the same failure gives up
        pl.advance(11_000);
        fl.handle(&mut pl, Event::Timeout); // Init, runs the task again
        fl.handle(&mut pl, Event::Timeout); // reset timeout
        for _ in 0..3 {
            fl.handle(&mut pl, Event::Timeout);
        }

        assert_eq!(fl.outcome(), Outcome::Failed);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_reset_task_conbee2() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Reset,
            device: "/dev/ttyACM0".to_string(),
            ..Config::default()
        });

        fl.handle(&mut pl, Event::Started);

        // reset task queries the firmware version before the watchdog
        assert_eq!(pl.flush_count(), 2);
        assert_eq!(pl.flushes()[1], frame(&WATCHDOG_CMD));

        fl.handle(&mut pl, Event::Disconnected);
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_reset_timeout_pretends_success() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Reset,
            device: "/dev/funky0".to_string(),
            ..Config::default()
        });

        fl.handle(&mut pl, Event::Started);
        fl.handle(&mut pl, Event::Timeout);

        // no hardware reset channel for an unknown device; the flow
        // assumes the bootloader is already waiting
        assert!(pl.printed().contains("command reset timeout"));
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_list_devices() {
        let mut pl = MockPlatform::new();
        pl.devices.push(Device {
            name: "ConBee_II".to_string(),
            serial: "DE1948474".to_string(),
            path: "/dev/ttyACM0".to_string(),
            stable_path: String::new(),
            baudrate: Baudrate::B115200,
        });

        let mut fl = Flasher::new(Config {
            task: Task::List,
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("/dev/ttyACM0"));
        assert!(pl.printed().contains("DE1948474"));
        assert!(pl.printed().contains("ConBee_II"));
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_list_devices_empty() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::List,
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("no devices found"));
        assert_eq!(fl.outcome(), Outcome::Success);
    }

    #[test]
    fn test_help_task() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Help,
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("usage: beeflash"));
        assert_eq!(fl.outcome(), Outcome::Success);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_program_missing_device_argument() {
        let (mut pl, mut fl) = program_setup("", gcf(7, 0, &test_payload(16)));
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("missing -d argument"));
        assert_eq!(fl.outcome(), Outcome::ConfigError);
        assert!(!pl.is_running());
    }

    #[test]
    fn test_program_invalid_file() {
        let mut pl = MockPlatform::new();
        pl.files
            .insert("fw.GCF".to_string(), vec![0x00, 0x01, 0x02]);

        let mut fl = Flasher::new(Config {
            task: Task::Program,
            device: "/dev/ttyACM0".to_string(),
            file_path: "fw.GCF".to_string(),
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("invalid file"));
        assert_eq!(fl.outcome(), Outcome::ConfigError);
    }

    #[test]
    fn test_program_file_not_found() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Program,
            device: "/dev/ttyACM0".to_string(),
            file_path: "missing.GCF".to_string(),
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);

        assert!(pl.printed().contains("failed to read file"));
        assert_eq!(fl.outcome(), Outcome::ConfigError);
    }

    #[test]
    fn test_serial_number_backfill() {
        let payload = test_payload(16);
        let (mut pl, mut fl) = program_setup("/dev/ttyUSB0", gcf(1, 0, &payload));
        pl.devices.push(Device {
            name: "ConBee".to_string(),
            serial: "DJ00QBWE".to_string(),
            path: "/dev/ttyUSB0".to_string(),
            stable_path: String::new(),
            baudrate: Baudrate::B38400,
        });

        fl.handle(&mut pl, Event::Started);
        assert_eq!(fl.dev_serial, "DJ00QBWE");
        assert_eq!(fl.dev_kind, DeviceKind::ConBee1);
    }

    #[test]
    fn test_connect_mode_prints_packets() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Connect,
            device: "/dev/ttyACM0".to_string(),
            ..Config::default()
        });

        fl.handle(&mut pl, Event::Started);
        assert_eq!(fl.state, State::Connected);

        fl.received(&mut pl, &frame(&[0x1C, 0x22, 0x00, 0xAB]));
        assert!(pl.printed().contains("packet: 4 bytes, 1C2200AB"));

        // periodic status query while idle
        fl.handle(&mut pl, Event::Timeout);
        let status = [0x07, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(pl.flushes()[0], frame(&status));
    }

    #[test]
    fn test_sniffer_relays_zep_datagrams() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Sniff,
            device: "/dev/ttyACM0".to_string(),
            sniff_channel: 15,
            sniff_host: "127.0.0.1".to_string(),
            ..Config::default()
        });

        fl.handle(&mut pl, Event::Started);
        assert_eq!(fl.state, State::SniffConfig);
        assert_eq!(pl.sniff_opened, Some(("127.0.0.1".to_string(), 17754)));

        fl.handle(&mut pl, Event::Timeout);
        assert_eq!(fl.state, State::SniffConfigConfirm);
        assert_eq!(pl.flushes()[0], b"\nidle\n\nchan 15\n\nsniff\n".to_vec());

        fl.received(&mut pl, b"Receiving...OK\n");
        assert_eq!(fl.state, State::SniffSyncData);
        assert!(pl.printed().contains("sniffing started"));

        // one captured frame: start marker, length, 8 byte timestamp,
        // 5 payload bytes, end marker
        let mut capture = vec![0x01, 13];
        capture.extend_from_slice(&[0u8; 8]);
        capture.extend_from_slice(&[0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
        capture.push(0x04);
        fl.received(&mut pl, &capture);

        assert_eq!(pl.sniff_sent.len(), 1);
        let zep = &pl.sniff_sent[0];
        assert_eq!(zep.len(), 37);
        assert_eq!(&zep[0..2], b"EX");
        assert_eq!(zep[2], 2); // ZEP v2
        assert_eq!(zep[3], 1); // data frame
        assert_eq!(zep[4], 15); // channel
        assert_eq!(&zep[17..21], &[0, 0, 0, 0]); // sequence 0, big-endian
        assert_eq!(zep[31], 5); // payload length
        assert_eq!(&zep[32..37], &[0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
        assert_eq!(fl.state, State::SniffSyncData);

        // a short frame goes out as an ack with just the sequence number
        let capture = [0x01u8, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0x55, 0x04];
        fl.received(&mut pl, &capture);
        assert_eq!(pl.sniff_sent.len(), 2);
        let zep = &pl.sniff_sent[1];
        assert_eq!(zep.len(), 8);
        assert_eq!(zep[3], 2); // ack frame
        assert_eq!(&zep[4..8], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_sniffer_teardown_on_disconnect() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Sniff,
            device: "/dev/ttyACM0".to_string(),
            sniff_channel: 11,
            sniff_host: "127.0.0.1".to_string(),
            ..Config::default()
        });

        fl.handle(&mut pl, Event::Started);
        fl.handle(&mut pl, Event::Timeout);
        fl.received(&mut pl, b"Receiving...OK\n");
        assert_eq!(fl.state, State::SniffSyncData);

        fl.handle(&mut pl, Event::Disconnected);
        assert_eq!(fl.state, State::SniffTeardown);

        fl.handle(&mut pl, Event::Timeout);
        assert_eq!(fl.state, State::Init);
        assert!(pl.sniff_opened.is_none());
        assert!(pl.printed().contains("sniffer stop"));
    }

    #[test]
    fn test_console_read_parameter() {
        let mut pl = MockPlatform::new();
        let mut fl = Flasher::new(Config {
            task: Task::Connect,
            device: "/dev/ttyACM0".to_string(),
            interactive: true,
            ..Config::default()
        });
        fl.handle(&mut pl, Event::Started);
        pl.clear_tx();

        fl.console_line(&mut pl, "rp 38 0x0102");
        assert!(pl.printed().contains("> reading parameter: 38 1 2"));

        let expected = [0x0A, 0x01, 0x00, 0x0A, 0x00, 0x03, 0x00, 38, 0x01, 0x02];
        assert_eq!(pl.flushes()[0], frame(&expected));

        fl.console_line(&mut pl, "rp over9000");
        assert!(pl.printed().contains("invalid argument for parameter <id>"));

        fl.console_line(&mut pl, "");
        assert!(pl.printed().contains("use 'help'"));
    }

    #[test]
    fn test_v1_page_request_out_of_range() {
        let payload = test_payload(300);
        let (mut pl, mut fl) = program_setup("/dev/ttyUSB0", gcf(7, 0, &payload));

        fl.handle(&mut pl, Event::Started);
        let ack = [0x0B, 0x03, 0x00, 0x0C, 0x00, 0x05, 0x00, 0x26];
        fl.received(&mut pl, &frame(&ack));
        fl.received(&mut pl, b"V1 Bootloader ready to rumble whatever\n");
        fl.received(&mut pl, b"READY");
        assert_eq!(fl.state, State::V1ProgramUpload);

        // page 2 starts at offset 512, past the 300 byte payload
        fl.received(&mut pl, b"GET\x02\x00;");
        assert_eq!(fl.state, State::Init);
        assert!(pl.printed().contains("seconds left"));
    }

    #[test]
    fn test_crc_errors_are_counted_not_fatal() {
        let payload = test_payload(64);
        let (mut pl, mut fl) = program_setup("/dev/ttyACM0", gcf(30, 0x5000, &payload));
        fl.handle(&mut pl, Event::Started);
        fl.handle(&mut pl, Event::Disconnected);
        fl.handle(&mut pl, Event::Timeout);
        let state = fl.state;

        // valid framing, broken checksum
        fl.received(&mut pl, &[0xC0, 0x81, 0x82, 0x00, 0x00, 0xC0]);
        assert_eq!(fl.crc_errors(), 1);
        assert_eq!(fl.state, state, "a checksum error must not transition");
    }
}

fn print_help(pl: &mut dyn Platform) {
    pl.print(concat!(
        "beeflash ",
        env!("CARGO_PKG_VERSION"),
        " firmware flash tool for ConBee/RaspBee Zigbee coordinators\n"
    ));
    pl.print(
        "usage: beeflash <options>\n\
         options:\n\
         \u{20}-r              force device reboot without programming\n\
         \u{20}-f <firmware>   flash firmware file\n\
         \u{20}-d <device>     device path to use, e.g. /dev/ttyUSB0\n\
         \u{20}-c              connect and debug serial protocol\n\
         \u{20}-s <channel>    enable sniffer on Zigbee channel (requires sniffer firmware)\n\
         \u{20}                the Wireshark sniffer traffic is send to UDP port 17754\n\
         \u{20}-H <host>       send sniffer traffic to Wireshark running on host\n\
         \u{20}                default is 127.0.0.1 (localhost)\n\
         \u{20}-p <port>       listen port\n\
         \u{20}-t <timeout>    retry until timeout (seconds) is reached\n\
         \u{20}-l              list devices\n\
         \u{20}-x <loglevel>   debug log level 0, 1, 3\n\
         \u{20}-i              interactive mode for debugging\n\
         \u{20}-h -?           print this help\n",
    );
}
