//! Telnet and RFC 2217 (COM-PORT-OPTION) codec.
//!
//! A sans-IO state machine shared by the bridge listener (server role) and
//! the `rfc2217://` client transport (client role). Bytes go in through
//! [`TelnetCodec::decode`], which returns the payload data and any protocol
//! replies that must be written back to the peer. Outbound payload is passed
//! through [`escape`] so a literal `0xFF` is never read as a command.
//!
//! Option negotiation is loop-free: a reply is only sent when the local view
//! of an option changes, never in answer to an acknowledgement.
//!
//! ```text
//! IAC IAC                       -> literal 0xFF
//! IAC WILL|WONT|DO|DONT <opt>   -> option negotiation
//! IAC SB <opt> <payload> IAC SE -> subnegotiation
//! ```

/// Telnet command bytes.
pub mod cmd {
    /// Interpret As Command.
    pub const IAC: u8 = 255;
    /// Refuse to perform an option.
    pub const DONT: u8 = 254;
    /// Request the peer to perform an option.
    pub const DO: u8 = 253;
    /// Refuse to perform an option.
    pub const WONT: u8 = 252;
    /// Offer to perform an option.
    pub const WILL: u8 = 251;
    /// Subnegotiation begin.
    pub const SB: u8 = 250;
    /// Subnegotiation end.
    pub const SE: u8 = 240;
}

/// Telnet option codes this codec knows about.
pub mod option {
    /// Binary transmission (RFC 856).
    pub const BINARY: u8 = 0;
    /// Echo (RFC 857).
    pub const ECHO: u8 = 1;
    /// Suppress go-ahead (RFC 858).
    pub const SGA: u8 = 3;
    /// COM-PORT-OPTION (RFC 2217).
    pub const COM_PORT: u8 = 44;
}

/// RFC 2217 subnegotiation commands (client to server). Server replies use
/// the same code plus [`SERVER_OFFSET`](com_port::SERVER_OFFSET).
pub mod com_port {
    /// Signature exchange.
    pub const SIGNATURE: u8 = 0;
    /// Baud rate, 4 bytes big-endian, 0 queries.
    pub const SET_BAUDRATE: u8 = 1;
    /// Data bits, 0 queries.
    pub const SET_DATASIZE: u8 = 2;
    /// Parity, 0 queries.
    pub const SET_PARITY: u8 = 3;
    /// Stop bits, 0 queries.
    pub const SET_STOPSIZE: u8 = 4;
    /// Flow control, break, DTR and RTS.
    pub const SET_CONTROL: u8 = 5;
    /// Line state notification.
    pub const NOTIFY_LINESTATE: u8 = 6;
    /// Modem state notification.
    pub const NOTIFY_MODEMSTATE: u8 = 7;
    /// Ask the sender to stop sending.
    pub const FLOWCONTROL_SUSPEND: u8 = 8;
    /// Ask the sender to resume.
    pub const FLOWCONTROL_RESUME: u8 = 9;
    /// Which line state changes to report.
    pub const SET_LINESTATE_MASK: u8 = 10;
    /// Which modem state changes to report.
    pub const SET_MODEMSTATE_MASK: u8 = 11;
    /// Purge buffers.
    pub const PURGE_DATA: u8 = 12;
    /// Offset added to a command code in the server's reply.
    pub const SERVER_OFFSET: u8 = 100;

    /// Modem state: carrier detect.
    pub const MODEMSTATE_CD: u8 = 0x80;
    /// Modem state: data set ready.
    pub const MODEMSTATE_DSR: u8 = 0x20;
    /// Modem state: clear to send.
    pub const MODEMSTATE_CTS: u8 = 0x10;
}

use self::cmd::{DO, DONT, IAC, SB, SE, WILL, WONT};
use self::option::{BINARY, COM_PORT, ECHO, SGA};

/// Longest subnegotiation payload kept. RFC 2217 payloads are a few bytes;
/// anything longer is skipped.
const MAX_SUBNEGOTIATION: usize = 64;

/// Which side of the connection this codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The bridge listener.
    Server,
    /// A client connecting to an RFC 2217 port.
    Client,
}

/// Virtual serial line settings negotiated over COM-PORT-OPTION.
///
/// These never affect real I/O timing; they are stored so queries can be
/// answered consistently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Line speed.
    pub baud_rate: u32,
    /// Data bits (5-8).
    pub data_size: u8,
    /// RFC 2217 parity code (1 = none).
    pub parity: u8,
    /// RFC 2217 stop-size code (1 = one stop bit).
    pub stop_size: u8,
    /// RFC 2217 flow-control code (1 = none).
    pub flow_control: u8,
    /// Break state code (6 = off).
    pub break_state: u8,
    /// DTR state code (8 = on).
    pub dtr: u8,
    /// RTS state code (11 = on).
    pub rts: u8,
    /// Line state report mask.
    pub linestate_mask: u8,
    /// Modem state report mask.
    pub modemstate_mask: u8,
    /// Last modem state reported by the server (client role).
    pub modem_state: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: crate::constants::DEFAULT_BAUD_RATE,
            data_size: 8,
            parity: 1,
            stop_size: 1,
            flow_control: 1,
            break_state: 6,
            dtr: 8,
            rts: 11,
            linestate_mask: 0,
            modemstate_mask: 0xFF,
            modem_state: 0,
        }
    }
}

/// Output of one [`TelnetCodec::decode`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Payload bytes with all telnet framing removed.
    pub data: Vec<u8>,
    /// Protocol bytes that must be sent back to the peer.
    pub reply: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// State of one side of one option.
#[derive(Debug, Clone, Copy, Default)]
struct OptionSide {
    enabled: bool,
    requested: bool,
}

/// Stateful telnet parser and option negotiator.
#[derive(Debug)]
pub struct TelnetCodec {
    role: Role,
    state: ParseState,
    /// Options this side performs, indexed by option code.
    local: [OptionSide; 256],
    /// Options the peer performs.
    remote: [OptionSide; 256],
    sub: Vec<u8>,
    /// The current subnegotiation outgrew [`MAX_SUBNEGOTIATION`] and is
    /// being skipped up to its IAC SE.
    sub_overflow: bool,
    settings: SerialSettings,
    modem_state_sent: bool,
}

impl TelnetCodec {
    /// Create a codec for the given role with default serial settings.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ParseState::Data,
            local: [OptionSide::default(); 256],
            remote: [OptionSide::default(); 256],
            sub: Vec::new(),
            sub_overflow: false,
            settings: SerialSettings::default(),
            modem_state_sent: false,
        }
    }

    /// Role this codec was created for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current virtual serial settings.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Whether COM-PORT-OPTION is active in either direction.
    pub fn com_port_active(&self) -> bool {
        self.local[usize::from(COM_PORT)].enabled || self.remote[usize::from(COM_PORT)].enabled
    }

    /// Option requests to send right after the connection opens.
    pub fn initial_negotiation(&mut self) -> Vec<u8> {
        let (local, remote): (&[u8], &[u8]) = match self.role {
            Role::Server => (&[ECHO, SGA, COM_PORT], &[BINARY]),
            Role::Client => (&[SGA, BINARY, COM_PORT], &[ECHO, SGA, BINARY]),
        };
        let mut out = Vec::new();
        for &opt in local {
            self.local[usize::from(opt)].requested = true;
            out.extend_from_slice(&[IAC, WILL, opt]);
        }
        for &opt in remote {
            self.remote[usize::from(opt)].requested = true;
            out.extend_from_slice(&[IAC, DO, opt]);
        }
        out
    }

    /// Strip telnet framing from `input`, handling any commands it contains.
    ///
    /// State carries across calls, so sequences split between reads are
    /// handled correctly.
    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut out = Decoded::default();
        for &byte in input {
            self.state = match self.state {
                ParseState::Data if byte == IAC => ParseState::Iac,
                ParseState::Data => {
                    out.data.push(byte);
                    ParseState::Data
                }
                ParseState::Iac => match byte {
                    IAC => {
                        out.data.push(IAC);
                        ParseState::Data
                    }
                    WILL | WONT | DO | DONT => ParseState::Negotiate(byte),
                    SB => {
                        self.sub.clear();
                        self.sub_overflow = false;
                        ParseState::Sub
                    }
                    // NOP, GA, AYT and friends carry no meaning for a serial stream.
                    _ => ParseState::Data,
                },
                ParseState::Negotiate(command) => {
                    self.negotiate(command, byte, &mut out.reply);
                    ParseState::Data
                }
                ParseState::Sub if byte == IAC => ParseState::SubIac,
                ParseState::Sub => {
                    self.push_sub(byte);
                    ParseState::Sub
                }
                ParseState::SubIac => match byte {
                    IAC => {
                        self.push_sub(IAC);
                        ParseState::Sub
                    }
                    SE if self.sub_overflow => {
                        self.sub_overflow = false;
                        ParseState::Data
                    }
                    SE => {
                        let payload = std::mem::take(&mut self.sub);
                        self.subnegotiation(&payload, &mut out.reply);
                        ParseState::Data
                    }
                    // Malformed; abandon the subnegotiation.
                    _ => ParseState::Data,
                },
            };
        }
        out
    }

    fn push_sub(&mut self, byte: u8) {
        if self.sub_overflow {
            return;
        }
        if self.sub.len() >= MAX_SUBNEGOTIATION {
            log::warn!("[Telnet] Subnegotiation longer than {MAX_SUBNEGOTIATION} bytes, discarding");
            self.sub = Vec::new();
            self.sub_overflow = true;
            return;
        }
        self.sub.push(byte);
    }

    fn supports_local(&self, opt: u8) -> bool {
        match self.role {
            Role::Server => matches!(opt, ECHO | SGA | BINARY | COM_PORT),
            Role::Client => matches!(opt, SGA | BINARY | COM_PORT),
        }
    }

    fn supports_remote(&self, opt: u8) -> bool {
        match self.role {
            Role::Server => matches!(opt, SGA | BINARY | COM_PORT),
            Role::Client => matches!(opt, ECHO | SGA | BINARY | COM_PORT),
        }
    }

    fn negotiate(&mut self, command: u8, opt: u8, reply: &mut Vec<u8>) {
        let idx = usize::from(opt);
        match command {
            DO => {
                let supported = self.supports_local(opt);
                let side = &mut self.local[idx];
                if side.requested {
                    side.requested = false;
                    side.enabled = supported;
                } else if !side.enabled {
                    if supported {
                        side.enabled = true;
                        reply.extend_from_slice(&[IAC, WILL, opt]);
                    } else {
                        reply.extend_from_slice(&[IAC, WONT, opt]);
                    }
                }
            }
            DONT => {
                let side = &mut self.local[idx];
                let was_enabled = side.enabled && !side.requested;
                side.requested = false;
                side.enabled = false;
                if was_enabled {
                    reply.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            WILL => {
                let supported = self.supports_remote(opt);
                let side = &mut self.remote[idx];
                if side.requested {
                    side.requested = false;
                    side.enabled = supported;
                } else if !side.enabled {
                    if supported {
                        side.enabled = true;
                        reply.extend_from_slice(&[IAC, DO, opt]);
                    } else {
                        reply.extend_from_slice(&[IAC, DONT, opt]);
                    }
                }
            }
            WONT => {
                let side = &mut self.remote[idx];
                let was_enabled = side.enabled && !side.requested;
                side.requested = false;
                side.enabled = false;
                if was_enabled {
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                }
            }
            _ => {}
        }
        log::trace!(
            "[Telnet] {} {} -> local={} remote={}",
            command_name(command),
            opt,
            self.local[idx].enabled,
            self.remote[idx].enabled
        );

        if opt == COM_PORT
            && self.role == Role::Server
            && self.com_port_active()
            && !self.modem_state_sent
        {
            // Report the lines a real adapter would show as asserted.
            self.modem_state_sent = true;
            let state = com_port::MODEMSTATE_CD | com_port::MODEMSTATE_DSR | com_port::MODEMSTATE_CTS;
            write_subnegotiation(
                reply,
                com_port::NOTIFY_MODEMSTATE + com_port::SERVER_OFFSET,
                &[state],
            );
            log::debug!("[Telnet] COM-PORT-OPTION enabled");
        }
    }

    fn subnegotiation(&mut self, payload: &[u8], reply: &mut Vec<u8>) {
        let [opt, command, value @ ..] = payload else {
            return;
        };
        if *opt != COM_PORT {
            log::trace!("[Telnet] ignoring subnegotiation for option {opt}");
            return;
        }
        match self.role {
            Role::Server => self.server_com_port(*command, value, reply),
            Role::Client => self.client_com_port(*command, value),
        }
    }

    fn server_com_port(&mut self, command: u8, value: &[u8], reply: &mut Vec<u8>) {
        use self::com_port as cp;

        let answer = command.wrapping_add(cp::SERVER_OFFSET);
        let first = value.first().copied().unwrap_or(0);
        let settings = &mut self.settings;
        match command {
            cp::SIGNATURE => {
                if value.is_empty() {
                    let signature = concat!("replbridge ", env!("CARGO_PKG_VERSION"));
                    write_subnegotiation(reply, answer, signature.as_bytes());
                } else {
                    log::debug!("[Telnet] client signature: {}", String::from_utf8_lossy(value));
                }
            }
            cp::SET_BAUDRATE => {
                if let Ok(bytes) = <[u8; 4]>::try_from(value) {
                    let requested = u32::from_be_bytes(bytes);
                    if requested != 0 {
                        log::debug!("[Telnet] baud rate set to {requested}");
                        settings.baud_rate = requested;
                    }
                }
                write_subnegotiation(reply, answer, &settings.baud_rate.to_be_bytes());
            }
            cp::SET_DATASIZE => {
                store_or_query(&mut settings.data_size, first);
                write_subnegotiation(reply, answer, &[settings.data_size]);
            }
            cp::SET_PARITY => {
                store_or_query(&mut settings.parity, first);
                write_subnegotiation(reply, answer, &[settings.parity]);
            }
            cp::SET_STOPSIZE => {
                store_or_query(&mut settings.stop_size, first);
                write_subnegotiation(reply, answer, &[settings.stop_size]);
            }
            cp::SET_CONTROL => {
                let current = match first {
                    0 => settings.flow_control,
                    1..=3 | 13..=19 => {
                        settings.flow_control = first;
                        first
                    }
                    4 => settings.break_state,
                    5 | 6 => {
                        settings.break_state = first;
                        first
                    }
                    7 => settings.dtr,
                    8 | 9 => {
                        settings.dtr = first;
                        first
                    }
                    10 => settings.rts,
                    11 | 12 => {
                        settings.rts = first;
                        first
                    }
                    other => other,
                };
                write_subnegotiation(reply, answer, &[current]);
            }
            cp::SET_LINESTATE_MASK => {
                settings.linestate_mask = first;
                write_subnegotiation(reply, answer, &[first]);
            }
            cp::SET_MODEMSTATE_MASK => {
                settings.modemstate_mask = first;
                write_subnegotiation(reply, answer, &[first]);
            }
            cp::PURGE_DATA => write_subnegotiation(reply, answer, &[first]),
            cp::FLOWCONTROL_SUSPEND | cp::FLOWCONTROL_RESUME => {
                log::trace!("[Telnet] flow control request {command} accepted");
            }
            other => log::debug!("[Telnet] unknown COM-PORT command {other}"),
        }
    }

    fn client_com_port(&mut self, command: u8, value: &[u8]) {
        use self::com_port as cp;

        let Some(base) = command.checked_sub(cp::SERVER_OFFSET) else {
            return;
        };
        let first = value.first().copied().unwrap_or(0);
        let settings = &mut self.settings;
        match base {
            cp::SET_BAUDRATE => {
                if let Ok(bytes) = <[u8; 4]>::try_from(value) {
                    settings.baud_rate = u32::from_be_bytes(bytes);
                }
            }
            cp::SET_DATASIZE => settings.data_size = first,
            cp::SET_PARITY => settings.parity = first,
            cp::SET_STOPSIZE => settings.stop_size = first,
            cp::NOTIFY_MODEMSTATE => settings.modem_state = first,
            _ => {}
        }
    }
}

/// Double every `0xFF` so the peer reads it as data.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let extra = data.iter().filter(|&&b| b == IAC).count();
    if extra == 0 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + extra);
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

fn store_or_query(slot: &mut u8, value: u8) {
    if value != 0 {
        *slot = value;
    }
}

fn write_subnegotiation(out: &mut Vec<u8>, command: u8, value: &[u8]) {
    out.extend_from_slice(&[IAC, SB, COM_PORT, command]);
    out.extend_from_slice(&escape(value));
    out.extend_from_slice(&[IAC, SE]);
}

fn command_name(command: u8) -> &'static str {
    match command {
        DO => "DO",
        DONT => "DONT",
        WILL => "WILL",
        WONT => "WONT",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::com_port as cp;
    use super::*;

    fn sb(command: u8, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_subnegotiation(&mut out, command, value);
        out
    }

    #[test]
    fn test_plain_data_passes_through() {
        let mut codec = TelnetCodec::new(Role::Server);
        let decoded = codec.decode(b"print('hi')\r\n");
        assert_eq!(decoded.data, b"print('hi')\r\n");
        assert!(decoded.reply.is_empty());
    }

    #[test]
    fn test_escaped_iac_is_literal() {
        let mut codec = TelnetCodec::new(Role::Server);
        let decoded = codec.decode(&[b'a', IAC, IAC, b'b']);
        assert_eq!(decoded.data, vec![b'a', 0xFF, b'b']);
    }

    #[test]
    fn test_iac_split_across_reads() {
        let mut codec = TelnetCodec::new(Role::Client);
        let first = codec.decode(&[b'x', IAC]);
        let second = codec.decode(&[IAC, b'y']);
        assert_eq!(first.data, b"x");
        assert_eq!(second.data, vec![0xFF, b'y']);
    }

    #[test]
    fn test_escape_doubles_iac() {
        assert_eq!(escape(&[1, 0xFF, 2]), vec![1, 0xFF, 0xFF, 2]);
        assert_eq!(escape(b"plain"), b"plain");
    }

    #[test]
    fn test_escape_then_decode_reconstructs() {
        let original: Vec<u8> = (0..=255).collect();
        let mut codec = TelnetCodec::new(Role::Client);
        assert_eq!(codec.decode(&escape(&original)).data, original);
    }

    #[test]
    fn test_server_initial_negotiation() {
        let mut codec = TelnetCodec::new(Role::Server);
        let init = codec.initial_negotiation();
        assert_eq!(
            init,
            vec![IAC, WILL, ECHO, IAC, WILL, SGA, IAC, WILL, COM_PORT, IAC, DO, BINARY]
        );
    }

    #[test]
    fn test_acknowledgement_is_not_answered() {
        let mut codec = TelnetCodec::new(Role::Server);
        codec.initial_negotiation();
        let decoded = codec.decode(&[IAC, DO, ECHO, IAC, DO, SGA, IAC, WILL, BINARY]);
        assert!(decoded.reply.is_empty(), "acks must not be answered: {:?}", decoded.reply);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_unsolicited_request_answered_once() {
        let mut codec = TelnetCodec::new(Role::Server);
        let first = codec.decode(&[IAC, WILL, SGA]);
        assert_eq!(first.reply, vec![IAC, DO, SGA]);
        let second = codec.decode(&[IAC, WILL, SGA]);
        assert!(second.reply.is_empty());
    }

    #[test]
    fn test_unsupported_option_refused() {
        let mut codec = TelnetCodec::new(Role::Server);
        // Terminal type (24) and NAWS (31).
        let decoded = codec.decode(&[IAC, DO, 24, IAC, WILL, 31]);
        assert_eq!(decoded.reply, vec![IAC, WONT, 24, IAC, DONT, 31]);
    }

    #[test]
    fn test_com_port_agreement_notifies_modem_state() {
        let mut codec = TelnetCodec::new(Role::Server);
        codec.initial_negotiation();
        let decoded = codec.decode(&[IAC, DO, COM_PORT]);
        assert!(codec.com_port_active());
        assert_eq!(decoded.reply, sb(cp::NOTIFY_MODEMSTATE + cp::SERVER_OFFSET, &[0xB0]));

        // Only once, even if the client also offers the option.
        let again = codec.decode(&[IAC, WILL, COM_PORT]);
        assert_eq!(again.reply, vec![IAC, DO, COM_PORT]);
    }

    #[test]
    fn test_set_baudrate_and_query() {
        let mut codec = TelnetCodec::new(Role::Server);
        let mut request = vec![IAC, SB, COM_PORT, cp::SET_BAUDRATE];
        request.extend_from_slice(&9600u32.to_be_bytes());
        request.extend_from_slice(&[IAC, SE]);
        let decoded = codec.decode(&request);
        assert_eq!(decoded.reply, sb(101, &9600u32.to_be_bytes()));
        assert_eq!(codec.settings().baud_rate, 9600);

        let query = codec.decode(&[IAC, SB, COM_PORT, cp::SET_BAUDRATE, 0, 0, 0, 0, IAC, SE]);
        assert_eq!(query.reply, sb(101, &9600u32.to_be_bytes()));
    }

    #[test]
    #[rustfmt::skip]
    fn test_line_settings_echoed() {
        let mut codec = TelnetCodec::new(Role::Server);
        let decoded = codec.decode(&[
            IAC, SB, COM_PORT, cp::SET_DATASIZE, 7, IAC, SE,
            IAC, SB, COM_PORT, cp::SET_PARITY, 0, IAC, SE,
            IAC, SB, COM_PORT, cp::SET_CONTROL, 9, IAC, SE,
            IAC, SB, COM_PORT, cp::PURGE_DATA, 3, IAC, SE,
        ]);
        let mut expected = sb(102, &[7]);
        expected.extend(sb(103, &[1]));
        expected.extend(sb(105, &[9]));
        expected.extend(sb(112, &[3]));
        assert_eq!(decoded.reply, expected);
        assert_eq!(codec.settings().dtr, 9);
    }

    #[test]
    fn test_flow_control_suspend_is_silent() {
        let mut codec = TelnetCodec::new(Role::Server);
        let decoded = codec.decode(&[IAC, SB, COM_PORT, cp::FLOWCONTROL_SUSPEND, IAC, SE, b'z']);
        assert!(decoded.reply.is_empty());
        assert_eq!(decoded.data, b"z");
    }

    #[test]
    fn test_client_records_server_reports() {
        let mut codec = TelnetCodec::new(Role::Client);
        let mut report = sb(101, &57_600u32.to_be_bytes());
        report.extend(sb(107, &[0xB0]));
        let decoded = codec.decode(&report);
        assert!(decoded.reply.is_empty());
        assert_eq!(codec.settings().baud_rate, 57_600);
        assert_eq!(codec.settings().modem_state, 0xB0);
    }

    #[test]
    fn test_subnegotiation_value_with_iac_is_escaped() {
        let mut codec = TelnetCodec::new(Role::Server);
        let baud = 0x0001_C2FFu32;
        let mut request = vec![IAC, SB, COM_PORT, cp::SET_BAUDRATE];
        request.extend(escape(&baud.to_be_bytes()));
        request.extend_from_slice(&[IAC, SE]);
        codec.decode(&request);
        assert_eq!(codec.settings().baud_rate, baud);
    }

    #[test]
    fn test_oversized_subnegotiation_is_bounded() {
        let mut codec = TelnetCodec::new(Role::Server);
        let mut input = vec![IAC, SB, COM_PORT, cp::SIGNATURE];
        input.extend(vec![b'x'; 10_000]);
        let decoded = codec.decode(&input);
        assert!(decoded.data.is_empty());
        assert!(codec.sub.len() <= MAX_SUBNEGOTIATION);

        // Still inside the subnegotiation: more bytes do not grow the buffer.
        codec.decode(&[b'y'; 1000]);
        assert!(codec.sub.len() <= MAX_SUBNEGOTIATION);

        // The skipped subnegotiation gets no reply; data after it flows.
        let decoded = codec.decode(&[IAC, SE, b'o', b'k']);
        assert_eq!(decoded.data, b"ok");
        assert!(decoded.reply.is_empty());

        // A normal subnegotiation afterwards is handled again.
        let decoded = codec.decode(&sb(cp::SET_DATASIZE, &[0]));
        assert_eq!(decoded.reply, sb(cp::SET_DATASIZE + cp::SERVER_OFFSET, &[8]));
    }
}
