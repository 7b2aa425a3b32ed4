// Art-Net 4 wire codec
// Art-Net 4 Protocol: https://art-net.org.uk/
//
// Every packet starts with the 8-byte identifier, a little-endian OpCode
// and (except ArtPollReply) a big-endian protocol revision whose low byte
// must be 14. Field layouts are written out byte by byte; nothing here
// relies on struct layout.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::host::TimeCode;
use crate::rdm::{TOD_BLOCK_SIZE, UID_SIZE};

/// Art-Net packet header (first 8 bytes)
pub const ARTNET_HEADER: &[u8] = b"Art-Net\0";
pub const ARTNET_PORT: u16 = 6454;
pub const PROTOCOL_REVISION: u8 = 14;

pub const SHORT_NAME_LENGTH: usize = 18;
pub const LONG_NAME_LENGTH: usize = 64;
pub const REPORT_LENGTH: usize = 64;

/// Fixed encoded sizes
pub const POLL_SIZE: usize = 18;
pub const POLL_REPLY_SIZE: usize = 239;
/// Classic replies end at the MAC field; everything after is optional
pub const POLL_REPLY_MIN_SIZE: usize = 207;
pub const SYNC_SIZE: usize = 14;
pub const ADDRESS_SIZE: usize = 107;
pub const INPUT_SIZE: usize = 20;
pub const TIME_CODE_SIZE: usize = 19;
pub const TOD_REQUEST_SIZE: usize = 56;
pub const TOD_CONTROL_SIZE: usize = 24;
pub const TOD_DATA_HEADER_SIZE: usize = 28;
pub const RDM_HEADER_SIZE: usize = 24;
pub const TRIGGER_HEADER_SIZE: usize = 18;
pub const IP_PROG_SIZE: usize = 30;
pub const IP_PROG_REPLY_SIZE: usize = 34;
pub const DMX_HEADER_SIZE: usize = 18;

/// Protocol timing (Art-Net 4 specification values)
pub const MERGE_TIMEOUT_MILLIS: u32 = 10_000;
pub const NETWORK_DATA_LOSS_TIMEOUT_MILLIS: u32 = 10_000;
pub const POLL_INTERVAL_MILLIS: u32 = 8_000;
pub const SYNC_TIMEOUT_MILLIS: u32 = 4_000;

/// Art-Net OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    Poll = 0x2000,
    PollReply = 0x2100,
    DiagData = 0x2300,
    Dmx = 0x5000,
    Sync = 0x5200,
    Address = 0x6000,
    Input = 0x7000,
    TodRequest = 0x8000,
    TodData = 0x8100,
    TodControl = 0x8200,
    Rdm = 0x8300,
    RdmSub = 0x8400,
    TimeCode = 0x9700,
    TimeSync = 0x9800,
    Trigger = 0x9900,
    Directory = 0x9a00,
    IpProg = 0xf800,
    IpProgReply = 0xf900,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Option<OpCode> {
        Some(match value {
            0x2000 => OpCode::Poll,
            0x2100 => OpCode::PollReply,
            0x2300 => OpCode::DiagData,
            0x5000 => OpCode::Dmx,
            0x5200 => OpCode::Sync,
            0x6000 => OpCode::Address,
            0x7000 => OpCode::Input,
            0x8000 => OpCode::TodRequest,
            0x8100 => OpCode::TodData,
            0x8200 => OpCode::TodControl,
            0x8300 => OpCode::Rdm,
            0x8400 => OpCode::RdmSub,
            0x9700 => OpCode::TimeCode,
            0x9800 => OpCode::TimeSync,
            0x9900 => OpCode::Trigger,
            0x9a00 => OpCode::Directory,
            0xf800 => OpCode::IpProg,
            0xf900 => OpCode::IpProgReply,
            _ => return None,
        })
    }
}

/// Why a datagram was dropped at the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    Truncated,
    BadIdentifier,
    BadProtocolRevision,
    UnknownOpCode(u16),
}

/// ArtPoll flags
pub mod poll_flags {
    /// Node sends ArtPollReply unsolicited when its state changes
    pub const SEND_REPLY_ON_CHANGE: u8 = 1 << 1;
    /// Send diagnostics messages to this controller
    pub const SEND_DIAG_MESSAGES: u8 = 1 << 2;
    /// Diagnostics unicast instead of broadcast
    pub const SEND_DIAG_UNICAST: u8 = 1 << 3;
    /// Only reply when a Port-Address falls in the target range
    pub const USE_TARGET_PORT_ADDRESS: u8 = 1 << 5;
}

/// Diagnostics priority codes
pub mod diag_priority {
    pub const LOW: u8 = 0x10;
    pub const MED: u8 = 0x40;
    pub const HIGH: u8 = 0x80;
    pub const CRITICAL: u8 = 0xe0;
    pub const VOLATILE: u8 = 0xf0;
}

/// PortTypes bits in ArtPollReply
pub mod port_type {
    pub const OUTPUT_ARTNET: u8 = 0x80;
    pub const INPUT_ARTNET: u8 = 0x40;
    pub const PROTOCOL_DMX: u8 = 0x00;
}

/// GoodOutput (A) bits in ArtPollReply
pub mod good_output {
    pub const DATA_IS_BEING_TRANSMITTED: u8 = 1 << 7;
    pub const OUTPUT_IS_MERGING: u8 = 1 << 3;
    pub const MERGE_MODE_LTP: u8 = 1 << 1;
    pub const OUTPUT_IS_SACN: u8 = 1 << 0;
}

/// GoodOutputB bits in ArtPollReply
pub mod good_output_b {
    pub const RDM_DISABLED: u8 = 1 << 7;
    pub const STYLE_CONSTANT: u8 = 1 << 6;
    pub const DISCOVERY_NOT_RUNNING: u8 = 1 << 5;
    pub const DISCOVERY_DISABLED: u8 = 1 << 4;
}

/// GoodInput bits in ArtPollReply
pub mod good_input {
    pub const DATA_RECEIVED: u8 = 1 << 7;
    pub const DISABLED: u8 = 1 << 3;
    pub const ERRORS: u8 = 1 << 2;
}

/// Status1 bits
pub mod status1 {
    pub const INDICATOR_MASK: u8 = 3 << 6;
    pub const INDICATOR_LOCATE_MODE: u8 = 1 << 6;
    pub const INDICATOR_MUTE_MODE: u8 = 2 << 6;
    pub const INDICATOR_NORMAL_MODE: u8 = 3 << 6;
    pub const PAP_NETWORK: u8 = 2 << 4;
    pub const RDM_CAPABLE: u8 = 1 << 1;
}

/// Status2 bits
pub mod status2 {
    pub const WEB_BROWSER_SUPPORT: u8 = 1 << 0;
    pub const IP_DHCP: u8 = 1 << 1;
    pub const DHCP_CAPABLE: u8 = 1 << 2;
    pub const PORT_ADDRESS_15BIT: u8 = 1 << 3;
    pub const SACN_ABLE_TO_SWITCH: u8 = 1 << 4;
    pub const OUTPUT_STYLE_SWITCH: u8 = 1 << 6;
    pub const RDM_SWITCH: u8 = 1 << 7;
}

/// Status3 bits
pub mod status3 {
    pub const NETWORKLOSS_MASK: u8 = 3 << 6;
    pub const NETWORKLOSS_LAST_STATE: u8 = 0 << 6;
    pub const NETWORKLOSS_OFF_STATE: u8 = 1 << 6;
    pub const NETWORKLOSS_ON_STATE: u8 = 2 << 6;
    pub const NETWORKLOSS_PLAYBACK: u8 = 3 << 6;
    pub const FAILSAFE_CONTROL: u8 = 1 << 5;
    pub const OUTPUT_SWITCH: u8 = 1 << 3;
}

/// ArtAddress port commands
pub mod port_command {
    pub const NONE: u8 = 0x00;
    pub const CANCEL: u8 = 0x01;
    pub const LED_NORMAL: u8 = 0x02;
    pub const LED_MUTE: u8 = 0x03;
    pub const LED_LOCATE: u8 = 0x04;
    pub const RESET: u8 = 0x05;
    pub const FAIL_HOLD: u8 = 0x08;
    pub const FAIL_ZERO: u8 = 0x09;
    pub const FAIL_FULL: u8 = 0x0a;
    pub const FAIL_SCENE: u8 = 0x0b;
    pub const FAIL_RECORD: u8 = 0x0c;
    /// 0x10..=0x13: merge LTP on port 0..=3
    pub const MERGE_LTP_BASE: u8 = 0x10;
    /// 0x50..=0x53: merge HTP on port 0..=3
    pub const MERGE_HTP_BASE: u8 = 0x50;
    /// 0x60..=0x63: output Art-Net on port 0..=3
    pub const ARTNET_SEL_BASE: u8 = 0x60;
    /// 0x70..=0x73: output sACN on port 0..=3
    pub const ACN_SEL_BASE: u8 = 0x70;
    /// 0x90..=0x93: clear the output buffer of port 0..=3
    pub const CLEAR_BASE: u8 = 0x90;
    /// 0xa0..=0xa3: delta output style on port 0..=3
    pub const STYLE_DELTA_BASE: u8 = 0xa0;
    /// 0xb0..=0xb3: constant output style on port 0..=3
    pub const STYLE_CONSTANT_BASE: u8 = 0xb0;
    /// 0xc0..=0xc3: enable RDM on port 0..=3
    pub const RDM_ENABLE_BASE: u8 = 0xc0;
    /// 0xd0..=0xd3: disable RDM on port 0..=3
    pub const RDM_DISABLE_BASE: u8 = 0xd0;
}

/// ArtTodControl commands
pub mod tod_control {
    pub const NONE: u8 = 0x00;
    pub const FLUSH: u8 = 0x01;
}

/// ArtIpProg command bits
pub mod ip_prog_command {
    pub const ENABLE_PROGRAMMING: u8 = 1 << 7;
    pub const ENABLE_DHCP: u8 = 1 << 6;
    pub const PROGRAM_GATEWAY: u8 = 1 << 4;
    pub const SET_DEFAULT: u8 = 1 << 3;
    pub const PROGRAM_IP: u8 = 1 << 2;
    pub const PROGRAM_NETMASK: u8 = 1 << 1;
    pub const PROGRAM_PORT: u8 = 1 << 0;
}

/// Node style codes
pub mod style {
    pub const NODE: u8 = 0x00;
    pub const SERVER: u8 = 0x01;
}

/// Node report codes (the `#xxxx` prefix of the NodeReport text)
pub mod report_code {
    pub const POWER_OK: u16 = 0x0001;
    pub const PARSE_FAIL: u16 = 0x0004;
    pub const SHORT_NAME_OK: u16 = 0x0006;
    pub const LONG_NAME_OK: u16 = 0x0007;
}

/// ArtPoll: a controller asking the network to identify itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtPoll {
    pub flags: u8,
    pub diag_priority: u8,
    pub target_top: u16,
    pub target_bottom: u16,
}

/// ArtPollReply: one bound index's worth of node status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtPollReply {
    pub ip_address: [u8; 4],
    pub port: u16,
    pub version_info: u16,
    pub net_switch: u8,
    pub sub_switch: u8,
    pub oem: u16,
    pub ubea_version: u8,
    pub status1: u8,
    pub esta_manufacturer: u16,
    pub short_name: String,
    pub long_name: String,
    pub node_report: String,
    pub num_ports: u16,
    pub port_types: [u8; 4],
    pub good_input: [u8; 4],
    pub good_output: [u8; 4],
    pub sw_in: [u8; 4],
    pub sw_out: [u8; 4],
    pub acn_priority: u8,
    pub sw_macro: u8,
    pub sw_remote: u8,
    pub style: u8,
    pub mac_address: [u8; 6],
    pub bind_ip: [u8; 4],
    pub bind_index: u8,
    pub status2: u8,
    pub good_output_b: [u8; 4],
    pub status3: u8,
    pub default_uid_responder: [u8; 6],
    pub user: u16,
    pub refresh_rate: u16,
    pub background_queue_policy: u8,
}

impl Default for ArtPollReply {
    fn default() -> Self {
        Self {
            ip_address: [0; 4],
            port: ARTNET_PORT,
            version_info: 0,
            net_switch: 0,
            sub_switch: 0,
            oem: 0,
            ubea_version: 0,
            status1: 0,
            esta_manufacturer: 0,
            short_name: String::new(),
            long_name: String::new(),
            node_report: String::new(),
            num_ports: 0,
            port_types: [0; 4],
            good_input: [0; 4],
            good_output: [0; 4],
            sw_in: [0; 4],
            sw_out: [0; 4],
            acn_priority: 0,
            sw_macro: 0,
            sw_remote: 0,
            style: style::NODE,
            mac_address: [0; 6],
            bind_ip: [0; 4],
            bind_index: 0,
            status2: 0,
            good_output_b: [0; 4],
            status3: 0,
            default_uid_responder: [0; 6],
            user: 0,
            refresh_rate: 0,
            background_queue_policy: 0,
        }
    }
}

/// ArtDmx: one universe of zero-start-code DMX512 data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtDmx {
    pub sequence: u8,
    pub physical: u8,
    /// The 15-bit Port-Address (SubUni low byte, Net high byte)
    pub port_address: u16,
    pub data: Vec<u8>,
}

/// ArtDiagData: a diagnostics text message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtDiagData {
    pub priority: u8,
    pub text: String,
}

/// ArtAddress: remote programming of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtAddress {
    pub net_switch: u8,
    pub bind_index: u8,
    pub short_name: String,
    pub long_name: String,
    pub sw_in: [u8; 4],
    pub sw_out: [u8; 4],
    pub sub_switch: u8,
    pub command: u8,
}

/// ArtInput: controller enable/disable of DMX inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtInput {
    pub bind_index: u8,
    pub num_ports: u16,
    /// Bit 0 set disables the input
    pub input: [u8; 4],
}

/// ArtTodRequest: ask output gateways for their table of devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtTodRequest {
    pub net: u8,
    pub command: u8,
    /// Low bytes of the Port-Addresses that must respond (max 32)
    pub addresses: Vec<u8>,
}

/// ArtTodControl: RDM discovery control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtTodControl {
    pub net: u8,
    pub command: u8,
    pub address: u8,
}

/// ArtTodData: a block of the table of devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtTodData {
    pub rdm_version: u8,
    pub port: u8,
    pub bind_index: u8,
    pub net: u8,
    pub command_response: u8,
    pub address: u8,
    pub uid_total: u16,
    pub block_count: u8,
    pub uids: Vec<[u8; UID_SIZE]>,
}

/// ArtRdm: a non-discovery RDM message in transit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtRdm {
    pub rdm_version: u8,
    pub net: u8,
    pub command: u8,
    pub address: u8,
    pub data: Vec<u8>,
}

/// ArtTrigger: a macro trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtTrigger {
    pub oem: u16,
    pub key: u8,
    pub sub_key: u8,
    pub payload: Vec<u8>,
}

/// ArtIpProg: reprogram the node's IP configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtIpProg {
    pub command: u8,
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub port: u16,
    pub gateway: [u8; 4],
}

/// ArtIpProgReply: the node's IP configuration after programming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtIpProgReply {
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub port: u16,
    /// Bit 6 set = DHCP enabled
    pub status: u8,
    pub gateway: [u8; 4],
}

/// Result of classifying an Art-Net datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtPacket {
    Poll(ArtPoll),
    PollReply(Box<ArtPollReply>),
    DiagData(ArtDiagData),
    Dmx(ArtDmx),
    Sync,
    Address(Box<ArtAddress>),
    Input(ArtInput),
    TimeCode(TimeCode),
    TimeSync,
    TodRequest(ArtTodRequest),
    TodData(Box<ArtTodData>),
    TodControl(ArtTodControl),
    Rdm(ArtRdm),
    RdmSub,
    Trigger(Box<ArtTrigger>),
    Directory,
    IpProg(ArtIpProg),
    IpProgReply(ArtIpProgReply),
}

/// Classify an Art-Net datagram into a typed packet.
pub fn classify(data: &[u8]) -> Result<ArtPacket, Discard> {
    if data.len() < 12 {
        return Err(Discard::Truncated);
    }

    if &data[0..8] != ARTNET_HEADER {
        return Err(Discard::BadIdentifier);
    }

    let opcode = u16::from_le_bytes([data[8], data[9]]);
    let opcode = OpCode::from_u16(opcode).ok_or(Discard::UnknownOpCode(opcode))?;

    // ArtPollReply predates the revision field; bytes 10..14 carry its IP
    if opcode != OpCode::PollReply && (data[10] != 0 || data[11] != PROTOCOL_REVISION) {
        return Err(Discard::BadProtocolRevision);
    }

    Ok(match opcode {
        OpCode::Poll => ArtPacket::Poll(parse_poll(data)?),
        OpCode::PollReply => ArtPacket::PollReply(Box::new(parse_poll_reply(data)?)),
        OpCode::DiagData => ArtPacket::DiagData(parse_diag_data(data)?),
        OpCode::Dmx => ArtPacket::Dmx(parse_dmx(data)?),
        OpCode::Sync => ArtPacket::Sync,
        OpCode::Address => ArtPacket::Address(Box::new(parse_address(data)?)),
        OpCode::Input => ArtPacket::Input(parse_input(data)?),
        OpCode::TimeCode => ArtPacket::TimeCode(parse_time_code(data)?),
        OpCode::TimeSync => ArtPacket::TimeSync,
        OpCode::TodRequest => ArtPacket::TodRequest(parse_tod_request(data)?),
        OpCode::TodData => ArtPacket::TodData(Box::new(parse_tod_data(data)?)),
        OpCode::TodControl => ArtPacket::TodControl(parse_tod_control(data)?),
        OpCode::Rdm => ArtPacket::Rdm(parse_rdm(data)?),
        OpCode::RdmSub => ArtPacket::RdmSub,
        OpCode::Trigger => ArtPacket::Trigger(Box::new(parse_trigger(data)?)),
        OpCode::Directory => ArtPacket::Directory,
        OpCode::IpProg => ArtPacket::IpProg(parse_ip_prog(data)?),
        OpCode::IpProgReply => ArtPacket::IpProgReply(parse_ip_prog_reply(data)?),
    })
}

fn write_header(buf: &mut Vec<u8>, opcode: OpCode) {
    buf.extend_from_slice(ARTNET_HEADER);
    buf.extend_from_slice(&(opcode as u16).to_le_bytes());
    buf.push(0x00);
    buf.push(PROTOCOL_REVISION);
}

fn write_string(buf: &mut Vec<u8>, value: &str, length: usize) {
    let bytes = value.as_bytes();
    // Leave room for the terminating NUL
    let used = bytes.len().min(length - 1);
    buf.extend_from_slice(&bytes[..used]);
    buf.resize(buf.len() + (length - used), 0);
}

/// Extract a null-terminated string from bytes
fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

impl ArtPoll {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POLL_SIZE);
        write_header(&mut buf, OpCode::Poll);
        buf.push(self.flags);
        buf.push(self.diag_priority);
        buf.extend_from_slice(&self.target_top.to_be_bytes());
        buf.extend_from_slice(&self.target_bottom.to_be_bytes());
        buf
    }
}

fn parse_poll(data: &[u8]) -> Result<ArtPoll, Discard> {
    if data.len() < 14 {
        return Err(Discard::Truncated);
    }

    let mut poll = ArtPoll {
        flags: data[12],
        diag_priority: data[13],
        ..ArtPoll::default()
    };

    // The target range fields are only present in Art-Net 4 polls
    if data.len() >= POLL_SIZE {
        poll.target_top = u16::from_be_bytes([data[14], data[15]]);
        poll.target_bottom = u16::from_be_bytes([data[16], data[17]]);
    }

    Ok(poll)
}

impl ArtPollReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POLL_REPLY_SIZE);
        buf.extend_from_slice(ARTNET_HEADER);
        buf.extend_from_slice(&(OpCode::PollReply as u16).to_le_bytes());
        buf.extend_from_slice(&self.ip_address);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.extend_from_slice(&self.version_info.to_be_bytes());
        buf.push(self.net_switch);
        buf.push(self.sub_switch);
        buf.extend_from_slice(&self.oem.to_be_bytes());
        buf.push(self.ubea_version);
        buf.push(self.status1);
        buf.extend_from_slice(&self.esta_manufacturer.to_le_bytes());
        write_string(&mut buf, &self.short_name, SHORT_NAME_LENGTH);
        write_string(&mut buf, &self.long_name, LONG_NAME_LENGTH);
        write_string(&mut buf, &self.node_report, REPORT_LENGTH);
        buf.extend_from_slice(&self.num_ports.to_be_bytes());
        buf.extend_from_slice(&self.port_types);
        buf.extend_from_slice(&self.good_input);
        buf.extend_from_slice(&self.good_output);
        buf.extend_from_slice(&self.sw_in);
        buf.extend_from_slice(&self.sw_out);
        buf.push(self.acn_priority);
        buf.push(self.sw_macro);
        buf.push(self.sw_remote);
        buf.extend_from_slice(&[0; 3]); // spare
        buf.push(self.style);
        buf.extend_from_slice(&self.mac_address);
        buf.extend_from_slice(&self.bind_ip);
        buf.push(self.bind_index);
        buf.push(self.status2);
        buf.extend_from_slice(&self.good_output_b);
        buf.push(self.status3);
        buf.extend_from_slice(&self.default_uid_responder);
        buf.extend_from_slice(&self.user.to_be_bytes());
        buf.extend_from_slice(&self.refresh_rate.to_be_bytes());
        buf.push(self.background_queue_policy);
        buf.extend_from_slice(&[0; 10]); // filler
        debug_assert_eq!(buf.len(), POLL_REPLY_SIZE);
        buf
    }
}

fn parse_poll_reply(data: &[u8]) -> Result<ArtPollReply, Discard> {
    if data.len() < POLL_REPLY_MIN_SIZE {
        return Err(Discard::Truncated);
    }

    let mut reply = ArtPollReply {
        port: u16::from_le_bytes([data[14], data[15]]),
        version_info: u16::from_be_bytes([data[16], data[17]]),
        net_switch: data[18],
        sub_switch: data[19],
        oem: u16::from_be_bytes([data[20], data[21]]),
        ubea_version: data[22],
        status1: data[23],
        esta_manufacturer: u16::from_le_bytes([data[24], data[25]]),
        short_name: extract_string(&data[26..44]),
        long_name: extract_string(&data[44..108]),
        node_report: extract_string(&data[108..172]),
        num_ports: u16::from_be_bytes([data[172], data[173]]),
        acn_priority: data[194],
        sw_macro: data[195],
        sw_remote: data[196],
        style: data[200],
        ..ArtPollReply::default()
    };

    reply.ip_address.copy_from_slice(&data[10..14]);
    reply.port_types.copy_from_slice(&data[174..178]);
    reply.good_input.copy_from_slice(&data[178..182]);
    reply.good_output.copy_from_slice(&data[182..186]);
    reply.sw_in.copy_from_slice(&data[186..190]);
    reply.sw_out.copy_from_slice(&data[190..194]);
    reply.mac_address.copy_from_slice(&data[201..207]);

    // Art-Net 4 tail, zero when the sender speaks the classic dialect
    if data.len() >= 211 {
        reply.bind_ip.copy_from_slice(&data[207..211]);
    }
    if data.len() > 211 {
        reply.bind_index = data[211];
    }
    if data.len() > 212 {
        reply.status2 = data[212];
    }
    if data.len() >= 218 {
        reply.good_output_b.copy_from_slice(&data[213..217]);
        reply.status3 = data[217];
    }
    if data.len() >= 224 {
        reply.default_uid_responder.copy_from_slice(&data[218..224]);
    }
    if data.len() >= 229 {
        reply.user = u16::from_be_bytes([data[224], data[225]]);
        reply.refresh_rate = u16::from_be_bytes([data[226], data[227]]);
        reply.background_queue_policy = data[228];
    }

    Ok(reply)
}

impl ArtDmx {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DMX_HEADER_SIZE + self.data.len());
        write_header(&mut buf, OpCode::Dmx);
        buf.push(self.sequence);
        buf.push(self.physical);
        buf.push((self.port_address & 0xff) as u8); // SubUni
        buf.push(((self.port_address >> 8) & 0x7f) as u8); // Net
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

fn parse_dmx(data: &[u8]) -> Result<ArtDmx, Discard> {
    if data.len() < DMX_HEADER_SIZE {
        return Err(Discard::Truncated);
    }

    let sub_uni = data[14];
    let net = data[15];
    let length = u16::from_be_bytes([data[16], data[17]]) as usize;

    let end = DMX_HEADER_SIZE + length.min(512);
    if data.len() < end {
        return Err(Discard::Truncated);
    }

    Ok(ArtDmx {
        sequence: data[12],
        physical: data[13],
        port_address: ((net as u16 & 0x7f) << 8) | sub_uni as u16,
        data: data[DMX_HEADER_SIZE..end].to_vec(),
    })
}

pub fn sync_to_bytes() -> Vec<u8> {
    let mut buf = Vec::with_capacity(SYNC_SIZE);
    write_header(&mut buf, OpCode::Sync);
    buf.push(0x00); // Aux1
    buf.push(0x00); // Aux2
    buf
}

impl ArtDiagData {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Text is transmitted null-terminated, 512 bytes max
        let text = self.text.as_bytes();
        let used = text.len().min(511);
        let length = (used + 1) as u16;

        let mut buf = Vec::with_capacity(18 + used + 1);
        write_header(&mut buf, OpCode::DiagData);
        buf.push(0x00); // filler
        buf.push(self.priority);
        buf.push(0x00);
        buf.push(0x00);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&text[..used]);
        buf.push(0x00);
        buf
    }
}

fn parse_diag_data(data: &[u8]) -> Result<ArtDiagData, Discard> {
    if data.len() < 18 {
        return Err(Discard::Truncated);
    }

    let length = u16::from_be_bytes([data[16], data[17]]) as usize;
    let end = (18 + length).min(data.len());

    Ok(ArtDiagData {
        priority: data[13],
        text: extract_string(&data[18..end]),
    })
}

impl ArtAddress {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ADDRESS_SIZE);
        write_header(&mut buf, OpCode::Address);
        buf.push(self.net_switch);
        buf.push(self.bind_index);
        write_string(&mut buf, &self.short_name, SHORT_NAME_LENGTH);
        write_string(&mut buf, &self.long_name, LONG_NAME_LENGTH);
        buf.extend_from_slice(&self.sw_in);
        buf.extend_from_slice(&self.sw_out);
        buf.push(self.sub_switch);
        buf.push(0x00); // SwVideo, reserved
        buf.push(self.command);
        debug_assert_eq!(buf.len(), ADDRESS_SIZE);
        buf
    }
}

fn parse_address(data: &[u8]) -> Result<ArtAddress, Discard> {
    if data.len() < ADDRESS_SIZE {
        return Err(Discard::Truncated);
    }

    let mut address = ArtAddress {
        net_switch: data[12],
        bind_index: data[13],
        short_name: extract_string(&data[14..32]),
        long_name: extract_string(&data[32..96]),
        sw_in: [0; 4],
        sw_out: [0; 4],
        sub_switch: data[104],
        command: data[106],
    };

    address.sw_in.copy_from_slice(&data[96..100]);
    address.sw_out.copy_from_slice(&data[100..104]);

    Ok(address)
}

impl ArtInput {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INPUT_SIZE);
        write_header(&mut buf, OpCode::Input);
        buf.push(0x00); // filler
        buf.push(self.bind_index);
        buf.extend_from_slice(&self.num_ports.to_be_bytes());
        buf.extend_from_slice(&self.input);
        buf
    }
}

fn parse_input(data: &[u8]) -> Result<ArtInput, Discard> {
    if data.len() < INPUT_SIZE {
        return Err(Discard::Truncated);
    }

    let mut input = ArtInput {
        bind_index: data[13],
        num_ports: u16::from_be_bytes([data[14], data[15]]),
        input: [0; 4],
    };
    input.input.copy_from_slice(&data[16..20]);

    Ok(input)
}

pub fn time_code_to_bytes(time_code: &TimeCode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TIME_CODE_SIZE);
    write_header(&mut buf, OpCode::TimeCode);
    buf.push(0x00);
    buf.push(0x00);
    buf.push(time_code.frames);
    buf.push(time_code.seconds);
    buf.push(time_code.minutes);
    buf.push(time_code.hours);
    buf.push(time_code.kind);
    buf
}

fn parse_time_code(data: &[u8]) -> Result<TimeCode, Discard> {
    if data.len() < TIME_CODE_SIZE {
        return Err(Discard::Truncated);
    }

    Ok(TimeCode {
        frames: data[14],
        seconds: data[15],
        minutes: data[16],
        hours: data[17],
        kind: data[18],
    })
}

impl ArtTodRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOD_REQUEST_SIZE);
        write_header(&mut buf, OpCode::TodRequest);
        buf.extend_from_slice(&[0; 9]); // filler + spare
        buf.push(self.net);
        buf.push(self.command);
        let count = self.addresses.len().min(32);
        buf.push(count as u8);
        buf.extend_from_slice(&self.addresses[..count]);
        buf.resize(TOD_REQUEST_SIZE, 0);
        buf
    }
}

fn parse_tod_request(data: &[u8]) -> Result<ArtTodRequest, Discard> {
    if data.len() < TOD_REQUEST_SIZE {
        return Err(Discard::Truncated);
    }

    let count = (data[23] as usize).min(32);

    Ok(ArtTodRequest {
        net: data[21],
        command: data[22],
        addresses: data[24..24 + count].to_vec(),
    })
}

impl ArtTodControl {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TOD_CONTROL_SIZE);
        write_header(&mut buf, OpCode::TodControl);
        buf.extend_from_slice(&[0; 9]); // filler + spare
        buf.push(self.net);
        buf.push(self.command);
        buf.push(self.address);
        buf
    }
}

fn parse_tod_control(data: &[u8]) -> Result<ArtTodControl, Discard> {
    if data.len() < TOD_CONTROL_SIZE {
        return Err(Discard::Truncated);
    }

    Ok(ArtTodControl {
        net: data[21],
        command: data[22],
        address: data[23],
    })
}

impl ArtTodData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = self.uids.len().min(TOD_BLOCK_SIZE);
        let mut buf = Vec::with_capacity(TOD_DATA_HEADER_SIZE + count * UID_SIZE);
        write_header(&mut buf, OpCode::TodData);
        buf.push(self.rdm_version);
        buf.push(self.port);
        buf.extend_from_slice(&[0; 6]); // spare
        buf.push(self.bind_index);
        buf.push(self.net);
        buf.push(self.command_response);
        buf.push(self.address);
        buf.extend_from_slice(&self.uid_total.to_be_bytes());
        buf.push(self.block_count);
        buf.push(count as u8);
        for uid in self.uids.iter().take(count) {
            buf.extend_from_slice(uid);
        }
        buf
    }
}

fn parse_tod_data(data: &[u8]) -> Result<ArtTodData, Discard> {
    if data.len() < TOD_DATA_HEADER_SIZE {
        return Err(Discard::Truncated);
    }

    let count = data[27] as usize;
    if data.len() < TOD_DATA_HEADER_SIZE + count * UID_SIZE {
        return Err(Discard::Truncated);
    }

    let mut uids = Vec::with_capacity(count);
    for chunk in data[TOD_DATA_HEADER_SIZE..TOD_DATA_HEADER_SIZE + count * UID_SIZE].chunks_exact(UID_SIZE) {
        let mut uid = [0u8; UID_SIZE];
        uid.copy_from_slice(chunk);
        uids.push(uid);
    }

    Ok(ArtTodData {
        rdm_version: data[12],
        port: data[13],
        bind_index: data[20],
        net: data[21],
        command_response: data[22],
        address: data[23],
        uid_total: u16::from_be_bytes([data[24], data[25]]),
        block_count: data[26],
        uids,
    })
}

impl ArtRdm {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RDM_HEADER_SIZE + self.data.len());
        write_header(&mut buf, OpCode::Rdm);
        buf.push(self.rdm_version);
        buf.extend_from_slice(&[0; 8]); // filler + spare
        buf.push(self.net);
        buf.push(self.command);
        buf.push(self.address);
        buf.extend_from_slice(&self.data);
        buf
    }
}

fn parse_rdm(data: &[u8]) -> Result<ArtRdm, Discard> {
    if data.len() < RDM_HEADER_SIZE {
        return Err(Discard::Truncated);
    }

    Ok(ArtRdm {
        rdm_version: data[12],
        net: data[21],
        command: data[22],
        address: data[23],
        data: data[RDM_HEADER_SIZE..].to_vec(),
    })
}

impl ArtTrigger {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TRIGGER_HEADER_SIZE + 512);
        write_header(&mut buf, OpCode::Trigger);
        buf.push(0x00);
        buf.push(0x00);
        buf.extend_from_slice(&self.oem.to_be_bytes());
        buf.push(self.key);
        buf.push(self.sub_key);
        let used = self.payload.len().min(512);
        buf.extend_from_slice(&self.payload[..used]);
        buf.resize(TRIGGER_HEADER_SIZE + 512, 0);
        buf
    }
}

fn parse_trigger(data: &[u8]) -> Result<ArtTrigger, Discard> {
    if data.len() < TRIGGER_HEADER_SIZE {
        return Err(Discard::Truncated);
    }

    Ok(ArtTrigger {
        oem: u16::from_be_bytes([data[14], data[15]]),
        key: data[16],
        sub_key: data[17],
        payload: data[TRIGGER_HEADER_SIZE..data.len().min(TRIGGER_HEADER_SIZE + 512)].to_vec(),
    })
}

impl ArtIpProg {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IP_PROG_SIZE);
        write_header(&mut buf, OpCode::IpProg);
        buf.push(0x00);
        buf.push(0x00);
        buf.push(self.command);
        buf.push(0x00);
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.netmask);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.gateway);
        buf
    }
}

fn parse_ip_prog(data: &[u8]) -> Result<ArtIpProg, Discard> {
    if data.len() < IP_PROG_SIZE {
        return Err(Discard::Truncated);
    }

    let mut prog = ArtIpProg {
        command: data[14],
        port: u16::from_be_bytes([data[24], data[25]]),
        ..ArtIpProg::default()
    };
    prog.ip.copy_from_slice(&data[16..20]);
    prog.netmask.copy_from_slice(&data[20..24]);
    prog.gateway.copy_from_slice(&data[26..30]);

    Ok(prog)
}

impl ArtIpProgReply {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IP_PROG_REPLY_SIZE);
        write_header(&mut buf, OpCode::IpProgReply);
        buf.extend_from_slice(&[0; 4]); // filler
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.netmask);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.push(self.status);
        buf.push(0x00); // spare
        buf.extend_from_slice(&self.gateway);
        buf.push(0x00);
        buf.push(0x00);
        buf
    }
}

fn parse_ip_prog_reply(data: &[u8]) -> Result<ArtIpProgReply, Discard> {
    if data.len() < IP_PROG_REPLY_SIZE {
        return Err(Discard::Truncated);
    }

    let mut reply = ArtIpProgReply {
        port: u16::from_be_bytes([data[24], data[25]]),
        status: data[26],
        ..ArtIpProgReply::default()
    };
    reply.ip.copy_from_slice(&data[16..20]);
    reply.netmask.copy_from_slice(&data[20..24]);
    reply.gateway.copy_from_slice(&data[28..32]);

    Ok(reply)
}

/// The broadcast target on the Art-Net port
pub fn broadcast_target(broadcast_ip: Ipv4Addr) -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(broadcast_ip, ARTNET_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rejects_short_and_foreign_datagrams() {
        assert_eq!(classify(&[0u8; 4]), Err(Discard::Truncated));

        let mut data = [0u8; 32];
        data[..8].copy_from_slice(b"Bad-Net\0");
        assert_eq!(classify(&data), Err(Discard::BadIdentifier));
    }

    #[test]
    fn classify_rejects_wrong_protocol_revision() {
        let mut poll = ArtPoll::default().to_bytes();
        poll[11] = 13;
        assert_eq!(classify(&poll), Err(Discard::BadProtocolRevision));
    }

    #[test]
    fn classify_rejects_unknown_opcodes() {
        let mut data = ArtPoll::default().to_bytes();
        data[8] = 0x34;
        data[9] = 0x12;
        assert_eq!(classify(&data), Err(Discard::UnknownOpCode(0x1234)));
    }

    #[test]
    fn poll_round_trips() {
        let poll = ArtPoll {
            flags: poll_flags::SEND_REPLY_ON_CHANGE | poll_flags::SEND_DIAG_MESSAGES,
            diag_priority: diag_priority::LOW,
            target_top: 0x1234,
            target_bottom: 0x0010,
        };
        let bytes = poll.to_bytes();
        assert_eq!(bytes.len(), POLL_SIZE);

        match classify(&bytes).unwrap() {
            ArtPacket::Poll(parsed) => assert_eq!(parsed, poll),
            other => panic!("expected Poll, got {:?}", other),
        }
    }

    #[test]
    fn poll_reply_encodes_to_fixed_length_and_round_trips() {
        let reply = ArtPollReply {
            ip_address: [10, 0, 0, 7],
            net_switch: 2,
            sub_switch: 3,
            oem: 0x2828,
            status1: status1::INDICATOR_NORMAL_MODE,
            esta_manufacturer: 0x7ff0,
            short_name: "lxnode".into(),
            long_name: "lxnode Art-Net 4 node".into(),
            node_report: "#0001 [1] Power On Tests successful".into(),
            num_ports: 1,
            port_types: [port_type::OUTPUT_ARTNET, 0, 0, 0],
            good_output: [good_output::DATA_IS_BEING_TRANSMITTED, 0, 0, 0],
            sw_out: [1, 0, 0, 0],
            mac_address: [2, 0, 10, 0, 0, 7],
            bind_ip: [10, 0, 0, 7],
            bind_index: 1,
            status2: status2::PORT_ADDRESS_15BIT,
            ..ArtPollReply::default()
        };

        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), POLL_REPLY_SIZE);

        match classify(&bytes).unwrap() {
            ArtPacket::PollReply(parsed) => {
                assert_eq!(*parsed, reply);
                // and the re-encode is byte identical
                assert_eq!(parsed.to_bytes(), bytes);
            }
            other => panic!("expected PollReply, got {:?}", other),
        }
    }

    #[test]
    fn poll_reply_accepts_the_classic_207_byte_layout() {
        let bytes = ArtPollReply {
            short_name: "classic".into(),
            mac_address: [1, 2, 3, 4, 5, 6],
            ..ArtPollReply::default()
        }
        .to_bytes();

        match classify(&bytes[..POLL_REPLY_MIN_SIZE]).unwrap() {
            ArtPacket::PollReply(parsed) => {
                assert_eq!(parsed.short_name, "classic");
                assert_eq!(parsed.mac_address, [1, 2, 3, 4, 5, 6]);
                assert_eq!(parsed.bind_index, 0);
                assert_eq!(parsed.status2, 0);
            }
            other => panic!("expected PollReply, got {:?}", other),
        }
    }

    #[test]
    fn dmx_round_trips_and_carries_the_port_address() {
        let dmx = ArtDmx {
            sequence: 42,
            physical: 1,
            port_address: (1 << 8) | (2 << 4) | 3,
            data: vec![0x10; 512],
        };
        let bytes = dmx.to_bytes();
        assert_eq!(bytes.len(), DMX_HEADER_SIZE + 512);
        // SubUni low byte first, then Net
        assert_eq!(bytes[14], 0x23);
        assert_eq!(bytes[15], 0x01);

        match classify(&bytes).unwrap() {
            ArtPacket::Dmx(parsed) => assert_eq!(parsed, dmx),
            other => panic!("expected Dmx, got {:?}", other),
        }
    }

    #[test]
    fn dmx_shorter_than_declared_length_is_truncated() {
        let mut bytes = ArtDmx {
            sequence: 1,
            physical: 0,
            port_address: 1,
            data: vec![0; 64],
        }
        .to_bytes();
        bytes.truncate(DMX_HEADER_SIZE + 32);
        assert_eq!(classify(&bytes), Err(Discard::Truncated));
    }

    #[test]
    fn fixed_size_packets_encode_to_their_specified_lengths() {
        assert_eq!(sync_to_bytes().len(), SYNC_SIZE);
        assert_eq!(
            ArtAddress {
                net_switch: 0,
                bind_index: 1,
                short_name: String::new(),
                long_name: String::new(),
                sw_in: [0; 4],
                sw_out: [0; 4],
                sub_switch: 0,
                command: port_command::NONE,
            }
            .to_bytes()
            .len(),
            ADDRESS_SIZE
        );
        assert_eq!(
            ArtInput { bind_index: 1, num_ports: 4, input: [0; 4] }.to_bytes().len(),
            INPUT_SIZE
        );
        assert_eq!(
            time_code_to_bytes(&TimeCode { frames: 0, seconds: 0, minutes: 0, hours: 0, kind: 1 }).len(),
            TIME_CODE_SIZE
        );
        assert_eq!(
            ArtTodRequest { net: 0, command: 0, addresses: vec![1] }.to_bytes().len(),
            TOD_REQUEST_SIZE
        );
        assert_eq!(
            ArtTodControl { net: 0, command: tod_control::FLUSH, address: 1 }.to_bytes().len(),
            TOD_CONTROL_SIZE
        );
        assert_eq!(ArtIpProg::default().to_bytes().len(), IP_PROG_SIZE);
        assert_eq!(ArtIpProgReply::default().to_bytes().len(), IP_PROG_REPLY_SIZE);
        assert_eq!(
            ArtTrigger { oem: 0xffff, key: 0, sub_key: 0, payload: Vec::new() }.to_bytes().len(),
            TRIGGER_HEADER_SIZE + 512
        );
    }

    #[test]
    fn tod_data_varies_with_uid_count() {
        let tod = ArtTodData {
            rdm_version: 1,
            port: 1,
            bind_index: 1,
            net: 0,
            command_response: 0,
            address: 1,
            uid_total: 3,
            block_count: 0,
            uids: vec![[1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12], [13, 14, 15, 16, 17, 18]],
        };
        let bytes = tod.to_bytes();
        assert_eq!(bytes.len(), TOD_DATA_HEADER_SIZE + 3 * UID_SIZE);

        match classify(&bytes).unwrap() {
            ArtPacket::TodData(parsed) => assert_eq!(*parsed, tod),
            other => panic!("expected TodData, got {:?}", other),
        }
    }

    #[test]
    fn rdm_round_trips_payload() {
        let rdm = ArtRdm {
            rdm_version: 1,
            net: 0,
            command: 0,
            address: 1,
            data: vec![0xcc, 0x01, 0x18, 0x00],
        };
        match classify(&rdm.to_bytes()).unwrap() {
            ArtPacket::Rdm(parsed) => assert_eq!(parsed, rdm),
            other => panic!("expected Rdm, got {:?}", other),
        }
    }

    #[test]
    fn address_round_trips() {
        let address = ArtAddress {
            net_switch: 0x81,
            bind_index: 2,
            short_name: "booth".into(),
            long_name: "front of house".into(),
            sw_in: [0x7f; 4],
            sw_out: [0x83, 0x7f, 0x7f, 0x7f],
            sub_switch: 0x82,
            command: port_command::MERGE_LTP_BASE,
        };
        match classify(&address.to_bytes()).unwrap() {
            ArtPacket::Address(parsed) => assert_eq!(*parsed, address),
            other => panic!("expected Address, got {:?}", other),
        }
    }
}
