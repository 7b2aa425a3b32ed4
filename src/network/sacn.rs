// sACN (E1.31) wire codec
// ANSI E1.31 - 2018 Streaming ACN Protocol
//
// Three nested ACN PDUs: Root -> Framing -> DMP (data), or
// Root -> Framing -> Universe Discovery. All multi-byte fields are
// big-endian; every layer carries `flags_length = 0x7 << 12 | pdu_len`
// where the length is counted from the flags field to the packet end.

use std::net::{Ipv4Addr, SocketAddrV4};

/// sACN constants
pub const SACN_PORT: u16 = 5568;
pub const ACN_PACKET_IDENTIFIER: &[u8] = &[
    0x41, 0x53, 0x43, 0x2d, 0x45, 0x31, 0x2e, 0x31, 0x37, 0x00, 0x00, 0x00,
]; // "ASC-E1.17\0\0\0"

pub const CID_LENGTH: usize = 16;
pub const SOURCE_NAME_LENGTH: usize = 64;

/// Universe numbers are 1..=63999; 64214 is reserved for discovery
pub const UNIVERSE_MAX: u16 = 63_999;
pub const DISCOVERY_UNIVERSE: u16 = 64_214;

/// Universes per discovery page
pub const DISCOVERY_PAGE_SIZE: usize = 512;

/// Protocol timing
pub const NETWORK_DATA_LOSS_TIMEOUT_MILLIS: u32 = 10_000;
pub const MERGE_TIMEOUT_MILLIS: u32 = 10_000;
pub const PRIORITY_TIMEOUT_MILLIS: u32 = 10_000;
pub const UNIVERSE_DISCOVERY_INTERVAL_MILLIS: u32 = 10_000;

/// Framing-layer priority field
pub mod priority {
    pub const LOWEST: u8 = 0;
    pub const DEFAULT: u8 = 100;
    pub const HIGHEST: u8 = 200;
}

/// Root layer vectors
pub mod root_vector {
    pub const DATA: u32 = 0x0000_0004;
    pub const EXTENDED: u32 = 0x0000_0008;
}

/// Framing layer vectors
pub mod framing_vector {
    /// Data packet framing layer
    pub const DATA: u32 = 0x0000_0002;
    /// Extended packet: synchronization
    pub const SYNCHRONIZATION: u32 = 0x0000_0001;
    /// Extended packet: universe discovery
    pub const DISCOVERY: u32 = 0x0000_0002;
}

/// Universe discovery layer vector
pub const UNIVERSE_LIST_VECTOR: u32 = 0x0000_0001;

/// DMP layer constants
pub mod dmp {
    pub const VECTOR_SET_PROPERTY: u8 = 0x02;
    pub const ADDRESS_DATA_TYPE: u8 = 0xa1;
}

/// Framing-layer options bits
pub mod options {
    /// Visualiser/preview data, never live output
    pub const PREVIEW_DATA: u8 = 1 << 7;
    /// The source is going away; enter network data loss for it
    pub const STREAM_TERMINATED: u8 = 1 << 6;
    /// When clear, receivers hold synchronized output on sync loss
    pub const FORCE_SYNCHRONIZATION: u8 = 1 << 5;
}

const ROOT_LAYER_SIZE: usize = 38;
const DATA_FRAMING_OFFSET: usize = 38;
const DMP_OFFSET: usize = 115;
const DATA_OFFSET: usize = 126;
const SYNC_PACKET_SIZE: usize = 49;
const DISCOVERY_LIST_OFFSET: usize = 120;

/// Why an sACN datagram was dropped at the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    Truncated,
    BadPreamble,
    BadIdentifier,
    BadVector(u32),
    BadDmp,
    BadUniverse(u16),
}

/// E1.31 Data packet (DMX payload with the start code stripped)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub cid: [u8; CID_LENGTH],
    pub source_name: String,
    pub priority: u8,
    pub synchronization_address: u16,
    pub sequence: u8,
    pub options: u8,
    pub universe: u16,
    pub start_code: u8,
    pub data: Vec<u8>,
}

/// E1.31 Synchronization packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    pub cid: [u8; CID_LENGTH],
    pub sequence: u8,
    pub synchronization_address: u16,
}

/// E1.31 Universe Discovery packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub cid: [u8; CID_LENGTH],
    pub source_name: String,
    pub page: u8,
    pub last_page: u8,
    pub universes: Vec<u16>,
}

/// Result of classifying an sACN datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SacnPacket {
    Data(Box<DataPacket>),
    Sync(SyncPacket),
    Discovery(DiscoveryPacket),
}

/// Calculate the sACN multicast address for a universe:
/// 239.255.{high byte}.{low byte}
pub fn multicast_ip(universe: u16) -> Ipv4Addr {
    Ipv4Addr::new(239, 255, (universe >> 8) as u8, (universe & 0xff) as u8)
}

/// The universe discovery multicast group, 239.255.250.214
pub fn discovery_multicast_ip() -> Ipv4Addr {
    multicast_ip(DISCOVERY_UNIVERSE)
}

/// The multicast target for a universe on the sACN port
pub fn multicast_target(universe: u16) -> SocketAddrV4 {
    SocketAddrV4::new(multicast_ip(universe), SACN_PORT)
}

/// CID to string (UUID format)
pub fn cid_to_string(cid: &[u8; CID_LENGTH]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        cid[0], cid[1], cid[2], cid[3],
        cid[4], cid[5],
        cid[6], cid[7],
        cid[8], cid[9],
        cid[10], cid[11], cid[12], cid[13], cid[14], cid[15]
    )
}

fn flags_length(length: usize) -> u16 {
    0x7 << 12 | (length as u16 & 0x0fff)
}

/// Classify an sACN datagram into a typed packet.
pub fn classify(data: &[u8]) -> Result<SacnPacket, Discard> {
    if data.len() < ROOT_LAYER_SIZE {
        return Err(Discard::Truncated);
    }

    // Root layer preamble 0x0010, post-amble 0x0000
    if u16::from_be_bytes([data[0], data[1]]) != 0x0010
        || u16::from_be_bytes([data[2], data[3]]) != 0x0000
    {
        return Err(Discard::BadPreamble);
    }

    if &data[4..16] != ACN_PACKET_IDENTIFIER {
        return Err(Discard::BadIdentifier);
    }

    let root_vector = u32::from_be_bytes([data[18], data[19], data[20], data[21]]);

    let mut cid = [0u8; CID_LENGTH];
    cid.copy_from_slice(&data[22..38]);

    match root_vector {
        root_vector::DATA => parse_data_packet(data, cid),
        root_vector::EXTENDED => parse_extended_packet(data, cid),
        other => Err(Discard::BadVector(other)),
    }
}

fn parse_data_packet(data: &[u8], cid: [u8; CID_LENGTH]) -> Result<SacnPacket, Discard> {
    if data.len() < DATA_OFFSET {
        return Err(Discard::Truncated);
    }

    let framing_vector = u32::from_be_bytes([data[40], data[41], data[42], data[43]]);
    if framing_vector != framing_vector::DATA {
        return Err(Discard::BadVector(framing_vector));
    }

    // DMP layer: receivers shall discard anything but a well-formed
    // Set Property message (E1.31 section 7)
    if data[117] != dmp::VECTOR_SET_PROPERTY
        || data[118] != dmp::ADDRESS_DATA_TYPE
        || u16::from_be_bytes([data[119], data[120]]) != 0x0000
        || u16::from_be_bytes([data[121], data[122]]) != 0x0001
    {
        return Err(Discard::BadDmp);
    }

    let property_count = u16::from_be_bytes([data[123], data[124]]) as usize;
    let slots = property_count
        .saturating_sub(1)
        .min(512)
        .min(data.len() - DATA_OFFSET);

    Ok(SacnPacket::Data(Box::new(DataPacket {
        cid,
        source_name: extract_string(&data[44..108]),
        priority: data[108],
        synchronization_address: u16::from_be_bytes([data[109], data[110]]),
        sequence: data[111],
        options: data[112],
        universe: u16::from_be_bytes([data[113], data[114]]),
        start_code: data[125],
        data: data[DATA_OFFSET..DATA_OFFSET + slots].to_vec(),
    })))
}

fn parse_extended_packet(data: &[u8], cid: [u8; CID_LENGTH]) -> Result<SacnPacket, Discard> {
    if data.len() < 44 {
        return Err(Discard::Truncated);
    }

    let framing_vector = u32::from_be_bytes([data[40], data[41], data[42], data[43]]);

    match framing_vector {
        framing_vector::SYNCHRONIZATION => {
            if data.len() < SYNC_PACKET_SIZE {
                return Err(Discard::Truncated);
            }
            Ok(SacnPacket::Sync(SyncPacket {
                cid,
                sequence: data[44],
                synchronization_address: u16::from_be_bytes([data[45], data[46]]),
            }))
        }
        framing_vector::DISCOVERY => {
            if data.len() < DISCOVERY_LIST_OFFSET {
                return Err(Discard::Truncated);
            }

            let mut universes = Vec::new();
            let mut offset = DISCOVERY_LIST_OFFSET;
            while offset + 1 < data.len() {
                let universe = u16::from_be_bytes([data[offset], data[offset + 1]]);
                if universe != 0 {
                    universes.push(universe);
                }
                offset += 2;
            }

            Ok(SacnPacket::Discovery(DiscoveryPacket {
                cid,
                source_name: extract_string(&data[44..108]),
                page: data[118],
                last_page: data[119],
                universes,
            }))
        }
        other => Err(Discard::BadVector(other)),
    }
}

fn write_root_layer(buf: &mut Vec<u8>, pdu_length: usize, vector: u32, cid: &[u8; CID_LENGTH]) {
    buf.extend_from_slice(&0x0010u16.to_be_bytes());
    buf.extend_from_slice(&0x0000u16.to_be_bytes());
    buf.extend_from_slice(ACN_PACKET_IDENTIFIER);
    buf.extend_from_slice(&flags_length(pdu_length).to_be_bytes());
    buf.extend_from_slice(&vector.to_be_bytes());
    buf.extend_from_slice(cid);
}

fn write_source_name(buf: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    let used = bytes.len().min(SOURCE_NAME_LENGTH - 1);
    buf.extend_from_slice(&bytes[..used]);
    buf.resize(buf.len() + (SOURCE_NAME_LENGTH - used), 0);
}

/// Extract a null-terminated UTF-8 string from bytes
fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

impl DataPacket {
    /// Encode the packet; `data` holds the k slots (start code excluded).
    pub fn to_bytes(&self) -> Vec<u8> {
        let slots = self.data.len().min(512);
        let property_count = slots + 1;

        let mut buf = Vec::with_capacity(DATA_OFFSET + slots);
        // Root PDU runs from its flags field (offset 16) to the end
        write_root_layer(&mut buf, 22 + 77 + 10 + property_count, root_vector::DATA, &self.cid);

        // Framing layer
        buf.extend_from_slice(&flags_length(77 + 10 + property_count).to_be_bytes());
        buf.extend_from_slice(&framing_vector::DATA.to_be_bytes());
        write_source_name(&mut buf, &self.source_name);
        buf.push(self.priority);
        buf.extend_from_slice(&self.synchronization_address.to_be_bytes());
        buf.push(self.sequence);
        buf.push(self.options);
        buf.extend_from_slice(&self.universe.to_be_bytes());

        // DMP layer
        buf.extend_from_slice(&flags_length(10 + property_count).to_be_bytes());
        buf.push(dmp::VECTOR_SET_PROPERTY);
        buf.push(dmp::ADDRESS_DATA_TYPE);
        buf.extend_from_slice(&0x0000u16.to_be_bytes());
        buf.extend_from_slice(&0x0001u16.to_be_bytes());
        buf.extend_from_slice(&(property_count as u16).to_be_bytes());
        buf.push(self.start_code);
        buf.extend_from_slice(&self.data[..slots]);

        debug_assert_eq!(buf.len(), DATA_OFFSET + slots);
        buf
    }
}

impl SyncPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SYNC_PACKET_SIZE);
        write_root_layer(&mut buf, 22 + 11, root_vector::EXTENDED, &self.cid);

        buf.extend_from_slice(&flags_length(11).to_be_bytes());
        buf.extend_from_slice(&framing_vector::SYNCHRONIZATION.to_be_bytes());
        buf.push(self.sequence);
        buf.extend_from_slice(&self.synchronization_address.to_be_bytes());
        buf.extend_from_slice(&0x0000u16.to_be_bytes()); // reserved

        debug_assert_eq!(buf.len(), SYNC_PACKET_SIZE);
        buf
    }
}

impl DiscoveryPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = self.universes.len().min(DISCOVERY_PAGE_SIZE);
        let list_length = 8 + 2 * count;

        let mut buf = Vec::with_capacity(DISCOVERY_LIST_OFFSET + 2 * count);
        write_root_layer(&mut buf, 22 + 74 + list_length, root_vector::EXTENDED, &self.cid);

        // Framing layer
        buf.extend_from_slice(&flags_length(74 + list_length).to_be_bytes());
        buf.extend_from_slice(&framing_vector::DISCOVERY.to_be_bytes());
        write_source_name(&mut buf, &self.source_name);
        buf.extend_from_slice(&[0; 4]); // reserved

        // Universe discovery layer
        buf.extend_from_slice(&flags_length(list_length).to_be_bytes());
        buf.extend_from_slice(&UNIVERSE_LIST_VECTOR.to_be_bytes());
        buf.push(self.page);
        buf.push(self.last_page);
        for universe in self.universes.iter().take(count) {
            buf.extend_from_slice(&universe.to_be_bytes());
        }

        debug_assert_eq!(buf.len(), DISCOVERY_LIST_OFFSET + 2 * count);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(slots: usize) -> DataPacket {
        DataPacket {
            cid: [0xaa; 16],
            source_name: "lxnode source".into(),
            priority: priority::DEFAULT,
            synchronization_address: 0,
            sequence: 1,
            options: 0,
            universe: 1,
            start_code: 0,
            data: vec![0x55; slots],
        }
    }

    #[test]
    fn multicast_ip_maps_universe_bytes() {
        for universe in 0..=32_767u16 {
            let ip = multicast_ip(universe);
            assert_eq!(
                ip.octets(),
                [239, 255, (universe >> 8) as u8, (universe & 0xff) as u8]
            );
        }
        assert_eq!(discovery_multicast_ip(), Ipv4Addr::new(239, 255, 250, 214));
    }

    #[test]
    fn data_packet_layer_lengths_follow_the_slot_count() {
        for slots in [1usize, 16, 512] {
            let bytes = data_packet(slots).to_bytes();
            assert_eq!(bytes.len(), 126 + slots);

            let k = slots + 1; // property count includes the start code
            let root = u16::from_be_bytes([bytes[16], bytes[17]]);
            let framing = u16::from_be_bytes([bytes[38], bytes[39]]);
            let dmp = u16::from_be_bytes([bytes[115], bytes[116]]);

            assert_eq!(root, 0x7 << 12 | (109 + k) as u16);
            assert_eq!(framing, 0x7 << 12 | (87 + k) as u16);
            assert_eq!(dmp, 0x7 << 12 | (10 + k) as u16);
        }
    }

    #[test]
    fn data_packet_round_trips() {
        let packet = DataPacket {
            synchronization_address: 7999,
            options: options::PREVIEW_DATA,
            universe: 513,
            ..data_packet(512)
        };

        match classify(&packet.to_bytes()).unwrap() {
            SacnPacket::Data(parsed) => assert_eq!(*parsed, packet),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn sync_packet_is_49_bytes_and_round_trips() {
        let sync = SyncPacket {
            cid: [0x11; 16],
            sequence: 42,
            synchronization_address: 7999,
        };
        let bytes = sync.to_bytes();
        assert_eq!(bytes.len(), 49);

        match classify(&bytes).unwrap() {
            SacnPacket::Sync(parsed) => assert_eq!(parsed, sync),
            other => panic!("expected Sync, got {:?}", other),
        }
    }

    #[test]
    fn discovery_packet_round_trips() {
        let discovery = DiscoveryPacket {
            cid: [0x22; 16],
            source_name: "sender".into(),
            page: 0,
            last_page: 0,
            universes: vec![1, 2, 700],
        };
        let bytes = discovery.to_bytes();
        assert_eq!(bytes.len(), 120 + 2 * 3);

        match classify(&bytes).unwrap() {
            SacnPacket::Discovery(parsed) => assert_eq!(parsed, discovery),
            other => panic!("expected Discovery, got {:?}", other),
        }
    }

    #[test]
    fn classify_rejects_malformed_root_layers() {
        let good = data_packet(16).to_bytes();

        let mut bad = good.clone();
        bad[0] = 0xff;
        assert_eq!(classify(&bad), Err(Discard::BadPreamble));

        let mut bad = good.clone();
        bad[4] = b'X';
        assert_eq!(classify(&bad), Err(Discard::BadIdentifier));

        let mut bad = good.clone();
        bad[21] = 0x05;
        assert_eq!(classify(&bad), Err(Discard::BadVector(5)));

        assert_eq!(classify(&good[..20]), Err(Discard::Truncated));
    }

    #[test]
    fn classify_rejects_bad_dmp_layers() {
        // Wrong DMP vector
        let mut bad = data_packet(16).to_bytes();
        bad[117] = 0x03;
        assert_eq!(classify(&bad), Err(Discard::BadDmp));

        // Wrong address/data type
        let mut bad = data_packet(16).to_bytes();
        bad[118] = 0x00;
        assert_eq!(classify(&bad), Err(Discard::BadDmp));

        // Wrong address increment
        let mut bad = data_packet(16).to_bytes();
        bad[122] = 0x02;
        assert_eq!(classify(&bad), Err(Discard::BadDmp));
    }

    #[test]
    fn non_zero_start_codes_are_preserved_for_the_caller() {
        let packet = DataPacket {
            start_code: 0xcc, // RDM
            ..data_packet(24)
        };
        match classify(&packet.to_bytes()).unwrap() {
            SacnPacket::Data(parsed) => assert_eq!(parsed.start_code, 0xcc),
            other => panic!("expected Data, got {:?}", other),
        }
    }
}
