//! Wire format of LPMAC packets.
//!
//! Every frame is a packed header followed by the payload:
//!
//! ```text
//! +------+------+------+-----------+-------------+--------+-------------------+---------+
//! | type | opts |  id  | dst_count | payload_len | source | dst[0..dst_count] | payload |
//! |  u8  |  u8  |  u8  |    u8     |     u8      |  u32   |   u32 * dst_count |  bytes  |
//! +------+------+------+-----------+-------------+--------+-------------------+---------+
//! ```
//!
//! Multi-byte fields are little-endian on every node. A frame never exceeds
//! [MAX_FRAME_LENGTH] bytes.
use crate::NodeId;

/// Largest frame the radio can carry.
pub const MAX_FRAME_LENGTH: usize = 256;
/// Size of the header without any destination.
pub const MIN_HEADER_LENGTH: usize = 9;

const NODE_ID_LENGTH: usize = 4;

/// Trait to calculate size on frame for every component on frame.
pub trait FrameSize {
    /// Calculate component size on frame (meaning encoded) in bytes.
    fn size(&self) -> usize;
}

/// Header size for a given number of destinations.
pub const fn header_size(dst_count: usize) -> usize {
    MIN_HEADER_LENGTH + NODE_ID_LENGTH * dst_count
}

/// Largest payload that fits next to `dst_count` destinations.
pub const fn max_payload(dst_count: usize) -> usize {
    MAX_FRAME_LENGTH.saturating_sub(header_size(dst_count))
}

/// Packet kinds understood by the MAC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    Ack,
    Join,
    Unjoin,
    Data,
    /// Any other value, kept so that it can be reported and dropped.
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(inner: u8) -> Self {
        match inner {
            1 => PacketType::Ack,
            2 => PacketType::Join,
            3 => PacketType::Unjoin,
            4 => PacketType::Data,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> u8 {
        match kind {
            PacketType::Ack => 1,
            PacketType::Join => 2,
            PacketType::Unjoin => 3,
            PacketType::Data => 4,
            PacketType::Unknown(other) => other,
        }
    }
}

pub const OPTIONS_NO_ACK: u8 = 0b0000_0000;
pub const OPTIONS_ACK_BITMASK: u8 = 0b0000_0001;

/// Compact representation of the option bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketOptions(u8);

impl PacketOptions {
    pub fn new(ack: bool) -> Self {
        if ack {
            Self(OPTIONS_ACK_BITMASK)
        } else {
            Self(OPTIONS_NO_ACK)
        }
    }

    pub fn get_acknowledgment(&self) -> bool {
        (self.0 & OPTIONS_ACK_BITMASK) == OPTIONS_ACK_BITMASK
    }
}

impl From<u8> for PacketOptions {
    fn from(inner: u8) -> Self {
        PacketOptions(inner)
    }
}

impl From<PacketOptions> for u8 {
    fn from(options: PacketOptions) -> u8 {
        options.0
    }
}

/// Decoded packet header.
///
/// The destination count and payload length of the wire header are not stored:
/// they are derived from `destinations` and from the payload at encoding time,
/// so a header can never disagree with what it describes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub options: PacketOptions,
    /// Wrapping 8-bit sequence number used to correlate acknowledgments.
    pub packet_id: u8,
    pub source: NodeId,
    /// Empty for a broadcast.
    pub destinations: Vec<NodeId>,
}

impl PacketHeader {
    /// Header for a frame sent to every node in range.
    pub fn broadcast(packet_type: PacketType, packet_id: u8, source: NodeId, ack: bool) -> Self {
        Self {
            packet_type,
            options: PacketOptions::new(ack),
            packet_id,
            source,
            destinations: Vec::new(),
        }
    }

    /// Header for a frame sent to a single node.
    pub fn unicast(
        packet_type: PacketType,
        packet_id: u8,
        source: NodeId,
        destination: NodeId,
        ack: bool,
    ) -> Self {
        Self {
            packet_type,
            options: PacketOptions::new(ack),
            packet_id,
            source,
            destinations: vec![destination],
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn requests_ack(&self) -> bool {
        self.options.get_acknowledgment()
    }

    /// Broadcasts are addressed to everybody.
    pub fn is_addressed_to(&self, node: NodeId) -> bool {
        self.is_broadcast() || self.destinations.contains(&node)
    }

    fn write_to(&self, payload_len: u8, bytes: &mut Vec<u8>) {
        bytes.push(self.packet_type.into());
        bytes.push(self.options.into());
        bytes.push(self.packet_id);
        bytes.push(self.destinations.len() as u8);
        bytes.push(payload_len);
        bytes.extend_from_slice(&self.source.to_le_bytes());
        for dst in &self.destinations {
            bytes.extend_from_slice(&dst.to_le_bytes());
        }
    }
}

/// A full packet: header and owned payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        encode(&self.header, &self.payload)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        validate(bytes)
    }
}

impl FrameSize for PacketHeader {
    fn size(&self) -> usize {
        header_size(self.destinations.len())
    }
}

impl FrameSize for Packet {
    fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }
}

/// Serializes a header and its payload into one contiguous frame.
pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if header.destinations.len() > u8::MAX as usize {
        return Err(FrameError::TooManyDestinations {
            count: header.destinations.len(),
        });
    }
    let size = header.size() + payload.len();
    if size > MAX_FRAME_LENGTH {
        return Err(FrameError::TooLarge { size });
    }
    let mut bytes = Vec::with_capacity(size);
    header.write_to(payload.len() as u8, &mut bytes);
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Parses and checks a received frame.
///
/// The declared size is checked against the received length before any
/// destination or payload byte is read.
pub fn validate(bytes: &[u8]) -> Result<Packet, FrameError> {
    if bytes.len() < MIN_HEADER_LENGTH {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    let dst_count = bytes[3] as usize;
    let payload_len = bytes[4] as usize;
    let declared = header_size(dst_count) + payload_len;
    if declared != bytes.len() {
        return Err(FrameError::SizeMismatch {
            declared,
            received: bytes.len(),
        });
    }
    let destinations = bytes[MIN_HEADER_LENGTH..header_size(dst_count)]
        .chunks_exact(NODE_ID_LENGTH)
        .map(read_node_id)
        .collect();
    let header = PacketHeader {
        packet_type: PacketType::from(bytes[0]),
        options: PacketOptions::from(bytes[1]),
        packet_id: bytes[2],
        source: read_node_id(&bytes[5..MIN_HEADER_LENGTH]),
        destinations,
    };
    let payload = bytes[header_size(dst_count)..].to_vec();
    Ok(Packet { header, payload })
}

fn read_node_id(bytes: &[u8]) -> NodeId {
    let mut raw = [0u8; NODE_ID_LENGTH];
    raw.copy_from_slice(bytes);
    NodeId::from_le_bytes(raw)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame is shorter than a header (is: {len}B, min: {}B)!", MIN_HEADER_LENGTH)]
    TooShort { len: usize },

    #[error("Frame size disagrees with its header (declared: {declared}B, received: {received}B)!")]
    SizeMismatch { declared: usize, received: usize },

    #[error("Frame is too big to be transmitted (is: {size}B, max: {}B)!", MAX_FRAME_LENGTH)]
    TooLarge { size: usize },

    #[error("Too many destinations in one frame ({count}).")]
    TooManyDestinations { count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_data_layout() {
        let header = PacketHeader::unicast(PacketType::Data, 7, 0x0102_0304, 0xA0B0_C0D0, true);
        let bytes = encode(&header, b"hi").unwrap();
        assert_eq!(
            bytes,
            vec![
                4, 1, 7, 1, 2, // type, opts, id, dst_count, payload_len
                0x04, 0x03, 0x02, 0x01, // source
                0xD0, 0xC0, 0xB0, 0xA0, // destination
                b'h', b'i',
            ]
        );
        assert_eq!(bytes.len(), header.size() + 2);
    }

    #[test]
    fn decode_gives_back_header_and_payload() {
        let header = PacketHeader::unicast(PacketType::Data, 255, 1, 2, true);
        let packet = Packet::new(header, b"payload".to_vec());
        let decoded = Packet::try_from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);

        let join = Packet::new(PacketHeader::broadcast(PacketType::Join, 0, 9, true), Vec::new());
        let decoded = validate(&join.to_bytes().unwrap()).unwrap();
        assert!(decoded.header.is_broadcast());
        assert!(decoded.header.requests_ack());
        assert_eq!(decoded, join);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let frame = encode(&PacketHeader::broadcast(PacketType::Join, 0, 1, false), &[]).unwrap();
        for len in 0..MIN_HEADER_LENGTH {
            assert_eq!(validate(&frame[..len]), Err(FrameError::TooShort { len }));
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let header = PacketHeader::unicast(PacketType::Data, 3, 1, 2, false);
        let mut frame = encode(&header, b"abc").unwrap();

        // Truncated payload.
        assert!(matches!(
            validate(&frame[..frame.len() - 1]),
            Err(FrameError::SizeMismatch { .. })
        ));

        // Trailing garbage.
        frame.push(0);
        assert!(matches!(validate(&frame), Err(FrameError::SizeMismatch { .. })));
    }

    #[test]
    fn oversized_destination_count_does_not_overread() {
        // Header claims 200 destinations but only the fixed part is present.
        let frame = [4u8, 0, 0, 200, 0, 1, 0, 0, 0];
        assert_eq!(
            validate(&frame),
            Err(FrameError::SizeMismatch {
                declared: header_size(200),
                received: MIN_HEADER_LENGTH,
            })
        );
    }

    #[test]
    fn unknown_packet_type_is_kept() {
        let header = PacketHeader::broadcast(PacketType::Unknown(42), 1, 1, false);
        let packet = validate(&encode(&header, &[]).unwrap()).unwrap();
        assert_eq!(packet.header.packet_type, PacketType::Unknown(42));
    }

    #[test]
    fn payload_limits() {
        let header = PacketHeader::unicast(PacketType::Data, 0, 1, 2, true);
        let max = max_payload(1);
        assert_eq!(max, MAX_FRAME_LENGTH - header_size(1));
        assert_eq!(encode(&header, &vec![0; max]).unwrap().len(), MAX_FRAME_LENGTH);
        assert_eq!(
            encode(&header, &vec![0; max + 1]),
            Err(FrameError::TooLarge { size: MAX_FRAME_LENGTH + 1 })
        );
        assert_eq!(max_payload(0), 247);
        assert_eq!(max_payload(64), 0);
    }

    #[test]
    fn addressing() {
        let unicast = PacketHeader::unicast(PacketType::Data, 0, 1, 2, true);
        assert!(unicast.is_addressed_to(2));
        assert!(!unicast.is_addressed_to(3));
        let broadcast = PacketHeader::broadcast(PacketType::Data, 0, 1, false);
        assert!(broadcast.is_addressed_to(3));
    }

    #[test]
    fn options_bits() {
        assert!(!PacketOptions::new(false).get_acknowledgment());
        assert_eq!(u8::from(PacketOptions::new(true)), OPTIONS_ACK_BITMASK);
        assert!(PacketOptions::from(0b1000_0001).get_acknowledgment());
    }
}
