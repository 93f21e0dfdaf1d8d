//! Packet envelope, type registry and dispatch-by-type decoding

use crate::fields::HardwareType;
use crate::record::{RecordError, Timestamp, WeatherRecord};
use crate::tcp::TcpPacket;
use crate::udp::UdpPacket;
use crate::validation::{CODE_LENGTH, Code, StationId, ValidationError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// End of transmission marker terminating UDP record lists
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// Separator between text values inside image packets
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Packet errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("{packet_type} packets are not valid over {class}")]
    WrongTransport {
        packet_type: PacketType,
        class: TransportClass,
    },

    #[error("{packet_type} packet truncated: need {needed} bytes, have {available}")]
    Truncated {
        packet_type: PacketType,
        needed: usize,
        available: usize,
    },

    #[error("{packet_type} packet declares {declared} bytes but {actual} were supplied")]
    LengthMismatch {
        packet_type: PacketType,
        declared: usize,
        actual: usize,
    },

    #[error("Malformed {packet_type} packet: {reason}")]
    Malformed {
        packet_type: PacketType,
        reason: String,
    },

    #[error("{packet_type} packet too large: {size} bytes (max: {max})")]
    TooLarge {
        packet_type: PacketType,
        size: usize,
        max: usize,
    },

    #[error("{packet_type} packet holds {count} entries (max: {max})")]
    TooManyEntries {
        packet_type: PacketType,
        count: usize,
        max: usize,
    },

    #[error("Malformed record: {0}")]
    Record(#[from] RecordError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// The two transport families a packet type can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportClass {
    /// Self-contained datagrams, full header on every packet
    Udp,
    /// Size-prefixed packets on an authenticated byte stream
    Tcp,
}

impl fmt::Display for TransportClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Tcp => f.write_str("TCP"),
        }
    }
}

/// Registered packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    StationInfoRequest = 0x01,
    StationInfoResponse = 0x02,
    UdpWeatherData = 0x03,
    UdpSampleAcknowledgement = 0x04,
    Authenticate = 0x05,
    StationInfo = 0x06,
    WeatherData = 0x07,
    SampleAcknowledgement = 0x08,
    AuthenticateFailed = 0x09,
    Image = 0x10,
    ImageAcknowledgement = 0x11,
}

/// Every registered type, in id order
pub const PACKET_REGISTRY: [PacketType; 11] = [
    PacketType::StationInfoRequest,
    PacketType::StationInfoResponse,
    PacketType::UdpWeatherData,
    PacketType::UdpSampleAcknowledgement,
    PacketType::Authenticate,
    PacketType::StationInfo,
    PacketType::WeatherData,
    PacketType::SampleAcknowledgement,
    PacketType::AuthenticateFailed,
    PacketType::Image,
    PacketType::ImageAcknowledgement,
];

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        PACKET_REGISTRY.iter().copied().find(|t| t.id() == value)
    }

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn class(self) -> TransportClass {
        match self {
            Self::StationInfoRequest
            | Self::StationInfoResponse
            | Self::UdpWeatherData
            | Self::UdpSampleAcknowledgement => TransportClass::Udp,
            _ => TransportClass::Tcp,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::StationInfoRequest => "StationInfoRequest",
            Self::StationInfoResponse => "StationInfoResponse",
            Self::UdpWeatherData => "WeatherData(UDP)",
            Self::UdpSampleAcknowledgement => "SampleAcknowledgement(UDP)",
            Self::Authenticate => "Authenticate",
            Self::StationInfo => "StationInfo",
            Self::WeatherData => "WeatherData",
            Self::SampleAcknowledgement => "SampleAcknowledgement",
            Self::AuthenticateFailed => "AuthenticateFailed",
            Self::Image => "Image",
            Self::ImageAcknowledgement => "ImageAcknowledgement",
        }
    }

    /// Look up a raw type byte, checking it belongs to `class`
    pub fn lookup(value: u8, class: TransportClass) -> Result<Self, PacketError> {
        let packet_type = Self::from_u8(value).ok_or(PacketError::UnknownPacketType(value))?;
        if packet_type.class() != class {
            return Err(PacketError::WrongTransport { packet_type, class });
        }
        Ok(packet_type)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One packet of either transport class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Udp(UdpPacket),
    Tcp(TcpPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Udp(p) => p.packet_type(),
            Self::Tcp(p) => p.packet_type(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        match self {
            Self::Udp(p) => p.encode(),
            Self::Tcp(p) => p.encode(),
        }
    }
}

impl From<UdpPacket> for Packet {
    fn from(packet: UdpPacket) -> Self {
        Self::Udp(packet)
    }
}

impl From<TcpPacket> for Packet {
    fn from(packet: TcpPacket) -> Self {
        Self::Tcp(packet)
    }
}

/// Decode a complete packet received over `class`.
///
/// The first byte selects the decoder. Unregistered types and types that
/// belong to the other transport class are errors; the caller is expected to
/// log and drop them.
pub fn decode_packet(data: &[u8], class: TransportClass) -> Result<Packet, PacketError> {
    let type_byte = *data.first().ok_or(PacketError::Empty)?;

    let packet_type = PacketType::lookup(type_byte, class)?;

    match class {
        TransportClass::Udp => UdpPacket::decode_as(packet_type, data).map(Packet::Udp),
        TransportClass::Tcp => TcpPacket::decode_as(packet_type, data).map(Packet::Tcp),
    }
}

/// Station identity entry: code, hardware and session id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationEntry {
    pub code: Code,
    pub hardware: HardwareType,
    pub station_id: StationId,
}

impl StationEntry {
    pub const SIZE: usize = CODE_LENGTH + 2;

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.code.to_wire());
        buf.put_u8(self.hardware.id());
        buf.put_u8(self.station_id.get());
    }

    pub(crate) fn decode_from(buf: &mut &[u8], packet_type: PacketType) -> Result<Self, PacketError> {
        let code = read_code(buf)?;
        let hw = buf.get_u8();
        let hardware = HardwareType::from_id(hw).ok_or_else(|| PacketError::Malformed {
            packet_type,
            reason: format!("unknown hardware type 0x{hw:02x} for station {code}"),
        })?;
        let station_id = StationId::new(buf.get_u8());
        Ok(Self {
            code,
            hardware,
            station_id,
        })
    }
}

/// Server acknowledgement of one stored sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleAck {
    pub timestamp: Timestamp,
    pub station_id: StationId,
}

impl SampleAck {
    pub const SIZE: usize = 5;

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.timestamp.as_unix());
        buf.put_u8(self.station_id.get());
    }

    pub(crate) fn decode_from(buf: &mut &[u8]) -> Self {
        let timestamp = Timestamp::from_unix(buf.get_u32());
        let station_id = StationId::new(buf.get_u8());
        Self {
            timestamp,
            station_id,
        }
    }
}

pub(crate) fn read_code(buf: &mut &[u8]) -> Result<Code, PacketError> {
    let mut raw = [0u8; CODE_LENGTH];
    buf.copy_to_slice(&mut raw);
    Ok(Code::from_wire(&raw)?)
}

pub(crate) fn ensure_len(
    packet_type: PacketType,
    data: &[u8],
    needed: usize,
) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            packet_type,
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

/// Append records as `u16 length | record` frames
pub(crate) fn encode_record_frames(
    packet_type: PacketType,
    records: &[WeatherRecord],
    buf: &mut BytesMut,
) -> Result<(), PacketError> {
    for record in records {
        let size = record.encoded_size();
        if size > u16::MAX as usize {
            return Err(PacketError::TooLarge {
                packet_type,
                size,
                max: u16::MAX as usize,
            });
        }
        buf.put_u16(size as u16);
        record.encode_into(buf);
    }
    Ok(())
}

/// Encoded size of `record` as a frame inside a weather data packet
pub fn record_frame_size(record: &WeatherRecord) -> usize {
    2 + record.encoded_size()
}

pub(crate) fn decode_record_frames(
    packet_type: PacketType,
    mut buf: &[u8],
) -> Result<Vec<WeatherRecord>, PacketError> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(PacketError::Malformed {
                packet_type,
                reason: "dangling byte after last record".into(),
            });
        }
        let len = buf.get_u16() as usize;
        if buf.len() < len {
            return Err(PacketError::Malformed {
                packet_type,
                reason: format!("record frame declares {len} bytes, {} remain", buf.len()),
            });
        }
        records.push(WeatherRecord::decode(&buf[..len])?);
        buf.advance(len);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpPacket;
    use crate::udp::{UdpHeader, UdpPacket};

    #[test]
    fn test_registry_classes() {
        for t in PACKET_REGISTRY {
            assert_eq!(PacketType::from_u8(t.id()), Some(t));
        }
        assert_eq!(PacketType::StationInfoRequest.class(), TransportClass::Udp);
        assert_eq!(PacketType::Image.class(), TransportClass::Tcp);
        assert_eq!(PacketType::from_u8(0x0A), None);
        assert_eq!(PacketType::from_u8(0x00), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            decode_packet(&[0x42, 0x00], TransportClass::Tcp),
            Err(PacketError::UnknownPacketType(0x42))
        );
        assert_eq!(decode_packet(&[], TransportClass::Udp), Err(PacketError::Empty));
    }

    #[test]
    fn test_wrong_transport_rejected() {
        let udp = UdpPacket::StationInfoRequest {
            header: UdpHeader::new(1, 42),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            decode_packet(&udp, TransportClass::Tcp),
            Err(PacketError::WrongTransport { .. })
        ));

        let tcp = TcpPacket::AuthenticateFailed.encode().unwrap();
        assert!(matches!(
            decode_packet(&tcp, TransportClass::Udp),
            Err(PacketError::WrongTransport { .. })
        ));
    }

    #[test]
    fn test_dispatch_by_type() {
        let encoded = TcpPacket::Authenticate { auth_code: 42 }.encode().unwrap();
        let packet = decode_packet(&encoded, TransportClass::Tcp).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Authenticate);
        assert_eq!(packet, Packet::Tcp(TcpPacket::Authenticate { auth_code: 42 }));
    }
}
