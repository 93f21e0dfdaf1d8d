//! TCP packets and stream sizing
//!
//! TCP packets start with a two byte header (type, reserved). Their length is
//! not known up front: a receiver first needs
//! [`packet_size_bytes_required`] bytes, then [`packet_size`] tells it how
//! many bytes the whole packet occupies.

use crate::packet::{
    PacketError, PacketType, RECORD_SEPARATOR, SampleAck, StationEntry, TransportClass,
    decode_record_frames, encode_record_frames, ensure_len, read_code, record_frame_size,
};
use crate::record::{Timestamp, WeatherRecord};
use crate::validation::{CODE_LENGTH, Code};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Type + reserved
pub const TCP_HEADER_SIZE: usize = 2;

/// Largest WeatherData packet; the length field is 16 bits
pub const MAX_WEATHER_DATA_SIZE: usize = u16::MAX as usize;

/// Entry counts are a single byte
pub const MAX_ENTRIES: usize = u8::MAX as usize;

const AUTHENTICATE_SIZE: usize = TCP_HEADER_SIZE + 8;
const CODE_MAP_SIZE: usize = CODE_LENGTH + 1;
const IMAGE_ACK_SIZE: usize = 6;
/// total length + type + source + timestamp + text length
const IMAGE_PAYLOAD_HEADER_SIZE: usize = 14;

/// Code to session id mapping for image types and image sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMapping {
    pub code: Code,
    pub id: u8,
}

/// Identity snapshot sent after a successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StationInfo {
    pub stations: Vec<StationEntry>,
    pub image_types: Vec<CodeMapping>,
    pub image_sources: Vec<CodeMapping>,
}

/// A single image with its descriptive text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePacket {
    pub image_type_id: u8,
    pub image_source_id: u8,
    pub timestamp: Timestamp,
    pub title: String,
    pub description: String,
    pub mime_type: String,
    pub metadata: String,
    pub data: Bytes,
}

impl ImagePacket {
    fn text_section(&self) -> Result<Vec<u8>, PacketError> {
        let parts = [&self.title, &self.description, &self.mime_type, &self.metadata];
        if parts.iter().any(|p| p.as_bytes().contains(&RECORD_SEPARATOR)) {
            return Err(PacketError::Malformed {
                packet_type: PacketType::Image,
                reason: "text field contains the 0x1E separator".into(),
            });
        }

        let mut text = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                text.push(RECORD_SEPARATOR);
            }
            text.extend_from_slice(part.as_bytes());
        }
        Ok(text)
    }
}

/// Server acknowledgement of one stored image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageAck {
    pub timestamp: Timestamp,
    pub image_source_id: u8,
    pub image_type_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpPacket {
    /// First packet on every connection
    Authenticate { auth_code: u64 },

    StationInfo(StationInfo),

    WeatherData { records: Vec<WeatherRecord> },

    SampleAcknowledgement { acks: Vec<SampleAck> },

    AuthenticateFailed,

    Image(ImagePacket),

    ImageAcknowledgement { acks: Vec<ImageAck> },
}

impl TcpPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Authenticate { .. } => PacketType::Authenticate,
            Self::StationInfo(_) => PacketType::StationInfo,
            Self::WeatherData { .. } => PacketType::WeatherData,
            Self::SampleAcknowledgement { .. } => PacketType::SampleAcknowledgement,
            Self::AuthenticateFailed => PacketType::AuthenticateFailed,
            Self::Image(_) => PacketType::Image,
            Self::ImageAcknowledgement { .. } => PacketType::ImageAcknowledgement,
        }
    }

    /// Size of a weather data packet holding `records`
    pub fn weather_data_size(records: &[WeatherRecord]) -> usize {
        TCP_HEADER_SIZE + 2 + records.iter().map(record_frame_size).sum::<usize>()
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let packet_type = self.packet_type();
        let mut buf = BytesMut::new();
        buf.put_u8(packet_type.id());
        buf.put_u8(0);

        match self {
            Self::Authenticate { auth_code } => buf.put_u64(*auth_code),
            Self::AuthenticateFailed => {}
            Self::StationInfo(info) => {
                check_count(packet_type, info.stations.len())?;
                check_count(packet_type, info.image_types.len())?;
                check_count(packet_type, info.image_sources.len())?;

                buf.put_u8(info.stations.len() as u8);
                buf.put_u8(info.image_types.len() as u8);
                buf.put_u8(info.image_sources.len() as u8);
                for station in &info.stations {
                    station.encode_into(&mut buf);
                }
                for mapping in info.image_types.iter().chain(&info.image_sources) {
                    buf.put_slice(&mapping.code.to_wire());
                    buf.put_u8(mapping.id);
                }
            }
            Self::WeatherData { records } => {
                let size = Self::weather_data_size(records);
                if size > MAX_WEATHER_DATA_SIZE {
                    return Err(PacketError::TooLarge {
                        packet_type,
                        size,
                        max: MAX_WEATHER_DATA_SIZE,
                    });
                }
                buf.reserve(size);
                buf.put_u16(size as u16);
                encode_record_frames(packet_type, records, &mut buf)?;
            }
            Self::SampleAcknowledgement { acks } => {
                check_count(packet_type, acks.len())?;
                buf.put_u8(acks.len() as u8);
                for ack in acks {
                    ack.encode_into(&mut buf);
                }
            }
            Self::Image(image) => {
                let text = image.text_section()?;
                let size = TCP_HEADER_SIZE + IMAGE_PAYLOAD_HEADER_SIZE + text.len() + image.data.len();
                if size > u32::MAX as usize {
                    return Err(PacketError::TooLarge {
                        packet_type,
                        size,
                        max: u32::MAX as usize,
                    });
                }
                buf.reserve(size);
                buf.put_u32(size as u32);
                buf.put_u8(image.image_type_id);
                buf.put_u8(image.image_source_id);
                buf.put_u32(image.timestamp.as_unix());
                buf.put_u32(text.len() as u32);
                buf.put_slice(&text);
                buf.put_slice(&image.data);
            }
            Self::ImageAcknowledgement { acks } => {
                check_count(packet_type, acks.len())?;
                buf.put_u8(acks.len() as u8);
                for ack in acks {
                    buf.put_u32(ack.timestamp.as_unix());
                    buf.put_u8(ack.image_source_id);
                    buf.put_u8(ack.image_type_id);
                }
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let type_byte = *data.first().ok_or(PacketError::Empty)?;
        let packet_type = PacketType::lookup(type_byte, TransportClass::Tcp)?;
        Self::decode_as(packet_type, data)
    }

    /// Decode one complete packet. `data` must hold exactly the packet.
    pub(crate) fn decode_as(packet_type: PacketType, data: &[u8]) -> Result<Self, PacketError> {
        let required = required_for(packet_type)?;
        ensure_len(packet_type, data, required)?;

        let declared = size_from_header(packet_type, data)?;
        if declared != data.len() {
            return Err(PacketError::LengthMismatch {
                packet_type,
                declared,
                actual: data.len(),
            });
        }

        let mut buf = &data[TCP_HEADER_SIZE..];

        let packet = match packet_type {
            PacketType::Authenticate => Self::Authenticate {
                auth_code: buf.get_u64(),
            },
            PacketType::AuthenticateFailed => Self::AuthenticateFailed,
            PacketType::StationInfo => {
                let station_count = buf.get_u8() as usize;
                let type_count = buf.get_u8() as usize;
                let source_count = buf.get_u8() as usize;

                let mut info = StationInfo::default();
                for _ in 0..station_count {
                    info.stations
                        .push(StationEntry::decode_from(&mut buf, packet_type)?);
                }
                for _ in 0..type_count {
                    info.image_types.push(read_mapping(&mut buf)?);
                }
                for _ in 0..source_count {
                    info.image_sources.push(read_mapping(&mut buf)?);
                }
                Self::StationInfo(info)
            }
            PacketType::WeatherData => {
                buf.advance(2);
                Self::WeatherData {
                    records: decode_record_frames(packet_type, buf)?,
                }
            }
            PacketType::SampleAcknowledgement => {
                let count = buf.get_u8() as usize;
                let acks = (0..count).map(|_| SampleAck::decode_from(&mut buf)).collect();
                Self::SampleAcknowledgement { acks }
            }
            PacketType::Image => {
                buf.advance(4);
                let image_type_id = buf.get_u8();
                let image_source_id = buf.get_u8();
                let timestamp = Timestamp::from_unix(buf.get_u32());
                let text_length = buf.get_u32() as usize;
                if text_length > buf.len() {
                    return Err(PacketError::Malformed {
                        packet_type,
                        reason: format!(
                            "text length {text_length} exceeds remaining {} bytes",
                            buf.len()
                        ),
                    });
                }

                let text = &buf[..text_length];
                let parts: Vec<&[u8]> = text.split(|b| *b == RECORD_SEPARATOR).collect();
                if parts.len() != 4 {
                    return Err(PacketError::Malformed {
                        packet_type,
                        reason: format!("expected 4 text values, found {}", parts.len()),
                    });
                }
                let text_value = |raw: &[u8]| {
                    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::Malformed {
                        packet_type,
                        reason: "text is not valid UTF-8".into(),
                    })
                };

                Self::Image(ImagePacket {
                    image_type_id,
                    image_source_id,
                    timestamp,
                    title: text_value(parts[0])?,
                    description: text_value(parts[1])?,
                    mime_type: text_value(parts[2])?,
                    metadata: text_value(parts[3])?,
                    data: Bytes::copy_from_slice(&buf[text_length..]),
                })
            }
            PacketType::ImageAcknowledgement => {
                let count = buf.get_u8() as usize;
                let acks = (0..count)
                    .map(|_| ImageAck {
                        timestamp: Timestamp::from_unix(buf.get_u32()),
                        image_source_id: buf.get_u8(),
                        image_type_id: buf.get_u8(),
                    })
                    .collect();
                Self::ImageAcknowledgement { acks }
            }
            other => {
                return Err(PacketError::WrongTransport {
                    packet_type: other,
                    class: TransportClass::Tcp,
                });
            }
        };

        Ok(packet)
    }
}

fn check_count(packet_type: PacketType, count: usize) -> Result<(), PacketError> {
    if count > MAX_ENTRIES {
        return Err(PacketError::TooManyEntries {
            packet_type,
            count,
            max: MAX_ENTRIES,
        });
    }
    Ok(())
}

fn read_mapping(buf: &mut &[u8]) -> Result<CodeMapping, PacketError> {
    let code = read_code(buf)?;
    let id = buf.get_u8();
    Ok(CodeMapping { code, id })
}

fn required_for(packet_type: PacketType) -> Result<usize, PacketError> {
    let required = match packet_type {
        PacketType::Authenticate => AUTHENTICATE_SIZE,
        PacketType::AuthenticateFailed => TCP_HEADER_SIZE,
        PacketType::StationInfo => TCP_HEADER_SIZE + 3,
        PacketType::WeatherData => TCP_HEADER_SIZE + 2,
        PacketType::SampleAcknowledgement | PacketType::ImageAcknowledgement => TCP_HEADER_SIZE + 1,
        PacketType::Image => TCP_HEADER_SIZE + 4,
        other => {
            return Err(PacketError::WrongTransport {
                packet_type: other,
                class: TransportClass::Tcp,
            });
        }
    };
    Ok(required)
}

fn size_from_header(packet_type: PacketType, header: &[u8]) -> Result<usize, PacketError> {
    let mut buf = &header[TCP_HEADER_SIZE..];
    let size = match packet_type {
        PacketType::Authenticate => AUTHENTICATE_SIZE,
        PacketType::AuthenticateFailed => TCP_HEADER_SIZE,
        PacketType::StationInfo => {
            let stations = buf.get_u8() as usize;
            let maps = buf.get_u8() as usize + buf.get_u8() as usize;
            TCP_HEADER_SIZE + 3 + stations * StationEntry::SIZE + maps * CODE_MAP_SIZE
        }
        PacketType::WeatherData => buf.get_u16() as usize,
        PacketType::SampleAcknowledgement => {
            TCP_HEADER_SIZE + 1 + buf.get_u8() as usize * SampleAck::SIZE
        }
        PacketType::ImageAcknowledgement => {
            TCP_HEADER_SIZE + 1 + buf.get_u8() as usize * IMAGE_ACK_SIZE
        }
        PacketType::Image => buf.get_u32() as usize,
        other => {
            return Err(PacketError::WrongTransport {
                packet_type: other,
                class: TransportClass::Tcp,
            });
        }
    };

    // A declared length shorter than the fixed part can never be satisfied
    let minimum = match packet_type {
        PacketType::WeatherData => TCP_HEADER_SIZE + 2,
        PacketType::Image => TCP_HEADER_SIZE + IMAGE_PAYLOAD_HEADER_SIZE,
        _ => 0,
    };
    if size < minimum {
        return Err(PacketError::Malformed {
            packet_type,
            reason: format!("declared length {size} is shorter than the {minimum} byte minimum"),
        });
    }

    Ok(size)
}

/// Bytes from the start of a packet of this type needed before its full
/// size can be computed.
pub fn packet_size_bytes_required(packet_type: u8) -> Result<usize, PacketError> {
    let packet_type = PacketType::lookup(packet_type, TransportClass::Tcp)?;
    required_for(packet_type)
}

/// Full size of the packet whose first bytes are `header`.
///
/// `header` must hold at least [`packet_size_bytes_required`] bytes.
pub fn packet_size(header: &[u8]) -> Result<usize, PacketError> {
    let type_byte = *header.first().ok_or(PacketError::Empty)?;
    let packet_type = PacketType::lookup(type_byte, TransportClass::Tcp)?;
    ensure_len(packet_type, header, required_for(packet_type)?)?;
    size_from_header(packet_type, header)
}
