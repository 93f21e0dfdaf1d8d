//! UDP packets
//!
//! Every datagram carries the full header:
//!
//! ```text
//! +--------+----------+----------------------+------------------------------+
//! | type   | reserved | sequence (u32)       | authorisation code (u64)     |
//! +--------+----------+----------------------+------------------------------+
//! ```

use crate::packet::{
    END_OF_TRANSMISSION, PacketError, PacketType, SampleAck, StationEntry, decode_record_frames,
    encode_record_frames, ensure_len,
};
use crate::record::WeatherRecord;
use crate::validation::LostLiveCount;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Type + reserved + sequence + authorisation code
pub const UDP_HEADER_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpHeader {
    /// Per-sender counter, reset on reconnect
    pub sequence: u32,

    /// Shared-secret credential, repeated in every datagram
    pub auth_code: u64,
}

impl UdpHeader {
    pub const fn new(sequence: u32, auth_code: u64) -> Self {
        Self {
            sequence,
            auth_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpPacket {
    /// Ask the server for the station identity table
    StationInfoRequest { header: UdpHeader },

    /// Station identity table, terminated by 0x04
    StationInfoResponse {
        header: UdpHeader,
        stations: Vec<StationEntry>,
    },

    /// One or more weather records
    WeatherData {
        header: UdpHeader,
        records: Vec<WeatherRecord>,
    },

    /// Samples committed by the server, plus recent live loss
    SampleAcknowledgement {
        header: UdpHeader,
        lost_live_records: LostLiveCount,
        acks: Vec<SampleAck>,
    },
}

impl UdpPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::StationInfoRequest { .. } => PacketType::StationInfoRequest,
            Self::StationInfoResponse { .. } => PacketType::StationInfoResponse,
            Self::WeatherData { .. } => PacketType::UdpWeatherData,
            Self::SampleAcknowledgement { .. } => PacketType::UdpSampleAcknowledgement,
        }
    }

    pub fn header(&self) -> &UdpHeader {
        match self {
            Self::StationInfoRequest { header }
            | Self::StationInfoResponse { header, .. }
            | Self::WeatherData { header, .. }
            | Self::SampleAcknowledgement { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut UdpHeader {
        match self {
            Self::StationInfoRequest { header }
            | Self::StationInfoResponse { header, .. }
            | Self::WeatherData { header, .. }
            | Self::SampleAcknowledgement { header, .. } => header,
        }
    }

    /// Exact encoded size
    pub fn encoded_size(&self) -> usize {
        UDP_HEADER_SIZE
            + match self {
                Self::StationInfoRequest { .. } => 0,
                Self::StationInfoResponse { stations, .. } => stations.len() * StationEntry::SIZE + 1,
                Self::WeatherData { records, .. } => {
                    records.iter().map(crate::packet::record_frame_size).sum()
                }
                Self::SampleAcknowledgement { acks, .. } => 1 + acks.len() * SampleAck::SIZE + 1,
            }
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        let header = self.header();

        buf.put_u8(self.packet_type().id());
        buf.put_u8(0);
        buf.put_u32(header.sequence);
        buf.put_u64(header.auth_code);

        match self {
            Self::StationInfoRequest { .. } => {}
            Self::StationInfoResponse { stations, .. } => {
                for station in stations {
                    station.encode_into(&mut buf);
                }
                buf.put_u8(END_OF_TRANSMISSION);
            }
            Self::WeatherData { records, .. } => {
                encode_record_frames(self.packet_type(), records, &mut buf)?;
            }
            Self::SampleAcknowledgement {
                lost_live_records,
                acks,
                ..
            } => {
                buf.put_u8(lost_live_records.get());
                for ack in acks {
                    ack.encode_into(&mut buf);
                }
                buf.put_u8(END_OF_TRANSMISSION);
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let type_byte = *data.first().ok_or(PacketError::Empty)?;
        let packet_type =
            PacketType::lookup(type_byte, crate::packet::TransportClass::Udp)?;
        Self::decode_as(packet_type, data)
    }

    pub(crate) fn decode_as(packet_type: PacketType, data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(packet_type, data, UDP_HEADER_SIZE)?;

        let mut buf = &data[2..];
        let header = UdpHeader {
            sequence: buf.get_u32(),
            auth_code: buf.get_u64(),
        };

        let packet = match packet_type {
            PacketType::StationInfoRequest => Self::StationInfoRequest { header },
            PacketType::StationInfoResponse => {
                let mut stations = Vec::new();
                loop {
                    match buf {
                        [END_OF_TRANSMISSION] => break,
                        [] => {
                            return Err(PacketError::Malformed {
                                packet_type,
                                reason: "missing end of transmission marker".into(),
                            });
                        }
                        rest if rest.len() < StationEntry::SIZE => {
                            return Err(PacketError::Truncated {
                                packet_type,
                                needed: data.len() - rest.len() + StationEntry::SIZE,
                                available: data.len(),
                            });
                        }
                        _ => stations.push(StationEntry::decode_from(&mut buf, packet_type)?),
                    }
                }
                Self::StationInfoResponse { header, stations }
            }
            PacketType::UdpWeatherData => Self::WeatherData {
                header,
                records: decode_record_frames(packet_type, buf)?,
            },
            PacketType::UdpSampleAcknowledgement => {
                ensure_len(packet_type, data, UDP_HEADER_SIZE + 2)?;
                let lost_live_records = LostLiveCount::new(buf.get_u8());
                let mut acks = Vec::new();
                loop {
                    match buf {
                        [END_OF_TRANSMISSION] => break,
                        [] => {
                            return Err(PacketError::Malformed {
                                packet_type,
                                reason: "missing end of transmission marker".into(),
                            });
                        }
                        rest if rest.len() < SampleAck::SIZE => {
                            return Err(PacketError::Truncated {
                                packet_type,
                                needed: data.len() - rest.len() + SampleAck::SIZE,
                                available: data.len(),
                            });
                        }
                        _ => acks.push(SampleAck::decode_from(&mut buf)),
                    }
                }
                Self::SampleAcknowledgement {
                    header,
                    lost_live_records,
                    acks,
                }
            }
            other => {
                return Err(PacketError::WrongTransport {
                    packet_type: other,
                    class: crate::packet::TransportClass::Udp,
                });
            }
        };

        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldList, HardwareType};
    use crate::record::{LiveDataRecord, SampleDataRecord, Timestamp};
    use crate::validation::{Code, SequenceId, StationId};

    fn header() -> UdpHeader {
        UdpHeader::new(7, 10_000_000_042)
    }

    #[test]
    fn test_header_layout() {
        let encoded = UdpPacket::StationInfoRequest { header: header() }
            .encode()
            .unwrap();
        assert_eq!(encoded.len(), UDP_HEADER_SIZE);
        assert_eq!(encoded[0], 0x01);
        assert_eq!(encoded[1], 0x00);
        assert_eq!(&encoded[2..6], &7u32.to_be_bytes());
        assert_eq!(&encoded[6..14], &10_000_000_042u64.to_be_bytes());
    }

    #[test]
    fn test_station_info_response() {
        let packet = UdpPacket::StationInfoResponse {
            header: header(),
            stations: vec![
                StationEntry {
                    code: Code::new("rua").unwrap(),
                    hardware: HardwareType::Davis,
                    station_id: StationId::new(0),
                },
                StationEntry {
                    code: Code::new("hsb").unwrap(),
                    hardware: HardwareType::Fowh1080,
                    station_id: StationId::new(1),
                },
            ],
        };

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), packet.encoded_size());
        assert_eq!(*encoded.last().unwrap(), END_OF_TRANSMISSION);
        assert_eq!(UdpPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_station_info_missing_terminator() {
        let packet = UdpPacket::StationInfoResponse {
            header: header(),
            stations: vec![],
        };
        let encoded = packet.encode().unwrap();
        assert_eq!(UdpPacket::decode(&encoded).unwrap(), packet);
        assert!(matches!(
            UdpPacket::decode(&encoded[..UDP_HEADER_SIZE]),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn test_weather_data_mixed_records() {
        let packet = UdpPacket::WeatherData {
            header: header(),
            records: vec![
                WeatherRecord::Live(LiveDataRecord {
                    station_id: StationId::new(1),
                    sequence_id: SequenceId::new(65535),
                    field_list: FieldList::from_ids([4, 5]).unwrap(),
                    field_data: Bytes::from_static(&[0, 200, 81]),
                }),
                WeatherRecord::Sample(SampleDataRecord {
                    station_id: StationId::new(1),
                    timestamp: Timestamp::from_unix(1_700_000_000),
                    download_timestamp: Timestamp::from_unix(1_700_000_010),
                    field_list: FieldList::from_ids([11]).unwrap(),
                    field_data: Bytes::from_static(&[0, 3]),
                }),
            ],
        };

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), packet.encoded_size());
        assert_eq!(UdpPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_sample_acknowledgement() {
        let packet = UdpPacket::SampleAcknowledgement {
            header: header(),
            lost_live_records: LostLiveCount::new(12),
            acks: vec![SampleAck {
                timestamp: Timestamp::from_unix(1_700_000_000),
                station_id: StationId::new(3),
            }],
        };

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded[UDP_HEADER_SIZE], 12);
        assert_eq!(UdpPacket::decode(&encoded).unwrap(), packet);

        // Chop the final ack in half
        let mut broken = encoded[..UDP_HEADER_SIZE + 3].to_vec();
        broken.push(END_OF_TRANSMISSION);
        assert!(UdpPacket::decode(&broken).is_err());
    }

    #[test]
    fn test_truncated_header() {
        let encoded = UdpPacket::StationInfoRequest { header: header() }
            .encode()
            .unwrap();
        assert!(matches!(
            UdpPacket::decode(&encoded[..9]),
            Err(PacketError::Truncated { needed: 14, available: 9, .. })
        ));
    }
}
