//! Datagram framing for UDP-class packets
//!
//! One packet per datagram. The framer stamps each outgoing packet with the
//! sender's sequence number and authorisation code and refuses anything that
//! would not fit in one datagram.

use bytes::Bytes;
use tracing::debug;
use wxpush_protocol::{
    PacketError, PacketSequencer, SampleAck, UDP_HEADER_SIZE, UdpHeader, UdpPacket, WeatherRecord,
    record_frame_size,
};

use crate::FramingError;

/// Conservative payload size that avoids IP fragmentation on most links
pub const DEFAULT_MTU: usize = 1400;

#[derive(Debug)]
pub struct UdpFramer {
    mtu: usize,
    auth_code: u64,
    sequencer: PacketSequencer,
}

impl UdpFramer {
    pub fn new(auth_code: u64, mtu: usize) -> Self {
        Self {
            mtu,
            auth_code,
            sequencer: PacketSequencer::new(),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn auth_code(&self) -> u64 {
        self.auth_code
    }

    /// Restart sequence numbering for a new session
    pub fn reset(&mut self) {
        self.sequencer.reset();
    }

    /// Stamp the header and encode, enforcing the MTU
    pub fn encode(&mut self, mut packet: UdpPacket) -> Result<Bytes, FramingError> {
        let size = packet.encoded_size();
        if size > self.mtu {
            return Err(FramingError::Encode(PacketError::TooLarge {
                packet_type: packet.packet_type(),
                size,
                max: self.mtu,
            }));
        }

        *packet.header_mut() = UdpHeader::new(self.sequencer.advance(), self.auth_code);
        packet.encode().map_err(FramingError::Encode)
    }

    pub fn station_info_request(&mut self) -> Result<Bytes, FramingError> {
        self.encode(UdpPacket::StationInfoRequest {
            header: UdpHeader::default(),
        })
    }

    /// Encode records into as few datagrams as fit
    pub fn weather_data(&mut self, records: Vec<WeatherRecord>) -> Result<Vec<Bytes>, FramingError> {
        let batches = self.batch_records(records)?;
        let mut datagrams = Vec::with_capacity(batches.len());
        for records in batches {
            datagrams.push(self.encode(UdpPacket::WeatherData {
                header: UdpHeader::default(),
                records,
            })?);
        }
        Ok(datagrams)
    }

    /// Split records into groups that each fit one datagram, preserving order
    pub fn batch_records(
        &self,
        records: Vec<WeatherRecord>,
    ) -> Result<Vec<Vec<WeatherRecord>>, FramingError> {
        let capacity = self.mtu.saturating_sub(UDP_HEADER_SIZE);
        let mut batches: Vec<Vec<WeatherRecord>> = Vec::new();
        let mut current = Vec::new();
        let mut used = 0;

        for record in records {
            let size = record_frame_size(&record);
            if size > capacity {
                return Err(FramingError::Encode(PacketError::TooLarge {
                    packet_type: wxpush_protocol::PacketType::UdpWeatherData,
                    size: size + UDP_HEADER_SIZE,
                    max: self.mtu,
                }));
            }
            if used + size > capacity {
                batches.push(std::mem::take(&mut current));
                used = 0;
            }
            used += size;
            current.push(record);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        debug!(batches = batches.len(), "Batched weather records");
        Ok(batches)
    }

    /// Acknowledgements that fit in one SampleAcknowledgement datagram
    pub fn acks_per_datagram(&self) -> usize {
        // header, lost count, terminator
        self.mtu.saturating_sub(UDP_HEADER_SIZE + 2) / SampleAck::SIZE
    }

    /// Decode one received datagram
    pub fn decode(datagram: &[u8]) -> Result<UdpPacket, PacketError> {
        UdpPacket::decode(datagram)
    }
}
