//! Weather records - live updates and archived samples

use crate::fields::{FieldList, HardwareType, RecordKind};
use crate::validation::{RecordType, SequenceId, StationId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Record type tag for live records
pub const LIVE_RECORD: RecordType = RecordType::new(0x01);

/// Record type tag for sample records
pub const SAMPLE_RECORD: RecordType = RecordType::new(0x02);

/// Malformed record errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown record type 0x{0:02x}")]
    UnknownRecordType(u8),

    #[error("Field {field_id} is not defined for {hardware} records")]
    UndefinedField {
        field_id: u8,
        hardware: HardwareType,
    },

    #[error("Field data length mismatch: bitmask accounts for {expected} bytes, record has {actual}")]
    FieldDataMismatch { expected: usize, actual: usize },
}

/// Point in time, whole seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u32);

impl Timestamp {
    pub const fn from_unix(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_unix(self) -> u32 {
        self.0
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self(secs.min(u32::MAX as u64) as u32)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_secs(ts.0 as u64)
    }
}

/// Live conditions update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDataRecord {
    pub station_id: StationId,

    /// Identifies this live update; wraps at 65535
    pub sequence_id: SequenceId,

    pub field_list: FieldList,

    /// Encoded values of the fields in `field_list`, ascending by id
    pub field_data: Bytes,
}

impl LiveDataRecord {
    /// Type + station + sequence + bitmask
    pub const HEADER_SIZE: usize = 8;

    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.field_data.len()
    }
}

/// Archived sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDataRecord {
    pub station_id: StationId,

    /// When the sample was taken
    pub timestamp: Timestamp,

    /// When the sample was downloaded from the station hardware
    pub download_timestamp: Timestamp,

    pub field_list: FieldList,

    pub field_data: Bytes,
}

impl SampleDataRecord {
    /// Type + station + two timestamps + bitmask
    pub const HEADER_SIZE: usize = 14;

    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.field_data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeatherRecord {
    Live(LiveDataRecord),
    Sample(SampleDataRecord),
}

impl WeatherRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Live(_) => LIVE_RECORD,
            Self::Sample(_) => SAMPLE_RECORD,
        }
    }

    pub fn station_id(&self) -> StationId {
        match self {
            Self::Live(r) => r.station_id,
            Self::Sample(r) => r.station_id,
        }
    }

    pub fn field_list(&self) -> FieldList {
        match self {
            Self::Live(r) => r.field_list,
            Self::Sample(r) => r.field_list,
        }
    }

    pub fn field_data(&self) -> &Bytes {
        match self {
            Self::Live(r) => &r.field_data,
            Self::Sample(r) => &r.field_data,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Live(_) => RecordKind::Live,
            Self::Sample(_) => RecordKind::Sample,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Live(r) => r.encoded_size(),
            Self::Sample(r) => r.encoded_size(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.record_type().get());
        match self {
            Self::Live(r) => {
                buf.put_u8(r.station_id.get());
                buf.put_u16(r.sequence_id.get());
                buf.put_u32(r.field_list.bits());
                buf.put_slice(&r.field_data);
            }
            Self::Sample(r) => {
                buf.put_u8(r.station_id.get());
                buf.put_u32(r.timestamp.as_unix());
                buf.put_u32(r.download_timestamp.as_unix());
                buf.put_u32(r.field_list.bits());
                buf.put_slice(&r.field_data);
            }
        }
    }

    /// Decode one record occupying all of `data`.
    ///
    /// Without a layout the exact field widths are unknown, but every field
    /// takes at least one byte, so a bitmask naming more fields than there
    /// are bytes left is rejected.
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        let mut buf = data;
        if buf.is_empty() {
            return Err(RecordError::Truncated {
                needed: 1,
                available: 0,
            });
        }

        let record_type = buf[0];
        let header_size = match RecordType::new(record_type) {
            LIVE_RECORD => LiveDataRecord::HEADER_SIZE,
            SAMPLE_RECORD => SampleDataRecord::HEADER_SIZE,
            _ => return Err(RecordError::UnknownRecordType(record_type)),
        };

        if data.len() < header_size {
            return Err(RecordError::Truncated {
                needed: header_size,
                available: data.len(),
            });
        }

        buf.advance(1);
        let station_id = StationId::new(buf.get_u8());

        let record = if record_type == LIVE_RECORD.get() {
            let sequence_id = SequenceId::new(buf.get_u16());
            let field_list = FieldList::from_bits(buf.get_u32());
            check_minimum_data(field_list, buf.remaining(), header_size)?;
            Self::Live(LiveDataRecord {
                station_id,
                sequence_id,
                field_list,
                field_data: Bytes::copy_from_slice(buf),
            })
        } else {
            let timestamp = Timestamp::from_unix(buf.get_u32());
            let download_timestamp = Timestamp::from_unix(buf.get_u32());
            let field_list = FieldList::from_bits(buf.get_u32());
            check_minimum_data(field_list, buf.remaining(), header_size)?;
            Self::Sample(SampleDataRecord {
                station_id,
                timestamp,
                download_timestamp,
                field_list,
                field_data: Bytes::copy_from_slice(buf),
            })
        };

        Ok(record)
    }
}

fn check_minimum_data(list: FieldList, remaining: usize, header: usize) -> Result<(), RecordError> {
    if remaining < list.len() {
        return Err(RecordError::Truncated {
            needed: header + list.len(),
            available: header + remaining,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(field_ids: &[u8], data: &[u8]) -> WeatherRecord {
        WeatherRecord::Sample(SampleDataRecord {
            station_id: StationId::new(3),
            timestamp: Timestamp::from_unix(1_442_136_671),
            download_timestamp: Timestamp::from_unix(1_442_136_700),
            field_list: FieldList::from_ids(field_ids.iter().copied()).unwrap(),
            field_data: Bytes::copy_from_slice(data),
        })
    }

    #[test]
    fn test_live_layout() {
        let record = WeatherRecord::Live(LiveDataRecord {
            station_id: StationId::new(7),
            sequence_id: SequenceId::new(0x0102),
            field_list: FieldList::from_ids([2]).unwrap(),
            field_data: Bytes::from_static(&[55]),
        });

        let encoded = record.encode();
        assert_eq!(&encoded[..], &[0x01, 7, 0x01, 0x02, 0, 0, 0, 0x04, 55]);
        assert_eq!(WeatherRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_sample_roundtrip() {
        let record = sample(&[1, 3, 5], b"\x00\x00\x00\x01\x00\x10\x40");
        let encoded = record.encode();
        assert_eq!(encoded.len(), 14 + 7);
        assert_eq!(WeatherRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_truncated_header() {
        let encoded = sample(&[], b"").encode();
        assert!(matches!(
            WeatherRecord::decode(&encoded[..10]),
            Err(RecordError::Truncated { needed: 14, available: 10 })
        ));
        assert!(WeatherRecord::decode(&[]).is_err());
    }

    #[test]
    fn test_bitmask_exceeds_data() {
        let encoded = sample(&[1, 2, 3], b"ab").encode();
        assert!(matches!(
            WeatherRecord::decode(&encoded),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_record_type() {
        let mut encoded = sample(&[], b"").encode().to_vec();
        encoded[0] = 0x09;
        assert_eq!(
            WeatherRecord::decode(&encoded),
            Err(RecordError::UnknownRecordType(0x09))
        );
    }

    #[test]
    fn test_timestamp_system_time() {
        let ts = Timestamp::from_unix(1_442_136_671);
        let time: SystemTime = ts.into();
        assert_eq!(Timestamp::from(time), ts);
    }

    fn arb_record() -> impl Strategy<Value = WeatherRecord> {
        let live = (any::<u8>(), any::<u16>(), any::<u32>(), prop::collection::vec(any::<u8>(), 32..96))
            .prop_map(|(station, seq, bits, data)| {
                WeatherRecord::Live(LiveDataRecord {
                    station_id: StationId::new(station),
                    sequence_id: SequenceId::new(seq),
                    field_list: FieldList::from_bits(bits),
                    field_data: Bytes::from(data),
                })
            });
        let sample = (
            any::<u8>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            prop::collection::vec(any::<u8>(), 32..96),
        )
            .prop_map(|(station, ts, dl, bits, data)| {
                WeatherRecord::Sample(SampleDataRecord {
                    station_id: StationId::new(station),
                    timestamp: Timestamp::from_unix(ts),
                    download_timestamp: Timestamp::from_unix(dl),
                    field_list: FieldList::from_bits(bits),
                    field_data: Bytes::from(data),
                })
            });
        prop_oneof![live, sample]
    }

    proptest! {
        #[test]
        fn prop_encoded_size_matches(record in arb_record()) {
            let encoded = record.encode();
            prop_assert_eq!(encoded.len(), record.encoded_size());
            prop_assert_eq!(WeatherRecord::decode(&encoded).unwrap(), record);
        }

        #[test]
        fn prop_field_list_preserved(ids in prop::collection::btree_set(0u8..32, 0..32)) {
            let sorted: Vec<u8> = ids.into_iter().collect();
            let list = FieldList::from_ids(sorted.iter().copied()).unwrap();
            prop_assert_eq!(list.ids().collect::<Vec<_>>(), sorted);
        }
    }
}
