//! Field bitmasks and per-hardware field layouts
//!
//! A record's `field_data` is the concatenation of the fields named by its
//! 32-bit bitmask, in ascending field id order. The record codec treats that
//! blob as opaque; the layouts here know how wide each field is for a given
//! hardware type so the blob can be checked against its bitmask.

use crate::record::RecordError;
use crate::validation::{FieldId, ValidationError};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Set of field ids (0-31), carried on the wire as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldList(u32);

impl FieldList {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw ids, rejecting anything outside 0-31
    pub fn from_ids<I>(ids: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut list = Self::EMPTY;
        for id in ids {
            list.insert(FieldId::new(id)?);
        }
        Ok(list)
    }

    pub fn insert(&mut self, id: FieldId) {
        self.0 |= id.bit();
    }

    pub fn contains(self, id: FieldId) -> bool {
        self.0 & id.bit() != 0
    }

    /// Field ids in ascending order
    pub fn ids(self) -> impl Iterator<Item = u8> {
        (0..=FieldId::MAX).filter(move |id| self.0 & (1u32 << id) != 0)
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Station hardware families sharing the wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareType {
    Generic,
    Fowh1080,
    Davis,
}

impl HardwareType {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Generic),
            0x02 => Some(Self::Fowh1080),
            0x03 => Some(Self::Davis),
            _ => None,
        }
    }

    pub const fn id(self) -> u8 {
        match self {
            Self::Generic => 0x01,
            Self::Fowh1080 => 0x02,
            Self::Davis => 0x03,
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::Generic => "GENERIC",
            Self::Fowh1080 => "FOWH1080",
            Self::Davis => "DAVIS",
        }
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for HardwareType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GENERIC" => Ok(Self::Generic),
            "FOWH1080" => Ok(Self::Fowh1080),
            "DAVIS" => Ok(Self::Davis),
            other => Err(format!("unknown hardware type: {other}")),
        }
    }
}

/// Live or sample field set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Live,
    Sample,
}

/// Storage class of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Bool,
    /// Fixed-width raw bytes
    Bytes(usize),
    /// 4-byte subfield bitmap followed by the named subfields
    SubFields(&'static [FieldDef]),
}

impl FieldKind {
    /// Width in bytes, `None` for subfield sets
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 => Some(4),
            Self::Bytes(n) => Some(n),
            Self::SubFields(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub id: u8,
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn def(id: u8, name: &'static str, kind: FieldKind) -> FieldDef {
    FieldDef { id, name, kind }
}

use FieldKind::*;

const DAVIS_EXTRA_FIELDS: &[FieldDef] = &[
    def(1, "leaf_wetness_1", Int8),
    def(2, "leaf_wetness_2", Int8),
    def(3, "leaf_temperature_1", Int16),
    def(4, "leaf_temperature_2", Int16),
    def(5, "soil_moisture_1", UInt8),
    def(6, "soil_moisture_2", UInt8),
    def(7, "soil_moisture_3", UInt8),
    def(8, "soil_moisture_4", UInt8),
    def(9, "soil_temperature_1", Int16),
    def(10, "soil_temperature_2", Int16),
    def(11, "soil_temperature_3", Int16),
    def(12, "soil_temperature_4", Int16),
    def(13, "extra_temperature_1", Int16),
    def(14, "extra_temperature_2", Int16),
    def(15, "extra_temperature_3", Int16),
    def(16, "extra_humidity_1", Int8),
    def(17, "extra_humidity_2", Int8),
];

const GENERIC_LIVE_FIELDS: &[FieldDef] = &[
    def(0, "live_diff_sequence", UInt16),
    def(1, "sample_diff_timestamp", UInt32),
    def(2, "indoor_humidity", UInt8),
    def(3, "indoor_temperature", Int16),
    def(4, "temperature", Int16),
    def(5, "humidity", UInt8),
    def(6, "pressure", UInt16),
    def(7, "msl_pressure", UInt16),
    def(8, "average_wind_speed", UInt16),
    def(9, "gust_wind_speed", UInt16),
    def(10, "wind_direction", UInt16),
];

const DAVIS_LIVE_FIELDS: &[FieldDef] = &[
    def(0, "live_diff_sequence", UInt16),
    def(1, "sample_diff_timestamp", UInt32),
    def(2, "indoor_humidity", UInt8),
    def(3, "indoor_temperature", Int16),
    def(4, "temperature", Int16),
    def(5, "humidity", UInt8),
    def(6, "pressure", UInt16),
    def(7, "msl_pressure", UInt16),
    def(8, "average_wind_speed", UInt16),
    def(9, "gust_wind_speed", UInt16),
    def(10, "wind_direction", UInt16),
    def(12, "bar_trend", Int8),
    def(13, "rain_rate", UInt16),
    def(14, "storm_rain", UInt16),
    def(15, "current_storm_start_date", UInt16),
    def(16, "transmitter_battery", UInt8),
    def(17, "console_battery_voltage", UInt16),
    def(18, "forecast_icon", UInt8),
    def(19, "forecast_rule_id", UInt8),
    def(20, "uv_index", UInt8),
    def(21, "solar_radiation", UInt16),
    def(22, "average_wind_speed_2m", UInt16),
    def(23, "average_wind_speed_10m", UInt16),
    def(24, "gust_wind_speed_10m", UInt16),
    def(25, "gust_wind_direction_10m", UInt16),
    def(26, "heat_index", Int16),
    def(27, "thsw_index", Int16),
    def(28, "altimeter_setting", UInt16),
    def(31, "extra_fields", SubFields(DAVIS_EXTRA_FIELDS)),
];

const GENERIC_SAMPLE_FIELDS: &[FieldDef] = &[
    def(1, "sample_diff_timestamp", UInt32),
    def(2, "indoor_humidity", UInt8),
    def(3, "indoor_temperature", Int16),
    def(4, "temperature", Int16),
    def(5, "humidity", UInt8),
    def(6, "pressure", UInt16),
    def(7, "msl_pressure", UInt16),
    def(8, "average_wind_speed", UInt16),
    def(9, "gust_wind_speed", UInt16),
    def(10, "wind_direction", UInt16),
    def(11, "rainfall", UInt16),
];

const WH1080_SAMPLE_FIELDS: &[FieldDef] = &[
    def(1, "sample_diff_timestamp", UInt32),
    def(2, "indoor_humidity", UInt8),
    def(3, "indoor_temperature", Int16),
    def(4, "temperature", Int16),
    def(5, "humidity", UInt8),
    def(6, "pressure", UInt16),
    def(7, "msl_pressure", UInt16),
    def(8, "average_wind_speed", UInt16),
    def(9, "gust_wind_speed", UInt16),
    def(10, "wind_direction", UInt16),
    def(11, "rainfall", UInt16),
    def(12, "sample_interval", UInt8),
    def(13, "record_number", UInt16),
    def(14, "last_in_batch", Bool),
    def(15, "invalid_data", Bool),
    def(16, "wh1080_wind_direction", Bytes(3)),
    def(17, "total_rain", UInt32),
    def(18, "rain_overflow", Bool),
];

const DAVIS_SAMPLE_FIELDS: &[FieldDef] = &[
    def(1, "sample_diff_timestamp", UInt32),
    def(2, "indoor_humidity", UInt8),
    def(3, "indoor_temperature", Int16),
    def(4, "temperature", Int16),
    def(5, "humidity", UInt8),
    def(6, "pressure", UInt16),
    def(7, "msl_pressure", UInt16),
    def(8, "average_wind_speed", UInt16),
    def(9, "gust_wind_speed", UInt16),
    def(10, "wind_direction", UInt16),
    def(11, "rainfall", UInt16),
    def(12, "record_time", UInt16),
    def(13, "record_date", UInt16),
    def(14, "high_temperature", Int16),
    def(15, "low_temperature", Int16),
    def(16, "high_rain_rate", Int16),
    def(17, "solar_radiation", UInt16),
    def(18, "wind_sample_count", UInt8),
    def(19, "gust_wind_direction", UInt16),
    def(20, "average_uv_index", UInt8),
    def(21, "evapotranspiration", UInt8),
    def(22, "high_solar_radiation", UInt16),
    def(23, "high_uv_index", UInt8),
    def(24, "forecast_rule_id", UInt8),
    def(31, "extra_fields", SubFields(DAVIS_EXTRA_FIELDS)),
];

/// Field widths for one hardware type and record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub hardware: HardwareType,
    pub kind: RecordKind,
    fields: &'static [FieldDef],
}

impl FieldLayout {
    pub fn new(hardware: HardwareType, kind: RecordKind) -> Self {
        let fields = match (hardware, kind) {
            (HardwareType::Generic | HardwareType::Fowh1080, RecordKind::Live) => GENERIC_LIVE_FIELDS,
            (HardwareType::Davis, RecordKind::Live) => DAVIS_LIVE_FIELDS,
            (HardwareType::Generic, RecordKind::Sample) => GENERIC_SAMPLE_FIELDS,
            (HardwareType::Fowh1080, RecordKind::Sample) => WH1080_SAMPLE_FIELDS,
            (HardwareType::Davis, RecordKind::Sample) => DAVIS_SAMPLE_FIELDS,
        };

        Self {
            hardware,
            kind,
            fields,
        }
    }

    pub fn field(&self, id: u8) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn fields(&self) -> &'static [FieldDef] {
        self.fields
    }

    /// Byte range of every field the bitmask names, in ascending id order.
    ///
    /// Fails if the bitmask names a field this layout doesn't define, or if
    /// the named fields need more bytes than `data` holds.
    pub(crate) fn spans(
        &self,
        list: FieldList,
        data: &[u8],
    ) -> Result<Vec<(FieldId, Range<usize>)>, RecordError> {
        let mut spans = Vec::with_capacity(list.len());
        let mut offset = 0usize;

        for id in list.ids() {
            let field = self.field(id).ok_or(RecordError::UndefinedField {
                field_id: id,
                hardware: self.hardware,
            })?;

            let end = match field.kind {
                SubFields(subfields) => {
                    let bitmap_end = offset + 4;
                    let bitmap = data.get(offset..bitmap_end).ok_or(RecordError::Truncated {
                        needed: bitmap_end,
                        available: data.len(),
                    })?;
                    let sub_list = FieldList::from_bits(u32::from_be_bytes([
                        bitmap[0], bitmap[1], bitmap[2], bitmap[3],
                    ]));

                    let mut sub_offset = bitmap_end;
                    for sub_id in sub_list.ids() {
                        let sub = subfields.iter().find(|f| f.id == sub_id).ok_or(
                            RecordError::UndefinedField {
                                field_id: sub_id,
                                hardware: self.hardware,
                            },
                        )?;
                        sub_offset += sub.kind.width().unwrap_or(0);
                    }
                    sub_offset
                }
                kind => offset + kind.width().unwrap_or(0),
            };

            if end > data.len() {
                return Err(RecordError::Truncated {
                    needed: end,
                    available: data.len(),
                });
            }
            spans.push((FieldId::from_bit_index(id), offset..end));
            offset = end;
        }

        Ok(spans)
    }

    /// Whether a live field has the same meaning and encoding in `sample`
    pub fn shares_field(&self, sample: &FieldLayout, id: u8) -> bool {
        match (self.field(id), sample.field(id)) {
            (Some(a), Some(b)) => a.name == b.name && a.kind == b.kind,
            _ => false,
        }
    }
}
