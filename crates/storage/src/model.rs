//! Rows exchanged with the stores

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use wxpush_protocol::{Code, FieldList, HardwareType, SequenceId, Timestamp};

/// A weather station known to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRecord {
    pub code: Code,
    pub hardware: HardwareType,
}

/// An image source and the station it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSourceRecord {
    pub code: Code,
    pub station_code: Code,
}

/// One archived sample. `field_data` holds the field values named by
/// `field_list` in the station hardware's wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    pub station_code: Code,
    pub timestamp: Timestamp,
    pub download_timestamp: Timestamp,
    pub field_list: FieldList,
    pub field_data: Bytes,
}

/// Most recent live reading for a station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRow {
    pub station_code: Code,
    pub sequence_id: SequenceId,
    pub field_list: FieldList,
    pub field_data: Bytes,
    pub received_at: Timestamp,
}

/// An image with its descriptive text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRow {
    /// Store-assigned id; 0 until inserted
    pub id: i64,
    pub source_code: Code,
    pub type_code: Code,
    pub timestamp: Timestamp,
    pub title: String,
    pub description: String,
    pub mime_type: String,
    pub metadata: String,
    pub data: Bytes,
}

/// Delivery state of one image for one destination site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Pending,
    AwaitingConfirmation,
    Done,
}

impl ReplicationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown replication status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub image_id: i64,
    pub site_id: i32,
    pub status: ReplicationState,
    pub retries: u32,
    /// Unix seconds of the last transition
    pub status_time: u32,
}

/// Per-site counts for operator reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub site_id: i32,
    pub pending: u64,
    pub awaiting_confirmation: u64,
    pub done: u64,
    /// Not done and out of retries
    pub parked: u64,
}
