//! Delta encoding of record field data
//!
//! A record may leave out fields whose values equal those of an earlier record
//! the receiver already holds. Two marker fields name the base:
//!
//! - field 0, `live_diff_sequence` (u16): sequence id of a previous live record
//! - field 1, `sample_diff_timestamp` (u32): timestamp of a stored sample
//!
//! The receiver copies the missing fields from the base and drops the marker
//! before storing, so stored rows never carry markers. A live record patched
//! from a sample only takes fields that mean the same thing in both layouts.

use crate::fields::{FieldLayout, FieldList};
use crate::record::{RecordError, Timestamp};
use crate::validation::{FieldId, SequenceId};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Compressed live records allowed in a row before a full one is forced
pub const MAX_COMPRESSED_LIVE_RECORDS: u32 = 30;

/// How a record's field data relates to earlier records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaEncoding {
    None,
    LiveDiff,
    SampleDiff,
    /// Identical to the previous live record, nothing sent
    Skip,
}

impl DeltaEncoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LiveDiff => "live-diff",
            Self::SampleDiff => "sample-diff",
            Self::Skip => "skip",
        }
    }

    /// Encoding of a received record, judged by its marker fields
    pub fn of(list: FieldList) -> Self {
        if list.contains(FieldId::LIVE_DIFF) {
            Self::LiveDiff
        } else if list.contains(FieldId::SAMPLE_DIFF) {
            Self::SampleDiff
        } else {
            Self::None
        }
    }
}

/// Field values of one record keyed by field id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    values: BTreeMap<FieldId, Bytes>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split field data into per-field values. The bitmask must account for
    /// every byte.
    pub fn split(layout: &FieldLayout, list: FieldList, data: &Bytes) -> Result<Self, RecordError> {
        let spans = layout.spans(list, data)?;
        let used = spans.last().map_or(0, |(_, span)| span.end);
        if used != data.len() {
            return Err(RecordError::FieldDataMismatch {
                expected: used,
                actual: data.len(),
            });
        }

        Ok(Self {
            values: spans
                .into_iter()
                .map(|(id, span)| (id, data.slice(span)))
                .collect(),
        })
    }

    pub fn get(&self, id: FieldId) -> Option<&Bytes> {
        self.values.get(&id)
    }

    pub fn insert(&mut self, id: FieldId, value: Bytes) {
        self.values.insert(id, value);
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.values.keys().copied()
    }

    pub fn field_list(&self) -> FieldList {
        let mut list = FieldList::EMPTY;
        for id in self.values.keys() {
            list.insert(*id);
        }
        list
    }

    pub fn encoded_len(&self) -> usize {
        self.values.values().map(Bytes::len).sum()
    }

    /// Field data in ascending id order
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        for value in self.values.values() {
            buf.extend_from_slice(value);
        }
        buf.freeze()
    }

    /// Sequence id named by the live diff marker
    pub fn live_diff_base(&self) -> Option<SequenceId> {
        let raw: [u8; 2] = self.get(FieldId::LIVE_DIFF)?.as_ref().try_into().ok()?;
        Some(SequenceId::new(u16::from_be_bytes(raw)))
    }

    /// Timestamp named by the sample diff marker
    pub fn sample_diff_base(&self) -> Option<Timestamp> {
        let raw: [u8; 4] = self.get(FieldId::SAMPLE_DIFF)?.as_ref().try_into().ok()?;
        Some(Timestamp::from_unix(u32::from_be_bytes(raw)))
    }

    fn has_marker(&self) -> bool {
        self.contains(FieldId::LIVE_DIFF) || self.contains(FieldId::SAMPLE_DIFF)
    }

    fn without_markers(mut self) -> Self {
        self.values.remove(&FieldId::LIVE_DIFF);
        self.values.remove(&FieldId::SAMPLE_DIFF);
        self
    }
}

fn is_marker(id: FieldId) -> bool {
    id == FieldId::LIVE_DIFF || id == FieldId::SAMPLE_DIFF
}

/// A live record the receiver is expected to hold
#[derive(Debug, Clone, Copy)]
pub struct LiveBase<'a> {
    pub sequence: SequenceId,
    pub values: &'a FieldValues,
}

/// A sample the receiver has confirmed
#[derive(Debug, Clone, Copy)]
pub struct SampleBase<'a> {
    pub timestamp: Timestamp,
    pub values: &'a FieldValues,
}

/// Result of encoding one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFields {
    pub encoding: DeltaEncoding,
    pub field_list: FieldList,
    pub field_data: Bytes,

    /// Size of the field data without delta encoding
    pub full_size: usize,
}

impl EncodedFields {
    fn new(encoding: DeltaEncoding, values: &FieldValues, full_size: usize) -> Self {
        Self {
            encoding,
            field_list: values.field_list(),
            field_data: values.encode(),
            full_size,
        }
    }

    fn full(values: &FieldValues) -> Self {
        Self::new(DeltaEncoding::None, values, values.encoded_len())
    }

    /// Bytes saved against the full encoding
    pub fn saving(&self) -> usize {
        match self.encoding {
            DeltaEncoding::Skip => self.full_size,
            _ => self.full_size.saturating_sub(self.field_data.len()),
        }
    }
}

/// Fields of `target` that differ from `base`, or `None` when the receiver
/// would patch in a base field the target doesn't have.
fn diff_fields(
    target: &FieldValues,
    base: &FieldValues,
    shared: impl Fn(FieldId) -> bool,
) -> Option<FieldValues> {
    if target.has_marker() {
        return None;
    }

    let extra = base
        .ids()
        .any(|id| !is_marker(id) && shared(id) && !target.contains(id));
    if extra {
        return None;
    }

    let mut delta = FieldValues::new();
    for (id, value) in &target.values {
        if !(shared(*id) && base.get(*id) == Some(value)) {
            delta.insert(*id, value.clone());
        }
    }
    Some(delta)
}

/// Encode a sample, against `base` when that is smaller
pub fn encode_sample(values: &FieldValues, base: Option<SampleBase<'_>>) -> EncodedFields {
    let full = EncodedFields::full(values);
    let Some(base) = base else {
        return full;
    };
    let Some(mut delta) = diff_fields(values, base.values, |_| true) else {
        return full;
    };

    delta.insert(
        FieldId::SAMPLE_DIFF,
        Bytes::copy_from_slice(&base.timestamp.as_unix().to_be_bytes()),
    );
    let encoded = EncodedFields::new(DeltaEncoding::SampleDiff, &delta, full.full_size);
    if encoded.saving() > 0 { encoded } else { full }
}

/// Encode a live record, choosing whichever of full, live diff, sample diff
/// or skip saves the most. Ties go to the earlier option in that order.
pub fn encode_live(
    values: &FieldValues,
    live_layout: &FieldLayout,
    sample_layout: &FieldLayout,
    previous: Option<LiveBase<'_>>,
    sample: Option<SampleBase<'_>>,
    compress: bool,
) -> EncodedFields {
    let full = EncodedFields::full(values);
    if !compress {
        return full;
    }

    let mut options = Vec::with_capacity(3);
    let mut skip = None;

    if let Some(previous) = previous {
        if let Some(mut delta) = diff_fields(values, previous.values, |_| true) {
            if delta.values.is_empty() {
                skip = Some(EncodedFields {
                    encoding: DeltaEncoding::Skip,
                    field_list: FieldList::EMPTY,
                    field_data: Bytes::new(),
                    full_size: full.full_size,
                });
            }
            delta.insert(
                FieldId::LIVE_DIFF,
                Bytes::copy_from_slice(&previous.sequence.get().to_be_bytes()),
            );
            options.push(EncodedFields::new(DeltaEncoding::LiveDiff, &delta, full.full_size));
        }
    }

    if let Some(sample) = sample {
        let shared = |id: FieldId| live_layout.shares_field(sample_layout, id.get());
        if let Some(mut delta) = diff_fields(values, sample.values, shared) {
            delta.insert(
                FieldId::SAMPLE_DIFF,
                Bytes::copy_from_slice(&sample.timestamp.as_unix().to_be_bytes()),
            );
            options.push(EncodedFields::new(DeltaEncoding::SampleDiff, &delta, full.full_size));
        }
    }

    options.extend(skip);
    options
        .into_iter()
        .fold(full, |best, option| if option.saving() > best.saving() { option } else { best })
}

/// Rebuild the full field set of a sample or a live record diffed against a
/// record of the same kind
pub fn patch_from_base(delta: &FieldValues, base: &FieldValues) -> FieldValues {
    let mut patched = delta.clone().without_markers();
    for (id, value) in &base.values {
        if !is_marker(*id) && !patched.contains(*id) {
            patched.insert(*id, value.clone());
        }
    }
    patched
}

/// Rebuild a live record diffed against a sample, taking only the fields the
/// two layouts share
pub fn patch_live_from_sample(
    delta: &FieldValues,
    sample: &FieldValues,
    live_layout: &FieldLayout,
    sample_layout: &FieldLayout,
) -> FieldValues {
    let mut patched = delta.clone().without_markers();
    for (id, value) in &sample.values {
        if !is_marker(*id)
            && !patched.contains(*id)
            && live_layout.shares_field(sample_layout, id.get())
        {
            patched.insert(*id, value.clone());
        }
    }
    patched
}
