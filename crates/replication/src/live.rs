//! Live record loss accounting
//!
//! Live records are fire-and-forget. The server watches each station's live
//! sequence ids for gaps and reports a decaying loss count back to UDP clients
//! so a station operator can see link quality.

use std::collections::HashMap;
use tracing::debug;
use wxpush_protocol::{LostLiveCount, SequenceId, StationId};

/// Backward jumps larger than this are treated as counter wraparound
pub const WRAP_THRESHOLD: u16 = 60000;

/// Whether a live record should be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveVerdict {
    Accept,
    /// Arrived after a newer record; stale live data is useless
    Discard,
}

#[derive(Debug, Default)]
pub struct LiveLossTracker {
    previous: HashMap<StationId, SequenceId>,
    lost: i64,
}

impl LiveLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, station: StationId, sequence: SequenceId) -> LiveVerdict {
        let seq = sequence.get() as i64;
        let Some(prev) = self.previous.get(&station).map(|p| p.get() as i64) else {
            // First record from this station sets the baseline
            self.previous.insert(station, sequence);
            self.lost = (self.lost - 1).max(0);
            return LiveVerdict::Accept;
        };

        if seq < prev {
            let back = prev - seq;
            if back <= WRAP_THRESHOLD as i64 {
                self.add_lost(1);
                debug!(%station, %sequence, "Ignoring out of order live record");
                return LiveVerdict::Discard;
            }

            let missing = u16::MAX as i64 - prev + seq;
            if missing > 1 {
                self.add_lost(missing);
            }
        } else if seq - prev > 1 {
            self.add_lost(seq - prev);
        }

        self.previous.insert(station, sequence);
        self.lost = (self.lost - 1).max(0);
        LiveVerdict::Accept
    }

    /// Count an accepted record that could not be decoded as lost
    pub fn record_undecodable(&mut self) {
        self.add_lost(1);
    }

    fn add_lost(&mut self, count: i64) {
        self.lost = (self.lost + count).min(u8::MAX as i64);
    }

    pub fn lost(&self) -> LostLiveCount {
        LostLiveCount::saturating(self.lost)
    }

    /// Forget all state for a new session
    pub fn reset(&mut self) {
        self.previous.clear();
        self.lost = 0;
    }
}
