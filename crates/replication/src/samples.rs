//! Sample delivery tracking
//!
//! Per station the client keeps a watermark, the newest sample timestamp below
//! which everything has been acknowledged, and the samples sent but not yet
//! acknowledged. Everything newer than both is eligible to send. Dropping the
//! in-flight set makes those samples eligible again, which is how losses are
//! recovered: delivery is at-least-once and keyed on timestamps.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wxpush_protocol::{Code, Timestamp};

/// Forget unacknowledged samples after this long so they are resent
pub const DEFAULT_RESEND_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct StationProgress {
    watermark: Timestamp,
    highest_acked: Timestamp,
    in_flight: BTreeMap<Timestamp, Instant>,
}

impl StationProgress {
    fn recompute_watermark(&mut self) {
        let candidate = match self.in_flight.keys().next() {
            Some(oldest) => {
                let below = Timestamp::from_unix(oldest.as_unix().saturating_sub(1));
                self.highest_acked.min(below)
            }
            None => self.highest_acked,
        };
        self.watermark = self.watermark.max(candidate);
    }
}

#[derive(Debug)]
pub struct SampleTracker {
    stations: HashMap<Code, StationProgress>,
    resend_after: Duration,
}

impl Default for SampleTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESEND_AFTER)
    }
}

impl SampleTracker {
    pub fn new(resend_after: Duration) -> Self {
        Self {
            stations: HashMap::new(),
            resend_after,
        }
    }

    /// Restore a persisted watermark
    pub fn restore(&mut self, station: &Code, watermark: Timestamp) {
        let progress = self.stations.entry(station.clone()).or_default();
        progress.watermark = progress.watermark.max(watermark);
        progress.highest_acked = progress.highest_acked.max(watermark);
    }

    pub fn watermark(&self, station: &Code) -> Timestamp {
        self.stations
            .get(station)
            .map(|p| p.watermark)
            .unwrap_or_default()
    }

    /// Samples strictly newer than this should be sent next
    pub fn next_after(&self, station: &Code) -> Timestamp {
        let Some(progress) = self.stations.get(station) else {
            return Timestamp::default();
        };
        let newest_in_flight = progress.in_flight.keys().next_back().copied();
        progress
            .watermark
            .max(newest_in_flight.unwrap_or_default())
    }

    pub fn mark_sent(&mut self, station: &Code, timestamp: Timestamp, now: Instant) {
        self.stations
            .entry(station.clone())
            .or_default()
            .in_flight
            .insert(timestamp, now);
    }

    pub fn in_flight(&self, station: &Code) -> usize {
        self.stations.get(station).map_or(0, |p| p.in_flight.len())
    }

    pub fn is_in_flight(&self, station: &Code, timestamp: Timestamp) -> bool {
        self.stations
            .get(station)
            .is_some_and(|p| p.in_flight.contains_key(&timestamp))
    }

    /// Record an acknowledgement. Returns the new watermark if it moved.
    ///
    /// Acknowledgements for samples not in flight, such as late ones from a
    /// previous session, are ignored.
    pub fn acknowledge(&mut self, station: &Code, timestamp: Timestamp) -> Option<Timestamp> {
        let progress = self.stations.get_mut(station)?;
        let before = progress.watermark;

        if progress.in_flight.remove(&timestamp).is_none() {
            debug!(station = %station, timestamp = timestamp.as_unix(), "Ignoring ack for sample not in flight");
            return None;
        }
        progress.highest_acked = progress.highest_acked.max(timestamp);
        progress.recompute_watermark();

        (progress.watermark > before).then_some(progress.watermark)
    }

    /// Forget everything in flight; call on reconnect
    pub fn reset_session(&mut self) {
        for progress in self.stations.values_mut() {
            progress.in_flight.clear();
        }
        debug!("Sample in-flight state cleared for new session");
    }

    /// Drop in-flight sets for stations with a sample older than the resend
    /// timeout. Returns the number of stations affected.
    pub fn expire_stale(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for (code, progress) in &mut self.stations {
            let stale = progress
                .in_flight
                .values()
                .any(|sent| now.saturating_duration_since(*sent) > self.resend_after);
            if stale {
                info!(
                    "{} unacknowledged samples for {} timed out, will resend",
                    progress.in_flight.len(),
                    code
                );
                progress.in_flight.clear();
                expired += 1;
            }
        }
        expired
    }
}
