//! Per-session counters
//!
//! Both counters restart at zero whenever a connection re-authenticates, so a
//! receiver never sees stale numbers from a previous session as a gap.

use crate::validation::SequenceId;

/// UDP packet sequence numbers, wrapping at `u32::MAX`
#[derive(Debug, Default)]
pub struct PacketSequencer {
    next: u32,
}

impl PacketSequencer {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Take the next number
    pub fn advance(&mut self) -> u32 {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        current
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Live record instance ids, wrapping at 65535
#[derive(Debug, Default)]
pub struct LiveSequencer {
    next: SequenceId,
}

impl LiveSequencer {
    pub const fn new() -> Self {
        Self {
            next: SequenceId::new(0),
        }
    }

    pub fn advance(&mut self) -> SequenceId {
        let current = self.next;
        self.next = self.next.next();
        current
    }

    pub fn reset(&mut self) {
        self.next = SequenceId::new(0);
    }
}
