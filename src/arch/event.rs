//! Intra-core hardware events.
//!
//! A hardware event is a binary flag on a directed channel between two
//! functional units of one core (for example the inbound DMA engine and the
//! L1-to-L0 mover). A producer `set`s an event id after its work is visible;
//! the consumer `wait`s the same id before touching the data. The table is a
//! checked state machine: double-set and wait-without-set are the two ways a
//! real pipeline hangs or reads stale data, and both panic here with the
//! channel and id named.

use std::fmt;

/// Directed event channels between the functional units of one core.
///
/// Naming is producer-to-consumer: `Mte2Mte1` is set by the GM-to-L1 mover
/// and waited by the L1-to-L0 mover, and so on. `M` is the mmad unit, `Fix`
/// the accumulator-flush unit, `V` the vector unit, `Mte3` the outbound DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardEvent {
    Mte2Mte1,
    Mte1Mte2,
    MMte1,
    Mte1M,
    MFix,
    FixM,
    VMte2,
    Mte2V,
    VMte3,
    Mte3V,
}

impl HardEvent {
    pub const ALL: [HardEvent; 10] = [
        HardEvent::Mte2Mte1,
        HardEvent::Mte1Mte2,
        HardEvent::MMte1,
        HardEvent::Mte1M,
        HardEvent::MFix,
        HardEvent::FixM,
        HardEvent::VMte2,
        HardEvent::Mte2V,
        HardEvent::VMte3,
        HardEvent::Mte3V,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            HardEvent::Mte2Mte1 => 0,
            HardEvent::Mte1Mte2 => 1,
            HardEvent::MMte1 => 2,
            HardEvent::Mte1M => 3,
            HardEvent::MFix => 4,
            HardEvent::FixM => 5,
            HardEvent::VMte2 => 6,
            HardEvent::Mte2V => 7,
            HardEvent::VMte3 => 8,
            HardEvent::Mte3V => 9,
        }
    }
}

/// Event ids per channel.
pub const EVENT_ID_MAX: u8 = 8;

/// An event slot on some channel. Stage rings hand these out; call sites
/// never touch raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u8);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signaled/unsignaled state of every event id on every channel of one core.
pub struct EventTable {
    signaled: [[bool; EVENT_ID_MAX as usize]; HardEvent::ALL.len()],
}

impl EventTable {
    pub fn new() -> Self {
        EventTable {
            signaled: [[false; EVENT_ID_MAX as usize]; HardEvent::ALL.len()],
        }
    }

    /// Signal `id` on `channel`. Panics if it is already signaled: the
    /// previous set was never consumed, so the producer would be overwriting
    /// an in-flight stage.
    pub fn set(&mut self, channel: HardEvent, id: EventId) {
        assert!((id.0) < EVENT_ID_MAX, "event id {} out of range", id);
        let slot = &mut self.signaled[channel.index()][id.0 as usize];
        assert!(
            !*slot,
            "double set of {:?} id {}: previous signal never waited",
            channel, id
        );
        *slot = true;
    }

    /// Consume a signal of `id` on `channel`. Panics if it is not signaled:
    /// on hardware this wait would either deadlock or race a stale buffer.
    pub fn wait(&mut self, channel: HardEvent, id: EventId) {
        assert!((id.0) < EVENT_ID_MAX, "event id {} out of range", id);
        let slot = &mut self.signaled[channel.index()][id.0 as usize];
        assert!(*slot, "wait on unsignaled {:?} id {}", channel, id);
        *slot = false;
    }

    #[inline]
    pub fn is_signaled(&self, channel: HardEvent, id: EventId) -> bool {
        self.signaled[channel.index()][id.0 as usize]
    }

    /// Panics unless every id on every channel is back to unsignaled. A
    /// finished pipeline must leave the table in this state.
    pub fn assert_quiesced(&self) {
        for channel in HardEvent::ALL {
            for id in 0..EVENT_ID_MAX {
                assert!(
                    !self.signaled[channel.index()][id as usize],
                    "{:?} id {} still signaled after pipeline finish",
                    channel, id
                );
            }
        }
    }
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_wait_roundtrip() {
        let mut t = EventTable::new();
        t.set(HardEvent::Mte2Mte1, EventId(0));
        assert!(t.is_signaled(HardEvent::Mte2Mte1, EventId(0)));
        t.wait(HardEvent::Mte2Mte1, EventId(0));
        t.assert_quiesced();
    }

    #[test]
    fn test_channels_are_independent() {
        let mut t = EventTable::new();
        t.set(HardEvent::MMte1, EventId(2));
        t.set(HardEvent::Mte1M, EventId(2));
        t.wait(HardEvent::MMte1, EventId(2));
        assert!(t.is_signaled(HardEvent::Mte1M, EventId(2)));
    }

    #[test]
    #[should_panic(expected = "double set")]
    fn test_double_set_panics() {
        let mut t = EventTable::new();
        t.set(HardEvent::MFix, EventId(1));
        t.set(HardEvent::MFix, EventId(1));
    }

    #[test]
    #[should_panic(expected = "wait on unsignaled")]
    fn test_unsignaled_wait_panics() {
        let mut t = EventTable::new();
        t.wait(HardEvent::FixM, EventId(0));
    }

    #[test]
    #[should_panic(expected = "still signaled")]
    fn test_quiesce_catches_leftover_signal() {
        let mut t = EventTable::new();
        t.set(HardEvent::VMte3, EventId(3));
        t.assert_quiesced();
    }
}
