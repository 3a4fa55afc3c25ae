//! Fixed-capacity stage ring tying scratch slots to their event ids.

use crate::arch::EventId;

/// Rotates over a fixed set of pipeline stages and owns their event ids.
///
/// A ring with `stages` slots and base id `base` covers event ids
/// `base .. base + groups * stages`: slot `i` of group `g` maps to id
/// `base + g * stages + i`. `advance` is the only way the slot index moves,
/// so producer and consumer sides of a double buffer each hold their own ring
/// and cannot skew by more than the capacity the events allow.
#[derive(Debug, Clone, Copy)]
pub struct StageRing {
    stages: u8,
    base: u8,
    idx: u8,
}

impl StageRing {
    pub fn new(stages: u8, base: u8) -> Self {
        assert!(stages > 0, "stage ring needs at least one slot");
        StageRing {
            stages,
            base,
            idx: 0,
        }
    }

    #[inline]
    pub fn stages(&self) -> u8 {
        self.stages
    }

    /// Current slot index.
    #[inline]
    pub fn slot(&self) -> usize {
        self.idx as usize
    }

    /// Event id of the current slot in event group `group`.
    #[inline]
    pub fn event_id(&self, group: u8) -> EventId {
        EventId(self.base + group * self.stages + self.idx)
    }

    /// Event id of slot `slot` in event group `group`.
    #[inline]
    pub fn event_id_of(&self, slot: usize, group: u8) -> EventId {
        debug_assert!(slot < self.stages as usize);
        EventId(self.base + group * self.stages + slot as u8)
    }

    pub fn advance(&mut self) {
        self.idx = (self.idx + 1) % self.stages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wraps() {
        let mut ring = StageRing::new(3, 0);
        assert_eq!(ring.slot(), 0);
        ring.advance();
        ring.advance();
        assert_eq!(ring.slot(), 2);
        ring.advance();
        assert_eq!(ring.slot(), 0);
    }

    #[test]
    fn test_event_groups_do_not_collide() {
        let ring = StageRing::new(2, 0);
        assert_eq!(ring.event_id(0), EventId(0));
        assert_eq!(ring.event_id(1), EventId(2));
        assert_eq!(ring.event_id_of(1, 1), EventId(3));
    }
}
