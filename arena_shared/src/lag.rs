//! Lag compensation.
//!
//! Every gameplay message carries the sender's frame number. With the
//! receiver's offset estimate for that connection (`remote - local`) it maps
//! to a local frame, and the distance to the receiver's current frame is the
//! message's frame age.

use std::{collections::HashMap, time::Duration};

use crate::{
    clock::FrameNumber,
    connection::ConnectionId,
    protocol::CollisionEvent,
};

/// Local ticks between when the sender produced data and now. Never
/// negative: data from the "future" is treated as fresh.
pub fn frames_ago(sender_frame: FrameNumber, offset: FrameNumber, local_frame: FrameNumber) -> u32 {
    let produced_locally = sender_frame - offset;
    (local_frame - produced_locally).clamp(0, u32::MAX as FrameNumber) as u32
}

/// Birth frame of a gob created from data `frames_ago` frames old.
pub fn backdated_birth_frame(receive_frame: FrameNumber, frames_ago: u32) -> FrameNumber {
    receive_frame - frames_ago as FrameNumber
}

/// Birth time on the local simulation clock.
pub fn backdated_birth_time(receive_time: Duration, frames_ago: u32, frame_duration: Duration) -> Duration {
    receive_time.saturating_sub(frame_duration * frames_ago)
}

/// Makes collision batches apply exactly once per sender frame.
///
/// A batch is identified by its connection and sender frame; a repeat or an
/// older batch is refused. Empty batches count: they still advance the
/// ledger.
#[derive(Debug, Default)]
pub struct CollisionLedger {
    last_applied: HashMap<ConnectionId, FrameNumber>,
}

impl CollisionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events to apply, if any batch should be applied at all.
    pub fn accept<'a>(
        &mut self,
        from: ConnectionId,
        sender_frame: FrameNumber,
        batch: Option<&'a [CollisionEvent]>,
    ) -> Option<&'a [CollisionEvent]> {
        let batch = batch?;
        if let Some(&last) = self.last_applied.get(&from) {
            if sender_frame <= last {
                return None;
            }
        }
        self.last_applied.insert(from, sender_frame);
        Some(batch)
    }

    pub fn forget(&mut self, from: ConnectionId) {
        self.last_applied.remove(&from);
    }

    pub fn clear(&mut self) {
        self.last_applied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gob::GobId;

    #[test]
    fn frame_age_uses_offset() {
        // Remote runs 100 frames ahead of us; it stamped 250, we are at 155.
        assert_eq!(frames_ago(250, 100, 155), 5);
        assert_eq!(frames_ago(250, 100, 150), 0);
        assert_eq!(frames_ago(250, 100, 140), 0);
        assert_eq!(frames_ago(10, -3, 20), 7);
    }

    #[test]
    fn birth_time_is_backdated_by_whole_frames() {
        let tick = Duration::from_millis(20);
        let receive = Duration::from_millis(1000);
        assert_eq!(backdated_birth_time(receive, 4, tick), Duration::from_millis(920));
        assert_eq!(backdated_birth_time(Duration::from_millis(10), 4, tick), Duration::ZERO);
        assert_eq!(backdated_birth_frame(50, 4), 46);
    }

    #[test]
    fn collision_batches_apply_once() {
        let mut ledger = CollisionLedger::new();
        let from = ConnectionId(1);
        let event = CollisionEvent {
            gob1: GobId(1),
            gob2: GobId(2),
            area1: 0,
            area2: 1,
        };
        let batch = vec![event];
        let empty: Vec<CollisionEvent> = vec![];

        assert!(ledger.accept(from, 3, None).is_none());
        assert_eq!(ledger.accept(from, 3, Some(&batch)), Some(&batch[..]));
        assert!(ledger.accept(from, 3, Some(&batch)).is_none());
        // An empty batch is still a batch and advances the ledger.
        assert_eq!(ledger.accept(from, 6, Some(&empty)).map(|b| b.len()), Some(0));
        assert!(ledger.accept(from, 5, Some(&batch)).is_none());
        assert!(ledger.accept(ConnectionId(2), 5, Some(&batch)).is_some());
    }
}
