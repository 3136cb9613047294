//! Opaque iterator over queued [`SyncEvent`](crate::SyncEvent)s.

use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::SyncEvent;

/// A zero-allocation opaque iterator that drains events from a coordinator.
///
/// Wraps the internal event queue drain so `std::collections::vec_deque::Drain`
/// stays out of the public API. Obtain one from [`SyncCoordinator::events`].
///
/// # Examples
///
/// ```ignore
/// for event in coordinator.events() {
///     match event {
///         SyncEvent::Resynchronizing { .. } => pause_ticks(),
///         SyncEvent::GameUnlocked => resume_ticks(),
///         _ => {}
///     }
/// }
/// ```
///
/// [`SyncCoordinator::events`]: crate::SyncCoordinator::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, SyncEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, SyncEvent>) -> Self {
        Self { inner: drain }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = SyncEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::PeerId;
    use std::collections::VecDeque;

    fn queue() -> VecDeque<SyncEvent> {
        VecDeque::from(vec![
            SyncEvent::Resynchronizing {
                initiator: PeerId::new(1),
            },
            SyncEvent::ResyncCompleted { elapsed_ms: 5 },
            SyncEvent::GameUnlocked,
        ])
    }

    #[test]
    fn drains_in_order_and_empties_queue() {
        let mut events = queue();
        let drained: Vec<_> = EventDrain::from_drain(events.drain(..)).collect();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2], SyncEvent::GameUnlocked);
        assert!(events.is_empty());
    }

    #[test]
    fn exact_size_and_double_ended() {
        let mut events = queue();
        let mut drain = EventDrain::from_drain(events.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.next_back(), Some(SyncEvent::GameUnlocked));
        assert_eq!(drain.len(), 2);
        assert!(format!("{:?}", drain).contains("remaining: 2"));
    }

    #[test]
    fn dropping_drain_clears_remaining() {
        let mut events = queue();
        {
            let mut drain = EventDrain::from_drain(events.drain(..));
            let _ = drain.next();
        }
        assert!(events.is_empty());
    }
}
