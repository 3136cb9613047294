//! FIFO deferral of ordinary messages during recovery.

use std::collections::VecDeque;

use crate::{MessageKind, PeerId, Tick};

/// An ordinary message held back while the gate was locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    /// The announced message kind.
    pub kind: MessageKind,
    /// The undecoded message bytes.
    pub raw: Vec<u8>,
    /// Who sent it.
    pub sender: PeerId,
    /// The local peer.
    pub receiver: PeerId,
    /// Local advance tick when the message arrived.
    pub arrival_tick: Tick,
}

/// Defers messages while locked and hands them back in receipt order.
///
/// The gate never drops a message. Unbounded growth while locked is the
/// owner's concern; [`MessageGate::delayed_count`] is exposed for that.
///
/// # Examples
///
/// ```
/// use lockstep_resync::{DeferredMessage, MessageGate, MessageKind, PeerId, Tick};
///
/// let mut gate = MessageGate::new();
/// let msg = |id: u32| DeferredMessage {
///     kind: MessageKind::Game(id),
///     raw: vec![id as u8],
///     sender: PeerId::new(2),
///     receiver: PeerId::new(1),
///     arrival_tick: Tick::new(50),
/// };
///
/// assert!(!gate.enqueue_if_locked(msg(0))); // not locked: process immediately
/// gate.lock();
/// assert!(gate.enqueue_if_locked(msg(1)));
/// assert!(gate.enqueue_if_locked(msg(2)));
/// let drained: Vec<_> = gate.unlock().into_iter().map(|m| m.kind).collect();
/// assert_eq!(drained, [MessageKind::Game(1), MessageKind::Game(2)]);
/// assert!(!gate.is_locked());
/// ```
#[derive(Debug, Default, Clone)]
pub struct MessageGate {
    locked: bool,
    queue: VecDeque<DeferredMessage>,
}

impl MessageGate {
    /// Creates an unlocked, empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts deferring. Returns `false` (and logs a warning) if already locked.
    pub fn lock(&mut self) -> bool {
        if self.locked {
            tracing::warn!(
                delayed = self.queue.len(),
                "message gate locked twice; keeping the existing queue"
            );
            return false;
        }
        tracing::debug!("message gate locked");
        self.locked = true;
        true
    }

    /// Defers `message` if locked.
    ///
    /// Returns `true` if the gate took the message, `false` if the caller must
    /// process it immediately.
    pub fn enqueue_if_locked(&mut self, message: DeferredMessage) -> bool {
        if !self.locked {
            return false;
        }
        tracing::trace!(
            kind = %message.kind,
            sender = %message.sender,
            position = self.queue.len(),
            "deferring message"
        );
        self.queue.push_back(message);
        true
    }

    /// Unlocks and returns every deferred message, oldest first.
    ///
    /// The caller redelivers them one at a time and must check
    /// [`MessageGate::is_locked`] between deliveries: if a redelivered message
    /// locks the gate again, the rest go back through [`MessageGate::restore_front`].
    pub fn unlock(&mut self) -> Vec<DeferredMessage> {
        self.locked = false;
        let drained: Vec<DeferredMessage> = self.queue.drain(..).collect();
        tracing::debug!(released = drained.len(), "message gate unlocked");
        drained
    }

    /// Puts messages that were drained but not yet delivered back at the head of
    /// the queue, keeping their order ahead of anything deferred since.
    pub fn restore_front(&mut self, messages: Vec<DeferredMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// Number of deferred messages.
    #[must_use]
    pub fn delayed_count(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` while messages are being deferred.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Iterates over the deferred messages in receipt order.
    pub fn iter(&self) -> impl Iterator<Item = &DeferredMessage> {
        self.queue.iter()
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

    fn msg(id: u32) -> DeferredMessage {
        DeferredMessage {
            kind: MessageKind::Game(id),
            raw: id.to_le_bytes().to_vec(),
            sender: PeerId::new(id % 3),
            receiver: PeerId::new(9),
            arrival_tick: Tick::new(10),
        }
    }

    fn ids(messages: &[DeferredMessage]) -> Vec<MessageKind> {
        messages.iter().map(|m| m.kind).collect()
    }

    #[test]
    fn unlocked_gate_takes_nothing() {
        let mut gate = MessageGate::new();
        assert!(!gate.enqueue_if_locked(msg(1)));
        assert_eq!(gate.delayed_count(), 0);
        assert!(gate.unlock().is_empty());
    }

    #[test]
    fn double_lock_is_noop() {
        let mut gate = MessageGate::new();
        assert!(gate.lock());
        assert!(gate.enqueue_if_locked(msg(1)));
        assert!(!gate.lock());
        assert!(gate.is_locked());
        assert_eq!(gate.delayed_count(), 1);
    }

    #[test]
    fn unlock_preserves_receipt_order() {
        let mut gate = MessageGate::new();
        gate.lock();
        for id in 0..20 {
            assert!(gate.enqueue_if_locked(msg(id)));
        }
        let drained = gate.unlock();
        assert_eq!(
            ids(&drained),
            (0..20).map(MessageKind::Game).collect::<Vec<_>>()
        );
        assert_eq!(gate.delayed_count(), 0);
    }

    #[test]
    fn restore_front_keeps_remaining_ahead_of_new() {
        let mut gate = MessageGate::new();
        gate.lock();
        for id in 0..4 {
            gate.enqueue_if_locked(msg(id));
        }
        let mut drained = gate.unlock();
        // message 0 was delivered and locked the gate again
        let remaining = drained.split_off(1);
        gate.lock();
        gate.enqueue_if_locked(msg(100));
        gate.restore_front(remaining);
        assert_eq!(
            ids(&gate.iter().cloned().collect::<Vec<_>>()),
            vec![
                MessageKind::Game(1),
                MessageKind::Game(2),
                MessageKind::Game(3),
                MessageKind::Game(100)
            ]
        );
    }
}
