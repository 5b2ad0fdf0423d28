//! Engine state-change notifications.
//!
//! The engine writes sequence-numbered change records into per-subscriber
//! channels; the UI (or anything else) drains them at its own pace. There is
//! no callback re-entry into the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::player::Mode;

/// What changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChange {
    Section(usize),
    Playseq(usize),
    Position(usize),
    Block(usize),
    Line(usize),
    Mode(Mode),
    /// A new song was installed
    Song,
    /// Whole seconds played so far
    Time(u64),
}

/// A single notification. `seq` increases monotonically across all changes,
/// so a consumer can detect how far behind it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateEvent {
    pub seq: u64,
    pub change: StateChange,
}

/// Fan-out sender for state events. Cloning shares the same subscriber list
/// and sequence counter.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

#[derive(Default)]
struct NotifierInner {
    seq: AtomicU64,
    senders: Mutex<Vec<Sender<StateEvent>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription. Dropped receivers are cleaned up on the
    /// next send.
    pub fn subscribe(&self) -> Receiver<StateEvent> {
        let (tx, rx) = unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish a change to every subscriber.
    pub fn notify(&self, change: StateChange) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let event = StateEvent { seq, change };
        self.senders().retain(|tx| tx.send(event).is_ok());
    }

    fn senders(&self) -> std::sync::MutexGuard<'_, Vec<Sender<StateEvent>>> {
        self.inner
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_increasing_sequence_numbers() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();

        notifier.notify(StateChange::Line(1));
        notifier.notify(StateChange::Line(2));
        notifier.notify(StateChange::Mode(Mode::PlaySong));

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        let third = rx.recv().unwrap();
        assert_eq!(first.change, StateChange::Line(1));
        assert!(second.seq > first.seq);
        assert!(third.seq > second.seq);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        drop(rx);
        // Must not error or grow without bound
        notifier.notify(StateChange::Song);
        notifier.notify(StateChange::Song);

        let rx2 = notifier.subscribe();
        notifier.notify(StateChange::Line(5));
        assert_eq!(rx2.recv().unwrap().change, StateChange::Line(5));
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();
        notifier.notify(StateChange::Block(2));
        assert_eq!(a.recv().unwrap().change, StateChange::Block(2));
        assert_eq!(b.recv().unwrap().change, StateChange::Block(2));
    }
}
