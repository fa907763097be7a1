//! Display-layer handoff.
//!
//! Background tasks never render anything themselves; they emit events into
//! one channel whose consumer is the single serialization point, so renders
//! never race background mutation. Send failures are ignored: a departed
//! consumer must not stall a loop.

use crossbeam::channel::{Receiver, Sender, unbounded};

#[derive(Debug, Clone)]
pub enum Event {
    /// One subprocess or loop output line, labeled by its source.
    Log { label: String, line: String },
    /// The set of live watches changed; re-render the watch list.
    WatchListChanged,
    /// Persisted project state changed (pending/dirty/timestamps).
    StateChanged,
    /// A fetch replaced the inbox manifest.
    InboxReplaced {
        added: usize,
        modified: usize,
        deleted: usize,
    },
}

#[derive(Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    pub fn channel() -> (EventSink, Receiver<Event>) {
        let (tx, rx) = unbounded();
        (EventSink { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, label: impl Into<String>, line: impl Into<String>) {
        self.emit(Event::Log {
            label: label.into(),
            line: line.into(),
        });
    }
}
