//! Completion callbacks keyed by `(channel, event kind)`.
//!
//! Callbacks never run on the monitor thread. The monitor hands each event, together with the
//! callbacks registered for it at that moment, to a dedicated callback thread. A callback that
//! returns an error or panics is logged and the remaining callbacks still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{error, trace};

use crate::protocol::StatusBits;

/// Terminal events a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `MOVE_COMPLETED`.
    MoveCompleted,
    /// `MOVE_STOPPED`, including an aborted home.
    MoveStopped,
    /// `MOVE_HOMED`.
    Homed,
    /// A following error appeared in the status register, or a channel sent an error response.
    ///
    /// Error responses from the controller itself (address `0x50`) belong to no channel. They are
    /// logged and fire no event.
    Error,
}

/// An event as delivered to callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// 1-based channel id.
    pub channel: u8,
    /// What happened.
    pub kind: EventKind,
    /// Status register after the frame was applied.
    pub status: StatusBits,
    /// Position counter after the frame was applied.
    pub position_counts: i32,
}

/// What a callback returns. Errors are logged, never propagated.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub(crate) type Callback = Arc<dyn Fn(&Event) -> CallbackResult + Send + Sync>;

/// Identifies a registered callback for [`crate::Controller::unregister_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Ordered callback lists per `(channel, kind)`.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    next_id: u64,
    table: HashMap<(u8, EventKind), Vec<(CallbackId, Callback)>>,
}

impl CallbackRegistry {
    pub(crate) fn register(&mut self, channel: u8, kind: EventKind, callback: Callback) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.table
            .entry((channel, kind))
            .or_default()
            .push((id, callback));
        id
    }

    pub(crate) fn unregister(&mut self, id: CallbackId) -> bool {
        let mut removed = false;
        self.table.retain(|_, callbacks| {
            let before = callbacks.len();
            callbacks.retain(|(cb_id, _)| *cb_id != id);
            removed |= callbacks.len() != before;
            !callbacks.is_empty()
        });
        removed
    }

    /// The callbacks for `(channel, kind)` in registration order.
    pub(crate) fn get(&self, channel: u8, kind: EventKind) -> Vec<Callback> {
        self.table
            .get(&(channel, kind))
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

/// One event and the callbacks to run for it.
pub(crate) struct Job {
    pub(crate) event: Event,
    pub(crate) callbacks: Vec<Callback>,
}

fn run_job(job: Job) {
    let Job { event, callbacks } = job;
    trace!("running {} callbacks for {:?}", callbacks.len(), event);
    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "{:?} callback for channel {} failed: {}",
                event.kind, event.channel, e
            ),
            Err(_) => error!(
                "{:?} callback for channel {} panicked",
                event.kind, event.channel
            ),
        }
    }
}

fn run(jobs: Receiver<Job>) {
    for job in jobs {
        run_job(job);
    }
}

/// Starts the callback thread. It exits once every [`Sender`] is dropped.
pub(crate) fn spawn() -> std::io::Result<(Sender<Job>, JoinHandle<()>)> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name("apt-callbacks".into())
        .spawn(move || run(receiver))?;
    Ok((sender, handle))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn event(kind: EventKind) -> Event {
        Event {
            channel: 1,
            kind,
            status: StatusBits::empty(),
            position_counts: 0,
        }
    }

    #[test]
    fn registry_keeps_order_and_unregisters() {
        let mut registry = CallbackRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let first = registry.register(
            1,
            EventKind::Homed,
            Arc::new(move |_: &Event| -> CallbackResult {
                assert_eq!(c.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            }),
        );
        let c = calls.clone();
        registry.register(
            1,
            EventKind::Homed,
            Arc::new(move |_: &Event| -> CallbackResult {
                assert_eq!(c.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            }),
        );
        assert!(registry.get(2, EventKind::Homed).is_empty());
        assert!(registry.get(1, EventKind::MoveCompleted).is_empty());

        for cb in registry.get(1, EventKind::Homed) {
            cb(&event(EventKind::Homed)).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert_eq!(registry.get(1, EventKind::Homed).len(), 1);
    }

    #[test]
    fn failing_callbacks_are_isolated() {
        let (sender, handle) = spawn().unwrap();
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        let failing: Callback = Arc::new(|_: &Event| -> CallbackResult { Err("nope".into()) });
        let panicking: Callback = Arc::new(|_: &Event| -> CallbackResult { panic!("callback bug") });
        let recording: Callback = Arc::new(move |e: &Event| -> CallbackResult {
            seen_tx.send(e.kind)?;
            Ok(())
        });

        for kind in [EventKind::MoveCompleted, EventKind::MoveStopped] {
            sender
                .send(Job {
                    event: event(kind),
                    callbacks: vec![failing.clone(), panicking.clone(), recording.clone()],
                })
                .unwrap();
        }
        drop(sender);
        handle.join().unwrap();

        let seen: Vec<_> = seen_rx.try_iter().collect();
        assert_eq!(seen, vec![EventKind::MoveCompleted, EventKind::MoveStopped]);
    }
}
