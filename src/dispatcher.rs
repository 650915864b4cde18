//! Bookkeeping for requests that wait on a device reply.
//!
//! Every confirmed request gets an entry in the [`PendingTable`] keyed by `(channel, kind)` and a
//! one-shot channel the monitor thread answers on. The caller holds the receiving end in a
//! [`Completion`].

use std::collections::HashMap;
use std::sync::Weak;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::error::Error;
use crate::protocol::{Frame, MessageId, StatusBits};

/// What a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    /// `GET_CHANENABLESTATE` after an enable or disable.
    EnableState,
    /// `MOVE_HOMED`.
    Home,
    /// `MOVE_COMPLETED` after an absolute or relative move.
    Move,
    /// `GET_VELPARAMS`.
    VelocityParams,
    /// `GET_STATUSUPDATE`.
    Status,
    /// `GET_POSCOUNTER`.
    Position,
    /// `GET_ENCCOUNTER`.
    Encoder,
    /// `GET_STATUSBITS`.
    StatusBits,
    /// `HW_GET_INFO`.
    HardwareInfo,
}

impl CompletionKind {
    fn is_motion(self) -> bool {
        matches!(self, CompletionKind::Home | CompletionKind::Move)
    }
}

/// `(channel, kind)`. The channel is `None` for controller level requests.
pub(crate) type PendingKey = (Option<u8>, CompletionKind);

type Reply = Result<Frame, Error>;

/// Implemented by whoever owns the [`PendingTable`], so a [`Completion`] can drop its own
/// registration when its deadline passes.
pub(crate) trait Expire: Send + Sync {
    /// Removes `key` if it still carries `token`. Returns whether anything was removed.
    fn expire(&self, key: PendingKey, token: u64) -> bool;
}

struct PendingRequest {
    message_id: u16,
    expected: MessageId,
    issued_at: Instant,
    deadline: Instant,
    timeout: Duration,
    token: u64,
    reply: Sender<Reply>,
}

impl PendingRequest {
    fn timeout_error(&self, key: PendingKey) -> Error {
        Error::RequestTimeout {
            channel: key.0,
            kind: key.1,
            timeout: self.timeout,
        }
    }

    fn send(self, key: PendingKey, reply: Reply) {
        debug!(
            "{:?} on channel {:?} ({:#06x}) finished after {:?}: {}",
            key.1,
            key.0,
            self.message_id,
            self.issued_at.elapsed(),
            if reply.is_ok() { "ok" } else { "failed" },
        );
        // the waiter may have given up already
        let _ = self.reply.send(reply);
    }
}

/// The receiving half of a registration, before it is wrapped in a [`Completion`].
pub(crate) struct Registration {
    pub(crate) key: PendingKey,
    pub(crate) token: u64,
    deadline: Instant,
    timeout: Duration,
    receiver: Receiver<Reply>,
}

/// A request removed from the table after its deadline.
pub(crate) struct Expired {
    key: PendingKey,
    request: PendingRequest,
}

impl Expired {
    pub(crate) fn key(&self) -> PendingKey {
        self.key
    }

    /// Answers the waiter with [`Error::RequestTimeout`].
    pub(crate) fn fail(self) {
        warn!(
            "{:?} on channel {:?} timed out after {:?}",
            self.key.1, self.key.0, self.request.timeout
        );
        let err = self.request.timeout_error(self.key);
        self.request.send(self.key, Err(err));
    }
}

/// Outstanding confirmed requests, at most one per `(channel, kind)`.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<PendingKey, PendingRequest>,
    next_token: u64,
}

impl PendingTable {
    /// Registers a request. Fails with [`Error::RequestInProgress`] and leaves the existing entry
    /// alone if `key` is taken.
    pub(crate) fn insert(
        &mut self,
        key: PendingKey,
        message_id: u16,
        expected: MessageId,
        timeout: Duration,
    ) -> Result<Registration, Error> {
        if self.entries.contains_key(&key) {
            return Err(Error::RequestInProgress {
                channel: key.0,
                kind: key.1,
            });
        }
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let (reply, receiver) = crossbeam_channel::bounded(1);
        self.entries.insert(
            key,
            PendingRequest {
                message_id,
                expected,
                issued_at,
                deadline,
                timeout,
                token,
                reply,
            },
        );
        Ok(Registration {
            key,
            token,
            deadline,
            timeout,
            receiver,
        })
    }

    /// Removes `key` if it still belongs to `token`, without answering the waiter.
    pub(crate) fn take(&mut self, key: PendingKey, token: u64) -> bool {
        match self.entries.get(&key) {
            Some(entry) if entry.token == token => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Answers every request `frame` settles.
    ///
    /// `status` is the channel's register after the frame was applied. A stop notification ends a
    /// pending move or home with [`Error::Stopped`], a following error with [`Error::Device`].
    pub(crate) fn resolve(&mut self, channel: Option<u8>, frame: &Frame, status: Option<StatusBits>) {
        let stopped = frame.is(MessageId::MotMoveStopped);
        let faulted = status.filter(|s| s.following_error());
        let keys: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.0 == channel
                    && (frame.is(entry.expected)
                        || (key.1.is_motion() && (stopped || faulted.is_some())))
            })
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            let reply = match (frame.is(entry.expected), channel, faulted) {
                (true, _, _) => Ok(frame.clone()),
                (false, Some(channel), _) if stopped => Err(Error::Stopped { channel }),
                (false, Some(channel), Some(status)) => Err(Error::Device { channel, status }),
                _ => Ok(frame.clone()),
            };
            entry.send(key, reply);
        }
    }

    /// Removes every request past its deadline. The waiters are answered once the caller calls
    /// [`Expired::fail`].
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Expired> {
        let keys: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let request = self.entries.remove(&key)?;
                Some(Expired { key, request })
            })
            .collect()
    }

    /// Answers every outstanding request with [`Error::Disconnected`].
    pub(crate) fn fail_all(&mut self) {
        for (key, entry) in self.entries.drain() {
            entry.send(key, Err(Error::Disconnected));
        }
    }
}

/// Handle to a confirmed request that is still in flight.
///
/// Returned by the `start_*` methods of [`crate::Controller`]. Dropping it abandons the wait;
/// the registration is cleared when its deadline passes.
pub struct Completion {
    key: PendingKey,
    token: u64,
    deadline: Instant,
    timeout: Duration,
    receiver: Receiver<Reply>,
    owner: Weak<dyn Expire>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("channel", &self.key.0)
            .field("kind", &self.key.1)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Completion {
    pub(crate) fn new(registration: Registration, owner: Weak<dyn Expire>) -> Self {
        Completion {
            key: registration.key,
            token: registration.token,
            deadline: registration.deadline,
            timeout: registration.timeout,
            receiver: registration.receiver,
            owner,
        }
    }

    /// Channel the request was sent to.
    pub fn channel(&self) -> Option<u8> {
        self.key.0
    }

    /// What the request is waiting for.
    pub fn kind(&self) -> CompletionKind {
        self.key.1
    }

    /// Whether the result is available, so [`Completion::wait`] returns without blocking.
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Blocks until the request resolves or its deadline passes.
    pub fn wait(self) -> Result<(), Error> {
        self.wait_frame().map(drop)
    }

    pub(crate) fn wait_frame(self) -> Result<Frame, Error> {
        match self.receiver.recv_deadline(self.deadline) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
            Err(RecvTimeoutError::Timeout) => {
                let removed = self
                    .owner
                    .upgrade()
                    .map_or(true, |owner| owner.expire(self.key, self.token));
                let timeout = Error::RequestTimeout {
                    channel: self.key.0,
                    kind: self.key.1,
                    timeout: self.timeout,
                };
                if removed {
                    return Err(timeout);
                }
                // resolved while the deadline passed
                self.receiver.try_recv().unwrap_or(Err(timeout))
            }
        }
    }
}
