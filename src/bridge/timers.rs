//! Cancellable deadlines owned by a session
//!
//! A fired timer posts `SessionInput::Timer` to the session inbox. Each arm
//! gets a fresh generation, so a firing that was already queued when the
//! timer was cancelled or re-armed is recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::session::SessionInput;

/// Deadlines used by the shutdown sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    NativeDetach,
    ManagedTerminate,
    DisconnectWait,
}

pub struct Timers {
    inbox: mpsc::UnboundedSender<SessionInput>,
    armed: HashMap<TimerKind, (u64, AbortHandle)>,
    generation: u64,
}

impl Timers {
    pub fn new(inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            inbox,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    /// Arm `kind` to fire after `after`, replacing any earlier deadline
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(SessionInput::Timer(kind, generation));
        });
        self.armed.insert(kind, (generation, task.abort_handle()));
    }

    /// Cancel `kind`; returns whether it was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Accept a firing only if it belongs to the currently armed deadline
    pub fn take_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some((armed, _)) if *armed == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
