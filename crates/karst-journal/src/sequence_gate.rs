#![forbid(unsafe_code)]
//! Two-sided gate serializing checkpoint execution against write callbacks.
//!
//! Front-end write-completion callbacks read the mapping state the
//! checkpoint is about to persist, so the two must never overlap. The gate
//! gives the checkpoint side exclusivity: once approval is granted, no
//! callback runs until the checkpoint side releases it.
//!
//! The protocol:
//! - Callbacks hold a [`CallbackSlot`] for the duration of their execution.
//! - The releaser calls [`checkpoint_execution_approval`] before invoking
//!   the checkpoint handler, which blocks until all in-flight callbacks
//!   drain, and [`allow_callback_execution`] afterwards. The two calls form
//!   a balanced pair for every started checkpoint.
//!
//! [`checkpoint_execution_approval`]: SequenceGate::checkpoint_execution_approval
//! [`allow_callback_execution`]: SequenceGate::allow_callback_execution

use std::sync::{Condvar, Mutex};

/// Checkpoint-side capability: exclusivity over callback execution.
pub trait SequenceGate: Send + Sync {
    /// Block until in-flight callbacks quiesce, then hold the gate closed.
    fn checkpoint_execution_approval(&self);

    /// Release the gate; blocked callbacks resume.
    fn allow_callback_execution(&self);
}

#[derive(Debug)]
struct GateState {
    /// Callbacks currently executing.
    active_callbacks: usize,
    /// Whether a checkpoint currently holds the gate.
    checkpoint_held: bool,
}

/// Condvar rendezvous implementing [`SequenceGate`].
#[derive(Debug)]
pub struct CallbackSequenceGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl CallbackSequenceGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                active_callbacks: 0,
                checkpoint_held: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Enter the callback side of the gate.
    ///
    /// Blocks while a checkpoint holds exclusivity. The returned guard must
    /// live for the duration of the callback; dropping it lets a waiting
    /// checkpoint proceed.
    pub fn callback_slot(&self) -> CallbackSlot<'_> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while state.checkpoint_held {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.active_callbacks += 1;
        drop(state);
        CallbackSlot { gate: self }
    }

    /// Callbacks currently inside the gate (racy snapshot, for tests).
    #[must_use]
    pub fn active_callbacks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .active_callbacks
    }
}

impl Default for CallbackSequenceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGate for CallbackSequenceGate {
    fn checkpoint_execution_approval(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Close the gate first so new callbacks queue up, then wait for the
        // in-flight ones to drain.
        while state.checkpoint_held {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.checkpoint_held = true;
        while state.active_callbacks > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn allow_callback_execution(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.checkpoint_held = false;
        drop(state);
        self.changed.notify_all();
    }
}

/// RAII guard for one executing write-completion callback.
#[derive(Debug)]
pub struct CallbackSlot<'a> {
    gate: &'a CallbackSequenceGate,
}

impl Drop for CallbackSlot<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.active_callbacks -= 1;
        drop(state);
        self.gate.changed.notify_all();
    }
}
