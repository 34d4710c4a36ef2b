#![forbid(unsafe_code)]
//! Checkpoint execution for one log group.
//!
//! A checkpoint persists everything a filled log group's records describe:
//! first the dirty map pages, then the allocator context. Both phases are
//! submitted to collaborators that complete asynchronously via callback;
//! the handler advances its state machine as completions arrive and tells
//! its owning releaser when the whole checkpoint is durable.
//!
//! ```text
//! Init ──start──▶ Started ──▶ FlushingMaps ──(all maps done)──▶
//!     FlushingContext ──(context done)──▶ Completed ──▶ Init
//! ```
//!
//! Any flush failure parks the handler in `Failed`; there is no retry, the
//! journal goes into fail-journaled mode and waits for operator recovery.

use karst_error::{KarstError, Result};
use karst_types::{MapId, MpageNum};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::dirty_pages::MapPageSet;

/// Completion callback for one asynchronous flush submission.
pub type FlushDone = Box<dyn FnOnce(Result<()>) + Send>;

/// Persists dirty map pages. Flushes for distinct maps may run in parallel.
pub trait MapFlusher: Send + Sync {
    /// Begin flushing `mpages` of `map`. Non-blocking; `done` fires once
    /// the pages are durable (or the flush has failed).
    fn flush_dirty_mpages(&self, map: MapId, mpages: &BTreeSet<MpageNum>, done: FlushDone)
        -> Result<()>;
}

/// Persists the allocator context. Single operation per checkpoint.
pub trait ContextManager: Send + Sync {
    /// Begin flushing the allocator context. Non-blocking; `done` fires on
    /// durable completion (or failure).
    fn flush_contexts(&self, done: FlushDone) -> Result<()>;
}

/// Where the handler reports the outcome of a started checkpoint.
///
/// The releaser owns the handler and passes itself in as the sink; the
/// handler holds only a weak capability reference back, so the relation
/// stays an ownership tree rather than a cycle.
pub trait CheckpointCompletionSink: Send + Sync {
    /// The checkpoint is fully durable. Called exactly once per accepted
    /// `start`.
    fn checkpoint_completed(&self);

    /// The checkpoint failed unrecoverably.
    fn checkpoint_failed(&self, error: KarstError);
}

/// Observable checkpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Init,
    Started,
    FlushingMaps,
    FlushingContext,
    Completed,
    Failed,
}

struct HandlerDeps {
    map_flusher: Arc<dyn MapFlusher>,
    context_manager: Arc<dyn ContextManager>,
    sink: Weak<dyn CheckpointCompletionSink>,
}

/// Drives the two-phase checkpoint for one log group at a time.
pub struct CheckpointHandler {
    status: Mutex<CheckpointStatus>,
    /// Map flushes submitted but not yet acknowledged.
    maps_remaining: AtomicUsize,
    deps: OnceLock<HandlerDeps>,
}

impl CheckpointHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: Mutex::new(CheckpointStatus::Init),
            maps_remaining: AtomicUsize::new(0),
            deps: OnceLock::new(),
        }
    }

    /// One-shot wiring. Must precede `start`.
    pub fn init(
        &self,
        map_flusher: Arc<dyn MapFlusher>,
        context_manager: Arc<dyn ContextManager>,
        sink: Weak<dyn CheckpointCompletionSink>,
    ) {
        let wired = self
            .deps
            .set(HandlerDeps {
                map_flusher,
                context_manager,
                sink,
            })
            .is_ok();
        debug_assert!(wired, "checkpoint handler initialized twice");
    }

    /// Begin checkpointing the given dirty pages.
    ///
    /// Rejected with `CheckpointInProgress` unless the handler is idle.
    /// An empty dirty set skips straight to the context flush.
    pub fn start(self: &Arc<Self>, dirty_pages: MapPageSet) -> Result<()> {
        let deps = self.deps.get().ok_or_else(|| {
            KarstError::Format("checkpoint handler used before init".to_owned())
        })?;

        {
            let mut status = self.status.lock();
            if *status != CheckpointStatus::Init {
                return Err(KarstError::CheckpointInProgress);
            }
            *status = CheckpointStatus::Started;
        }

        let maps = dirty_pages.into_maps();
        self.maps_remaining.store(maps.len(), Ordering::Release);
        *self.status.lock() = CheckpointStatus::FlushingMaps;

        tracing::debug!(
            target: "karst::journal::checkpoint",
            event = "checkpoint_map_flush_started",
            maps = maps.len(),
        );

        if maps.is_empty() {
            self.begin_context_flush();
            return Ok(());
        }

        for (map, mpages) in maps {
            let handler = Arc::clone(self);
            let done: FlushDone = Box::new(move |outcome| handler.map_flush_done(map, outcome));
            if let Err(error) = deps.map_flusher.flush_dirty_mpages(map, &mpages, done) {
                // Flushes already submitted may still complete, but the
                // remaining count never reaches zero, so the state machine
                // stays parked in Failed. The caller learns of the rejection
                // from the return value; the sink is only for async failures.
                self.park_failed(&KarstError::FlushFailed {
                    map,
                    detail: error.to_string(),
                });
                return Err(error);
            }
        }
        Ok(())
    }

    /// Current state. Racy snapshot; observation only.
    #[must_use]
    pub fn status(&self) -> CheckpointStatus {
        *self.status.lock()
    }

    fn map_flush_done(self: &Arc<Self>, map: MapId, outcome: Result<()>) {
        if let Err(error) = outcome {
            self.fail(KarstError::FlushFailed {
                map,
                detail: error.to_string(),
            });
            return;
        }

        let previous = self.maps_remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "map flush completion without submission");
        tracing::trace!(
            target: "karst::journal::checkpoint",
            event = "map_flush_done",
            map = map.0,
            remaining = previous.saturating_sub(1),
        );
        if previous == 1 {
            self.begin_context_flush();
        }
    }

    fn begin_context_flush(self: &Arc<Self>) {
        let Some(deps) = self.deps.get() else {
            return;
        };
        {
            let mut status = self.status.lock();
            if *status != CheckpointStatus::FlushingMaps {
                return;
            }
            *status = CheckpointStatus::FlushingContext;
        }

        tracing::debug!(
            target: "karst::journal::checkpoint",
            event = "checkpoint_context_flush_started",
        );

        let handler = Arc::clone(self);
        let done: FlushDone = Box::new(move |outcome| handler.context_flush_done(outcome));
        if let Err(error) = deps.context_manager.flush_contexts(done) {
            self.fail(KarstError::ContextFlushFailed(error.to_string()));
        }
    }

    fn context_flush_done(&self, outcome: Result<()>) {
        if let Err(error) = outcome {
            self.fail(KarstError::ContextFlushFailed(error.to_string()));
            return;
        }

        {
            let mut status = self.status.lock();
            if *status != CheckpointStatus::FlushingContext {
                return;
            }
            *status = CheckpointStatus::Completed;
        }
        tracing::debug!(
            target: "karst::journal::checkpoint",
            event = "checkpoint_completed",
        );

        // Re-arm before notifying: the sink's completion path eventually
        // drains the next full group, and that start must find the handler
        // idle no matter how quickly the reset worker turns around.
        *self.status.lock() = CheckpointStatus::Init;

        if let Some(sink) = self.deps.get().and_then(|deps| deps.sink.upgrade()) {
            sink.checkpoint_completed();
        }
    }

    /// Park in `Failed`. Returns `false` if already parked.
    fn park_failed(&self, error: &KarstError) -> bool {
        {
            let mut status = self.status.lock();
            if *status == CheckpointStatus::Failed {
                return false;
            }
            *status = CheckpointStatus::Failed;
        }
        tracing::error!(
            target: "karst::journal::checkpoint",
            event = "checkpoint_failed",
            error = %error,
        );
        true
    }

    /// Park in `Failed` and report through the sink (async failure paths).
    fn fail(&self, error: KarstError) {
        if !self.park_failed(&error) {
            return;
        }
        if let Some(sink) = self.deps.get().and_then(|deps| deps.sink.upgrade()) {
            sink.checkpoint_failed(error);
        }
    }
}

impl Default for CheckpointHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CheckpointHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointHandler")
            .field("status", &self.status())
            .field("maps_remaining", &self.maps_remaining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
