#![forbid(unsafe_code)]
//! Log-group release pipeline.
//!
//! The log writer calls [`LogGroupReleaser::add_to_full_log_group`] once a
//! group has filled and no further records can land in it. The releaser
//! queues the group, checkpoints one group at a time through its owned
//! [`CheckpointHandler`], then schedules the log-buffer reset and fans the
//! release notification out so the region can be reused.
//!
//! Concurrency model: the queue mutex is held only for O(1) pushes and
//! pops. Checkpoint admission is guarded by an atomic flag rather than a
//! mutex held across the kickoff, because the kickoff acquires the callback
//! sequence gate and calls into the handler, either of which may re-enter
//! the queue.

use karst_error::KarstError;
use karst_types::LogGroupId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::checkpoint::{
    CheckpointCompletionSink, CheckpointHandler, CheckpointStatus, ContextManager, MapFlusher,
};
use crate::dirty_pages::DirtyPageIndex;
use crate::log_buffer::{LogBuffer, ResetCallback};
use crate::notifier::ReleaseNotifier;
use crate::sequence_gate::SequenceGate;

const TARGET: &str = "karst::journal::releaser";

/// Sentinel for "no group is being checkpointed".
const NONE_GROUP: i64 = -1;

struct Wiring {
    notifier: Arc<dyn ReleaseNotifier>,
    log_buffer: Arc<dyn LogBuffer>,
    dirty_index: Arc<dyn DirtyPageIndex>,
    sequence_gate: Arc<dyn SequenceGate>,
}

/// Serializes checkpoints over filled log groups and reclaims their regions.
pub struct LogGroupReleaser {
    /// Filled groups awaiting checkpoint, FIFO.
    full_queue: Mutex<VecDeque<LogGroupId>>,
    /// Group currently being checkpointed or reset; [`NONE_GROUP`] when idle.
    flushing_group: AtomicI64,
    /// Admission flag: guards only the pop-and-assign selection step.
    checkpoint_starting: AtomicBool,
    /// Latched on any unrecoverable checkpoint failure.
    fail_journaled: AtomicBool,
    handler: Arc<CheckpointHandler>,
    wiring: OnceLock<Wiring>,
    self_ref: OnceLock<Weak<LogGroupReleaser>>,
}

impl LogGroupReleaser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(Arc::new(CheckpointHandler::new()))
    }

    /// Construct with an externally built handler. Test seam.
    #[must_use]
    pub fn with_handler(handler: Arc<CheckpointHandler>) -> Self {
        Self {
            full_queue: Mutex::new(VecDeque::new()),
            flushing_group: AtomicI64::new(NONE_GROUP),
            checkpoint_starting: AtomicBool::new(false),
            fail_journaled: AtomicBool::new(false),
            handler,
            wiring: OnceLock::new(),
            self_ref: OnceLock::new(),
        }
    }

    /// One-shot wiring to the journal collaborators. Must precede any other
    /// operation; also wires the owned checkpoint handler, handing it this
    /// releaser as its completion sink.
    pub fn init(
        self: &Arc<Self>,
        notifier: Arc<dyn ReleaseNotifier>,
        log_buffer: Arc<dyn LogBuffer>,
        dirty_index: Arc<dyn DirtyPageIndex>,
        sequence_gate: Arc<dyn SequenceGate>,
        map_flusher: Arc<dyn MapFlusher>,
        context_manager: Arc<dyn ContextManager>,
    ) {
        let weak_self: Weak<LogGroupReleaser> = Arc::downgrade(self);
        self.handler.init(map_flusher, context_manager, weak_self);
        let _ = self.self_ref.set(Arc::downgrade(self));
        let wired = self
            .wiring
            .set(Wiring {
                notifier,
                log_buffer,
                dirty_index,
                sequence_gate,
            })
            .is_ok();
        debug_assert!(wired, "releaser initialized twice");
    }

    /// Clear all queued groups and the flushing slot.
    ///
    /// Precondition: no checkpoint is active. Intended for test teardown
    /// and clean shutdown.
    pub fn reset(&self) {
        debug_assert!(
            self.flushing_group.load(Ordering::Acquire) == NONE_GROUP,
            "reset during active checkpoint"
        );
        self.full_queue.lock().clear();
        self.flushing_group.store(NONE_GROUP, Ordering::Release);
    }

    /// Queue a filled group for checkpoint and, if idle, begin draining.
    ///
    /// Safe to call from any number of producers. The caller guarantees the
    /// group is closed to further records and not already queued.
    pub fn add_to_full_log_group(self: &Arc<Self>, group: LogGroupId) {
        {
            let mut queue = self.full_queue.lock();
            debug_assert!(!queue.contains(&group), "log group enqueued twice");
            queue.push_back(group);
        }
        tracing::debug!(
            target: TARGET,
            event = "full_log_group_added",
            group = group.0,
        );
        self.try_start_next();
    }

    /// `|queue| + 1` while a group is flushing, else `|queue|`. Racy
    /// snapshot.
    #[must_use]
    pub fn num_full_log_groups(&self) -> usize {
        let queued = self.full_queue.lock().len();
        if self.flushing_group.load(Ordering::Acquire) == NONE_GROUP {
            queued
        } else {
            queued + 1
        }
    }

    /// The group currently being checkpointed or reset, if any. Racy
    /// snapshot.
    #[must_use]
    pub fn flushing_log_group_id(&self) -> Option<LogGroupId> {
        u32::try_from(self.flushing_group.load(Ordering::Acquire))
            .ok()
            .map(LogGroupId)
    }

    /// Snapshot copy of the queued groups in checkpoint order.
    #[must_use]
    pub fn full_log_groups(&self) -> Vec<LogGroupId> {
        self.full_queue.lock().iter().copied().collect()
    }

    /// Current checkpoint state, delegated to the handler.
    #[must_use]
    pub fn status(&self) -> CheckpointStatus {
        self.handler.status()
    }

    /// Whether the pipeline has halted on an unrecoverable failure.
    #[must_use]
    pub fn is_fail_journaled(&self) -> bool {
        self.fail_journaled.load(Ordering::Acquire)
    }

    /// Begin the next checkpoint if idle and work is queued.
    ///
    /// Loser of the admission CAS simply returns: the winner pops *after*
    /// winning, so it observes every enqueue that preceded the loser's
    /// attempt.
    fn try_start_next(self: &Arc<Self>) {
        if self.fail_journaled.load(Ordering::Acquire) {
            return;
        }
        if self.flushing_group.load(Ordering::Acquire) != NONE_GROUP {
            return;
        }
        if self.full_queue.lock().is_empty() {
            return;
        }
        if self
            .checkpoint_starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Re-check under the admission flag: the flushing slot or the queue
        // may have changed between the unlocked checks and winning the CAS.
        if self.flushing_group.load(Ordering::Acquire) != NONE_GROUP {
            self.checkpoint_starting.store(false, Ordering::Release);
            return;
        }
        let next = self.full_queue.lock().pop_front();
        let Some(next) = next else {
            self.checkpoint_starting.store(false, Ordering::Release);
            return;
        };

        // Publish the flushing slot before releasing the admission flag:
        // any later winner re-checks the slot and backs off. The flag only
        // protects selection; the kickoff below runs outside it.
        self.flushing_group.store(i64::from(next.0), Ordering::Release);
        self.checkpoint_starting.store(false, Ordering::Release);

        tracing::debug!(
            target: TARGET,
            event = "flush_next_log_group",
            group = next.0,
        );
        self.start_checkpoint(next);
    }

    fn start_checkpoint(self: &Arc<Self>, group: LogGroupId) {
        let Some(wiring) = self.wiring.get() else {
            debug_assert!(false, "releaser used before init");
            return;
        };

        let dirty_pages = wiring.dirty_index.dirty_list(group);
        tracing::debug!(
            target: TARGET,
            event = "checkpoint_started",
            group = group.0,
            maps = dirty_pages.map_count(),
            mpages = dirty_pages.page_count(),
        );

        // The one intentional blocking point: wait for in-flight write
        // callbacks to quiesce, start the handler, release the callback
        // side. Must not run under the queue mutex.
        wiring.sequence_gate.checkpoint_execution_approval();
        let started = self.handler.start(dirty_pages);
        wiring.sequence_gate.allow_callback_execution();

        if let Err(error) = started {
            // No reset is attempted and the flushing slot stays occupied,
            // so no further checkpoint can begin until operator recovery.
            self.enter_fail_journaled(group, error);
        }
    }

    fn enter_fail_journaled(&self, group: LogGroupId, error: KarstError) {
        self.fail_journaled.store(true, Ordering::Release);
        tracing::error!(
            target: TARGET,
            event = "journal_fail_mode_entered",
            group = group.0,
            error = %error,
        );
        if let Some(wiring) = self.wiring.get() {
            wiring.notifier.notify_checkpoint_failed(group, &error);
        }
    }

    fn on_log_group_reset(self: &Arc<Self>, group: LogGroupId) {
        tracing::debug!(
            target: TARGET,
            event = "flush_log_group_done",
            group = group.0,
        );
        if let Some(wiring) = self.wiring.get() {
            // Subscribers may query the flushing id from inside the fanout;
            // the notification payload carries the released group, so
            // clearing the slot after the fanout keeps their view coherent.
            wiring.notifier.notify_log_buffer_reset(group);
        }
        self.flushing_group.store(NONE_GROUP, Ordering::Release);
        self.try_start_next();
    }
}

impl CheckpointCompletionSink for LogGroupReleaser {
    fn checkpoint_completed(&self) {
        let flushing = self.flushing_group.load(Ordering::Acquire);
        debug_assert!(flushing != NONE_GROUP, "checkpoint completed while idle");
        let Ok(raw) = u32::try_from(flushing) else {
            tracing::error!(
                target: TARGET,
                event = "orphan_checkpoint_completion",
            );
            return;
        };
        let group = LogGroupId(raw);

        let Some(wiring) = self.wiring.get() else {
            return;
        };
        let Some(me) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        let on_done: ResetCallback =
            Box::new(move |reset_group| me.on_log_group_reset(reset_group));

        if let Err(error) = wiring.log_buffer.async_reset(group, on_done) {
            tracing::error!(
                target: TARGET,
                event = "log_group_reset_submit_failed",
                group = group.0,
                error = %error,
            );
            self.enter_fail_journaled(group, error);
        }
    }

    fn checkpoint_failed(&self, error: KarstError) {
        match u32::try_from(self.flushing_group.load(Ordering::Acquire)) {
            Ok(raw) => self.enter_fail_journaled(LogGroupId(raw), error),
            Err(_) => {
                debug_assert!(false, "checkpoint failure reported while idle");
                self.fail_journaled.store(true, Ordering::Release);
                tracing::error!(
                    target: TARGET,
                    event = "journal_fail_mode_entered",
                    error = %error,
                );
            }
        }
    }
}

impl Default for LogGroupReleaser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogGroupReleaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGroupReleaser")
            .field("full_queue", &self.full_log_groups())
            .field("flushing_group", &self.flushing_log_group_id())
            .field("fail_journaled", &self.is_fail_journaled())
            .finish_non_exhaustive()
    }
}
