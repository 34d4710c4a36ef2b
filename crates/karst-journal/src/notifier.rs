#![forbid(unsafe_code)]
//! Release notification fanout.
//!
//! When a log group's region has been zeroed and is reusable, interested
//! parties (the log writer choosing the next group, the dirty-page index,
//! allocator bookkeeping) are told through this hook. The same channel
//! carries the checkpoint-failure signal that drops the journal into
//! fail-journaled mode upstream.

use karst_error::KarstError;
use karst_types::LogGroupId;
use parking_lot::Mutex;
use std::sync::Arc;

/// One party interested in log-group reclamation.
pub trait ResetSubscriber: Send + Sync {
    fn log_buffer_reset(&self, group: LogGroupId);
}

/// Outbound notification surface of the release pipeline.
pub trait ReleaseNotifier: Send + Sync {
    /// `group`'s region has been zeroed and may accept new records.
    /// Best-effort fanout.
    fn notify_log_buffer_reset(&self, group: LogGroupId);

    /// Checkpointing `group` failed unrecoverably; the journal must stop
    /// accepting writes until operator recovery.
    fn notify_checkpoint_failed(&self, group: LogGroupId, error: &KarstError);
}

/// Subscriber-list implementation of [`ReleaseNotifier`].
#[derive(Default)]
pub struct FanoutReleaseNotifier {
    subscribers: Mutex<Vec<Arc<dyn ResetSubscriber>>>,
    last_failure: Mutex<Option<(LogGroupId, String)>>,
}

impl FanoutReleaseNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Fanout runs in registration order.
    pub fn register(&self, subscriber: Arc<dyn ResetSubscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    /// The most recent checkpoint failure, if any.
    ///
    /// The enclosing journal manager polls this to refuse further journal
    /// writes after the pipeline has halted.
    #[must_use]
    pub fn last_failure(&self) -> Option<(LogGroupId, String)> {
        self.last_failure.lock().clone()
    }
}

impl std::fmt::Debug for FanoutReleaseNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutReleaseNotifier")
            .field("subscribers", &self.subscribers.lock().len())
            .field("last_failure", &self.last_failure.lock())
            .finish()
    }
}

impl ReleaseNotifier for FanoutReleaseNotifier {
    fn notify_log_buffer_reset(&self, group: LogGroupId) {
        let subscribers = self.subscribers.lock().clone();
        tracing::debug!(
            target: "karst::journal::notifier",
            event = "log_buffer_reset",
            group = group.0,
            subscribers = subscribers.len(),
        );
        for subscriber in subscribers {
            subscriber.log_buffer_reset(group);
        }
    }

    fn notify_checkpoint_failed(&self, group: LogGroupId, error: &KarstError) {
        tracing::error!(
            target: "karst::journal::notifier",
            event = "checkpoint_failed",
            group = group.0,
            error = %error,
        );
        *self.last_failure.lock() = Some((group, error.to_string()));
    }
}
