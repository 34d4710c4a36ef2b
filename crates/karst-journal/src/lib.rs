#![forbid(unsafe_code)]
//! Journal checkpoint and log-group reclamation for the Karst storage
//! engine.
//!
//! Host writes mutate in-memory metadata maps; every mutation is first
//! appended as a record into a bounded on-device journal. Because the
//! journal is bounded, filled log groups must be checkpointed — their dirty
//! metadata persisted — and their regions zeroed for reuse. This crate
//! provides that release pipeline:
//!
//! - [`releaser::LogGroupReleaser`] queues filled groups and runs one
//!   checkpoint at a time.
//! - [`checkpoint::CheckpointHandler`] drives the two flush phases (map
//!   pages, then allocator context) for the group being released.
//! - [`sequence_gate::CallbackSequenceGate`] keeps checkpoint kickoff and
//!   front-end write callbacks from overlapping.
//! - [`dirty_pages::DirtyMapManager`] tracks which mpages each group
//!   dirtied.
//! - [`log_buffer::FileLogBuffer`] owns the journal file and zeroes
//!   reclaimed regions on a worker thread.
//! - [`notifier::FanoutReleaseNotifier`] tells subscribers when a region is
//!   reusable.
//!
//! Journal replay on recovery and record encoding live elsewhere; this
//! crate is purely the in-memory coordination plus the buffer reclamation
//! it drives.

pub mod checkpoint;
pub mod config;
pub mod dirty_pages;
pub mod log_buffer;
pub mod notifier;
pub mod releaser;
pub mod sequence_gate;

pub use checkpoint::{
    CheckpointCompletionSink, CheckpointHandler, CheckpointStatus, ContextManager, FlushDone,
    MapFlusher,
};
pub use config::JournalConfig;
pub use dirty_pages::{DirtyMapManager, DirtyPageIndex, MapPageSet};
pub use log_buffer::{FileLogBuffer, LogBuffer, ResetCallback};
pub use notifier::{FanoutReleaseNotifier, ReleaseNotifier, ResetSubscriber};
pub use releaser::LogGroupReleaser;
pub use sequence_gate::{CallbackSequenceGate, CallbackSlot, SequenceGate};
