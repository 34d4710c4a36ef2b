#![forbid(unsafe_code)]
//! On-device log buffer: fixed-geometry journal file and group reset.
//!
//! The journal occupies one file on the meta volume, divided into
//! `num_log_groups` equal regions. The log writer appends records into a
//! region via [`FileLogBuffer::write_log`]; the release pipeline reclaims a
//! region by scheduling [`LogBuffer::async_reset`], which zeroes it on a
//! dedicated worker thread and reports completion through a callback.

use karst_error::{KarstError, Result};
use karst_types::LogGroupId;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::JournalConfig;
use parking_lot::Mutex;

/// Completion callback for [`LogBuffer::async_reset`].
///
/// Invoked on the reset worker thread once the group's region is durably
/// zeroed. Implementations must not assume it runs on the submitting thread.
pub type ResetCallback = Box<dyn FnOnce(LogGroupId) + Send>;

/// Reclamation interface of the log buffer.
pub trait LogBuffer: Send + Sync {
    /// Schedule zeroing of `group`'s region.
    ///
    /// Non-blocking: an `Ok` return means the reset was queued, not that it
    /// ran. `on_done` fires via callback after the region is durable; it is
    /// never invoked synchronously from this call.
    fn async_reset(&self, group: LogGroupId, on_done: ResetCallback) -> Result<()>;
}

struct ResetJob {
    group: LogGroupId,
    on_done: ResetCallback,
}

/// Write-granularity zero buffer used by the reset worker.
const RESET_CHUNK: usize = 1 << 20;

/// File-backed log buffer with a background reset worker.
pub struct FileLogBuffer {
    config: JournalConfig,
    file: Arc<File>,
    jobs: Mutex<Option<mpsc::Sender<ResetJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileLogBuffer {
    /// Create (or reopen) the journal file at `path` with the given
    /// geometry and start the reset worker.
    pub fn create(path: &Path, config: JournalConfig) -> Result<Self> {
        let config = config.validate()?;
        let total = config
            .total_size()
            .ok_or_else(|| KarstError::Format("journal geometry overflows u64".to_owned()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(total)?;
        let file = Arc::new(file);

        let (tx, rx) = mpsc::channel();
        let worker_file = Arc::clone(&file);
        let worker = std::thread::Builder::new()
            .name("karst-log-reset".to_owned())
            .spawn(move || reset_worker(&worker_file, config, &rx))?;

        tracing::info!(
            target: "karst::journal::log_buffer",
            event = "log_buffer_created",
            num_log_groups = config.num_log_groups,
            log_group_size = config.log_group_size,
        );

        Ok(Self {
            config,
            file,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Append `payload` at `offset` within `group`'s region.
    pub fn write_log(&self, group: LogGroupId, offset: u64, payload: &[u8]) -> Result<()> {
        self.check_range(group, offset, payload.len())?;
        let file_offset = self.config.group_offset(group) + offset;
        self.file.write_all_at(payload, file_offset)?;
        tracing::trace!(
            target: "karst::journal::log_buffer",
            event = "log_written",
            group = group.0,
            offset,
            len = payload.len(),
        );
        Ok(())
    }

    /// Read back the full contents of `group`'s region.
    pub fn read_log_group(&self, group: LogGroupId) -> Result<Vec<u8>> {
        self.check_range(group, 0, 0)?;
        let len = usize::try_from(self.config.log_group_size)
            .map_err(|_| KarstError::Format("log_group_size exceeds address space".to_owned()))?;
        let mut buffer = vec![0_u8; len];
        self.file
            .read_exact_at(&mut buffer, self.config.group_offset(group))?;
        Ok(buffer)
    }

    /// Synchronously zero every group region. Init-time only.
    pub fn sync_reset_all(&self) -> Result<()> {
        for group in 0..self.config.num_log_groups {
            zero_region(
                &self.file,
                self.config.group_offset(LogGroupId(group)),
                self.config.log_group_size,
            )?;
        }
        self.file.sync_data()?;
        tracing::debug!(
            target: "karst::journal::log_buffer",
            event = "log_buffer_reset_all",
            num_log_groups = self.config.num_log_groups,
        );
        Ok(())
    }

    /// Stop accepting resets and join the worker. Pending resets complete
    /// first. Idempotent.
    pub fn dispose(&self) {
        drop(self.jobs.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    fn check_range(&self, group: LogGroupId, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64);
        if !self.config.contains(group) || end.map_or(true, |end| end > self.config.log_group_size)
        {
            return Err(KarstError::OutOfRange { group, offset, len });
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileLogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogBuffer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for FileLogBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl LogBuffer for FileLogBuffer {
    fn async_reset(&self, group: LogGroupId, on_done: ResetCallback) -> Result<()> {
        if !self.config.contains(group) {
            return Err(KarstError::ResetSubmitFailed { group });
        }
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            return Err(KarstError::ResetSubmitFailed { group });
        };
        tx.send(ResetJob { group, on_done })
            .map_err(|_| KarstError::ResetSubmitFailed { group })?;
        tracing::trace!(
            target: "karst::journal::log_buffer",
            event = "log_group_reset_queued",
            group = group.0,
        );
        Ok(())
    }
}

fn reset_worker(file: &File, config: JournalConfig, jobs: &mpsc::Receiver<ResetJob>) {
    while let Ok(job) = jobs.recv() {
        let offset = config.group_offset(job.group);
        let outcome = zero_region(file, offset, config.log_group_size)
            .and_then(|()| file.sync_data().map_err(KarstError::Io));
        match outcome {
            Ok(()) => {
                tracing::debug!(
                    target: "karst::journal::log_buffer",
                    event = "log_group_reset_done",
                    group = job.group.0,
                );
                (job.on_done)(job.group);
            }
            Err(error) => {
                // The group stays un-reset and the completion never fires;
                // the release pipeline halts on this group until operator
                // recovery.
                tracing::error!(
                    target: "karst::journal::log_buffer",
                    event = "log_group_reset_failed",
                    group = job.group.0,
                    error = %error,
                );
            }
        }
    }
}

fn zero_region(file: &File, offset: u64, len: u64) -> Result<()> {
    let chunk_len = usize::try_from(len.min(RESET_CHUNK as u64))
        .map_err(|_| KarstError::Format("log_group_size exceeds address space".to_owned()))?;
    let zeros = vec![0_u8; chunk_len];
    let mut written = 0_u64;
    while written < len {
        let step = (len - written).min(zeros.len() as u64);
        let step_usize = usize::try_from(step)
            .map_err(|_| KarstError::Format("log_group_size exceeds address space".to_owned()))?;
        file.write_all_at(&zeros[..step_usize], offset + written)?;
        written += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_config() -> JournalConfig {
        JournalConfig {
            num_log_groups: 2,
            log_group_size: 8192,
        }
    }

    fn make_buffer(config: JournalConfig) -> (tempfile::TempDir, FileLogBuffer) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let buffer =
            FileLogBuffer::create(&dir.path().join("journal"), config).expect("create");
        (dir, buffer)
    }

    fn await_reset(buffer: &FileLogBuffer, group: LogGroupId) -> LogGroupId {
        let (tx, rx) = mpsc::channel();
        buffer
            .async_reset(group, Box::new(move |done| tx.send(done).unwrap()))
            .expect("queued");
        rx.recv_timeout(Duration::from_secs(5)).expect("reset completes")
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, buffer) = make_buffer(small_config());
        buffer
            .write_log(LogGroupId(1), 100, b"journal record")
            .expect("write");

        let region = buffer.read_log_group(LogGroupId(1)).expect("read");
        assert_eq!(&region[100..114], b"journal record");
        assert!(region[..100].iter().all(|b| *b == 0));
    }

    #[test]
    fn write_beyond_group_is_rejected() {
        let (_dir, buffer) = make_buffer(small_config());
        let err = buffer
            .write_log(LogGroupId(0), 8190, b"spills over")
            .expect_err("out of range");
        assert!(matches!(err, KarstError::OutOfRange { .. }));

        let err = buffer
            .write_log(LogGroupId(2), 0, b"x")
            .expect_err("no such group");
        assert!(matches!(err, KarstError::OutOfRange { .. }));
    }

    #[test]
    fn async_reset_zeroes_only_the_addressed_group() {
        let (_dir, buffer) = make_buffer(small_config());
        buffer.write_log(LogGroupId(0), 0, &[0xAA; 64]).expect("write");
        buffer.write_log(LogGroupId(1), 0, &[0xBB; 64]).expect("write");

        let done = await_reset(&buffer, LogGroupId(0));
        assert_eq!(done, LogGroupId(0));

        let zeroed = buffer.read_log_group(LogGroupId(0)).expect("read");
        assert!(zeroed.iter().all(|b| *b == 0));
        let intact = buffer.read_log_group(LogGroupId(1)).expect("read");
        assert_eq!(&intact[..64], &[0xBB; 64]);
    }

    #[test]
    fn async_reset_rejects_unknown_group() {
        let (_dir, buffer) = make_buffer(small_config());
        let err = buffer
            .async_reset(LogGroupId(7), Box::new(|_| {}))
            .expect_err("no such group");
        assert!(matches!(
            err,
            KarstError::ResetSubmitFailed {
                group: LogGroupId(7)
            }
        ));
    }

    #[test]
    fn sync_reset_all_clears_every_group() {
        let (_dir, buffer) = make_buffer(small_config());
        buffer.write_log(LogGroupId(0), 10, &[1; 16]).expect("write");
        buffer.write_log(LogGroupId(1), 20, &[2; 16]).expect("write");

        buffer.sync_reset_all().expect("reset all");

        for group in [LogGroupId(0), LogGroupId(1)] {
            let region = buffer.read_log_group(group).expect("read");
            assert!(region.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn dispose_refuses_further_resets() {
        let (_dir, buffer) = make_buffer(small_config());
        buffer.dispose();
        let err = buffer
            .async_reset(LogGroupId(0), Box::new(|_| {}))
            .expect_err("worker gone");
        assert!(matches!(err, KarstError::ResetSubmitFailed { .. }));
        // Idempotent.
        buffer.dispose();
    }

    #[test]
    fn resets_queued_before_dispose_still_complete() {
        let (_dir, buffer) = make_buffer(small_config());
        buffer.write_log(LogGroupId(0), 0, &[0xCC; 32]).expect("write");

        let (tx, rx) = mpsc::channel();
        buffer
            .async_reset(LogGroupId(0), Box::new(move |done| tx.send(done).unwrap()))
            .expect("queued");
        buffer.dispose();

        assert_eq!(rx.try_recv().expect("completed before join"), LogGroupId(0));
        let region = buffer.read_log_group(LogGroupId(0)).expect("read");
        assert!(region.iter().all(|b| *b == 0));
    }
}
