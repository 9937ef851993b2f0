// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::VecDeque;
use std::time::Duration;

use super::LogError;
use crate::stop::StopSignal;
use crate::storage::{LogStorage, StoredBatch};

/// Blocking reader over the log from a given index. Never ends on its own: when caught up
/// it polls the head every `poll_interval` until a new batch appears or a stop is requested.
/// Dropping it and opening a new tail at `next_index()` resumes without gaps.
pub struct LogTail {
    storage: LogStorage,
    next_index: u64,
    page_size: usize,
    poll_interval: Duration,
    buffered: VecDeque<StoredBatch>,
    stop: StopSignal,
}

impl LogTail {
    pub fn new(
        storage: LogStorage,
        from_index: u64,
        page_size: usize,
        poll_interval: Duration,
        stop: StopSignal,
    ) -> Self {
        Self {
            storage,
            next_index: from_index,
            page_size: page_size.max(1),
            poll_interval,
            buffered: VecDeque::new(),
            stop,
        }
    }

    /// Index of the batch the next call to `next` yields.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

impl Iterator for LogTail {
    type Item = Result<StoredBatch, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.buffered.pop_front() {
                self.next_index = batch.index.saturating_add(1);
                return Some(Ok(batch));
            }
            if self.stop.is_stop_requested() {
                return None;
            }

            match self
                .storage
                .load_batches_from(self.next_index, self.page_size)
            {
                Ok(page) if page.is_empty() => {
                    if !self.stop.sleep_blocking(self.poll_interval) {
                        return None;
                    }
                }
                Ok(page) => self.buffered.extend(page),
                Err(source) => return Some(Err(LogError::Read { source })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LogTail;
    use crate::stop::StopSignal;
    use crate::storage::LogStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn tail_yields_in_order_then_waits_for_new_batches() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("log.sqlite");
        let path = path.to_string_lossy().into_owned();
        let mut writer = LogStorage::open(&path, "NORMAL").expect("open writer");
        writer
            .append_batches(&[("a", "[0]"), ("b", "[1]"), ("c", "[2]")])
            .expect("append");

        let stop = StopSignal::new();
        let reader = LogStorage::open(&path, "NORMAL").expect("open reader");
        let mut tail = LogTail::new(reader, 1, 1, Duration::from_millis(5), stop.clone());

        let first = tail.next().expect("item").expect("batch");
        let second = tail.next().expect("item").expect("batch");
        assert_eq!((first.index, first.payload.as_str()), (1, "[1]"));
        assert_eq!((second.index, second.payload.as_str()), (2, "[2]"));
        assert_eq!(tail.next_index(), 3);

        let appender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            writer.append_batches(&[("d", "[3]")]).expect("append late");
        });
        let late = tail.next().expect("item").expect("batch");
        appender.join().expect("join appender");
        assert_eq!(late.index, 3);
        assert_eq!(late.correlation_id, "d");
    }

    #[test]
    fn stopped_tail_ends_when_caught_up() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("log.sqlite");
        let path = path.to_string_lossy().into_owned();
        let reader = LogStorage::open(&path, "NORMAL").expect("open reader");

        let stop = StopSignal::new();
        stop.request_stop();
        let mut tail = LogTail::new(reader, 0, 16, Duration::from_secs(60), stop);
        assert!(tail.next().is_none());
    }
}
