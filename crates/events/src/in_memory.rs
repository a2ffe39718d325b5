//! In-memory change stream for tests/dev.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use changefeed_core::{ChangeEvent, ResumePosition};

use crate::source::{
    ChangeCursor, ChangeStreamSource, CursorItem, MalformedEntry, StreamFilter, StreamInterruption,
    StreamResult,
};

const POSITION_PREFIX: &str = "mem:";

#[derive(Debug, Default)]
struct Log {
    entries: Vec<Result<ChangeEvent, MalformedEntry>>,
    /// Sequence numbers `<= trimmed` are no longer retained.
    trimmed: usize,
    pending_read_failures: VecDeque<StreamInterruption>,
    pending_open_failures: VecDeque<StreamInterruption>,
    closed: bool,
    opens: usize,
}

/// Append-only in-memory change stream.
///
/// - No IO
/// - Positions are `mem:<seq>` where `seq` is the 1-based sequence of the event
/// - Malformed entries can be appended to exercise dead-lettering
/// - In *bounded* mode a cursor reports end of stream once it has drained the log;
///   in *following* mode it waits for appends until [`close`](Self::close) is called
/// - Interruptions can be injected for opens and reads
#[derive(Debug, Clone)]
pub struct InMemoryChangeStream {
    log: Arc<Mutex<Log>>,
    appended: Arc<watch::Sender<u64>>,
    follow: bool,
}

impl Default for InMemoryChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeStream {
    /// Stream whose cursors end once the log is drained.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            appended: Arc::new(tx),
            follow: false,
        }
    }

    /// Stream whose cursors wait for new events until closed.
    pub fn following() -> Self {
        Self {
            follow: true,
            ..Self::new()
        }
    }

    /// Append an event, returning the position immediately after it.
    pub fn append(&self, event: ChangeEvent) -> ResumePosition {
        self.push(Ok(event))
    }

    /// Append an entry that cursors yield as [`CursorItem::Malformed`].
    pub fn append_malformed(&self, reason: impl Into<String>) -> ResumePosition {
        let id = format!("malformed-{}", self.len() + 1);
        self.push(Err(MalformedEntry::new(id, reason, serde_json::Value::Null)))
    }

    fn push(&self, entry: Result<ChangeEvent, MalformedEntry>) -> ResumePosition {
        let seq = {
            let mut log = lock(&self.log);
            log.entries.push(entry);
            log.entries.len()
        };
        self.appended.send_modify(|v| *v += 1);
        Self::position(seq)
    }

    /// Position after the `seq`-th event (1-based).
    pub fn position(seq: usize) -> ResumePosition {
        ResumePosition::new(format!("{POSITION_PREFIX}{seq}"))
    }

    /// Drop retained history up to and including `seq`.
    pub fn trim_through(&self, seq: usize) {
        lock(&self.log).trimmed = seq;
    }

    /// Make the next read on any cursor fail with `interruption`.
    pub fn fail_next_read(&self, interruption: StreamInterruption) {
        lock(&self.log).pending_read_failures.push_back(interruption);
        self.appended.send_modify(|v| *v += 1);
    }

    /// Make the next `open` fail with `interruption`.
    pub fn fail_next_open(&self, interruption: StreamInterruption) {
        lock(&self.log).pending_open_failures.push_back(interruption);
    }

    /// End the stream; cursors report end of stream once drained.
    pub fn close(&self) {
        lock(&self.log).closed = true;
        self.appended.send_modify(|v| *v += 1);
    }

    /// How many times the stream was opened successfully.
    pub fn opens(&self) -> usize {
        lock(&self.log).opens
    }

    pub fn len(&self) -> usize {
        lock(&self.log).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn parse_position(position: &ResumePosition) -> Option<usize> {
        position
            .as_str()
            .strip_prefix(POSITION_PREFIX)
            .and_then(|seq| seq.parse().ok())
    }
}

fn lock(log: &Mutex<Log>) -> std::sync::MutexGuard<'_, Log> {
    // A panic while holding the lock only happens in a failing test; keep going.
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ChangeStreamSource for InMemoryChangeStream {
    async fn open(
        &self,
        filter: &StreamFilter,
        resume_after: Option<&ResumePosition>,
    ) -> StreamResult<Box<dyn ChangeCursor>> {
        let mut log = lock(&self.log);
        if let Some(failure) = log.pending_open_failures.pop_front() {
            return Err(failure);
        }

        let next_index = match resume_after {
            None => log.entries.len(),
            Some(position) => {
                let seq = Self::parse_position(position).ok_or_else(|| {
                    StreamInterruption::invalidated(format!(
                        "position {position} was not issued by this stream"
                    ))
                })?;
                if seq > log.entries.len() {
                    return Err(StreamInterruption::invalidated(format!(
                        "position {position} is ahead of the stream"
                    )));
                }
                if seq < log.trimmed {
                    return Err(StreamInterruption::invalidated(format!(
                        "position {position} precedes retained history"
                    )));
                }
                seq
            }
        };
        log.opens += 1;

        Ok(Box::new(InMemoryCursor {
            log: self.log.clone(),
            appended: self.appended.subscribe(),
            filter: filter.clone(),
            follow: self.follow,
            next_index,
            position: resume_after.cloned(),
            closed: false,
        }))
    }
}

struct InMemoryCursor {
    log: Arc<Mutex<Log>>,
    appended: watch::Receiver<u64>,
    filter: StreamFilter,
    follow: bool,
    next_index: usize,
    position: Option<ResumePosition>,
    closed: bool,
}

#[async_trait]
impl ChangeCursor for InMemoryCursor {
    async fn next_item(&mut self) -> StreamResult<Option<CursorItem>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            self.appended.borrow_and_update();
            {
                let mut log = lock(&self.log);
                if let Some(failure) = log.pending_read_failures.pop_front() {
                    return Err(failure);
                }

                let mut skipped = false;
                while self.next_index < log.entries.len() {
                    let entry = log.entries[self.next_index].clone();
                    self.next_index += 1;
                    self.position = Some(InMemoryChangeStream::position(self.next_index));
                    match entry {
                        Ok(event) if self.filter.matches(event.operation_type()) => {
                            return Ok(Some(CursorItem::Event(event)));
                        }
                        Ok(_) => skipped = true,
                        Err(malformed) => return Ok(Some(CursorItem::Malformed(malformed))),
                    }
                }
                if skipped {
                    return Ok(Some(CursorItem::Skipped));
                }

                if !self.follow || log.closed {
                    return Ok(None);
                }
            }

            if self.appended.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    fn resume_position(&self) -> Option<ResumePosition> {
        self.position.clone()
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
