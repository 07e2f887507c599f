//! Task assignment feeds
//!
//! A feed yields [`FeedRecord`]s from the mission-command platform;
//! [`run_feed`] applies them to the scheduler until the feed ends or the
//! node shuts down. Arrival order across vehicles is not meaningful and
//! duplicate assignments are answered by the scheduler, so records are
//! applied one by one as they arrive.

use aerotask_core::FeedSource;
use aerotask_fleet::{Scheduler, SchedulerError};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contract::FeedRecord;
use crate::error::FeedError;

/// Source of inbound task records
#[async_trait]
pub trait TaskFeed: Send {
    /// Next record, or `None` once the source is exhausted
    async fn next_record(&mut self) -> Option<Result<FeedRecord, FeedError>>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// In-process feed backed by a bounded channel
#[derive(Debug)]
pub struct ChannelFeed {
    rx: mpsc::Receiver<FeedRecord>,
}

impl ChannelFeed {
    /// Feed plus the sender that drives it; the feed ends when every sender
    /// is dropped
    pub fn new(capacity: usize) -> (mpsc::Sender<FeedRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl TaskFeed for ChannelFeed {
    async fn next_record(&mut self) -> Option<Result<FeedRecord, FeedError>> {
        self.rx.recv().await.map(Ok)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Newline-delimited JSON feed. Blank lines and `#` comments are skipped;
/// a line that is not UTF-8 or not a record is reported as malformed and
/// reading continues with the next one.
pub struct JsonLinesFeed<R> {
    name: String,
    reader: R,
    // Holds a partial line across cancelled reads
    buf: Vec<u8>,
    line_no: usize,
    done: bool,
}

impl<R> std::fmt::Debug for JsonLinesFeed<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesFeed")
            .field("name", &self.name)
            .field("line_no", &self.line_no)
            .finish()
    }
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFeed<R> {
    /// Wrap a buffered reader
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            buf: Vec::new(),
            line_no: 0,
            done: false,
        }
    }
}

impl JsonLinesFeed<BufReader<File>> {
    /// Read records from a file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        Ok(Self::new(path.display().to_string(), BufReader::new(file)))
    }
}

impl JsonLinesFeed<BufReader<Stdin>> {
    /// Read records from standard input
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TaskFeed for JsonLinesFeed<R> {
    async fn next_record(&mut self) -> Option<Result<FeedRecord, FeedError>> {
        while !self.done {
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(FeedError::Io(e)));
                }
            }
            self.line_no += 1;
            let raw = std::mem::take(&mut self.buf);
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(FeedError::Malformed {
                        line: self.line_no,
                        reason: format!("invalid UTF-8: {e}"),
                    }))
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some(FeedRecord::parse(trimmed).map_err(|e| FeedError::Malformed {
                line: self.line_no,
                reason: e.to_string(),
            }));
        }
        None
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Open the feed named by configuration, if any
pub async fn open_feed(source: &FeedSource) -> Result<Option<Box<dyn TaskFeed>>, FeedError> {
    Ok(match source {
        FeedSource::None => None,
        FeedSource::Stdin => Some(Box::new(JsonLinesFeed::stdin())),
        FeedSource::File { path } => Some(Box::new(JsonLinesFeed::open(path).await?)),
    })
}

/// Per-feed counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    /// Assignments the scheduler accepted, duplicates included
    pub assigned: u64,
    /// Cancel requests applied
    pub cancelled: u64,
    /// Records the scheduler refused
    pub rejected: u64,
    /// Lines that could not be decoded
    pub malformed: u64,
}

/// Apply one record to the scheduler
pub fn apply(record: FeedRecord, scheduler: &Scheduler, stats: &mut FeedStats) {
    match record {
        FeedRecord::Assign(assignment) => {
            let task_id = assignment.task_id.clone();
            match scheduler.assign(assignment) {
                Ok(status) => {
                    stats.assigned += 1;
                    debug!(task_id = %task_id, status = status.as_str(), "Assignment accepted");
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!(task_id = %task_id, error = %e, "Assignment rejected");
                }
            }
        }
        FeedRecord::Cancel { task_id } => match scheduler.cancel(&task_id) {
            Ok(status) => {
                stats.cancelled += 1;
                info!(task_id = %task_id, status = status.as_str(), "Cancel applied");
            }
            Err(SchedulerError::UnknownTask(_)) => {
                stats.rejected += 1;
                warn!(task_id = %task_id, "Cancel for unknown task");
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(task_id = %task_id, error = %e, "Cancel failed");
            }
        },
    }
}

/// Drain `feed` into the scheduler until it ends or `cancel` fires
pub async fn run_feed<F>(feed: &mut F, scheduler: &Scheduler, cancel: &CancellationToken) -> FeedStats
where
    F: TaskFeed + ?Sized,
{
    let mut stats = FeedStats::default();
    info!(feed = feed.name(), "Task feed started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = feed.next_record() => next,
        };
        match next {
            Some(Ok(record)) => apply(record, scheduler, &mut stats),
            Some(Err(FeedError::Malformed { line, reason })) => {
                stats.malformed += 1;
                warn!(feed = feed.name(), line, reason = %reason, "Skipping malformed record");
            }
            Some(Err(e)) => {
                warn!(feed = feed.name(), error = %e, "Task feed failed");
                break;
            }
            None => break,
        }
    }
    info!(
        feed = feed.name(),
        assigned = stats.assigned,
        cancelled = stats.cancelled,
        rejected = stats.rejected,
        malformed = stats.malformed,
        "Task feed ended"
    );
    stats
}
