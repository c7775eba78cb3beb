mod template;

pub use template::{DEFAULT_PATTERN, DEFAULT_PREFIX, DEFAULT_SUFFIX, FileNameTemplate};

use crate::error::{Error, Result};
use crate::events::{Event, StatusSink};
use crate::protocol::{ProtocolConfig, SampleBlock};
use crate::watchdog::{Heartbeat, Watchdog};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const THREAD_NAME: &str = "writer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    // One file per `write_now` trigger; blocks wait in the queue until then.
    Manual,
    // A new file for every `interval` of block time, anchored at the first block.
    Automatic { interval: Duration },
    // Blocks append to the current file; `write_now` closes it and the next
    // block opens a fresh one.
    ManualAuto,
}

// What happens to queued blocks while files cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    Unbounded,
    DropOldest { max_blocks: usize },
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub directory: PathBuf,
    pub template: FileNameTemplate,
    pub mode: RotationMode,
    pub retention: Retention,
    // Minimum delay between attempts after a failed open or write.
    pub retry_interval: Duration,
    pub tick: Duration,
    pub response_timeout: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            template: FileNameTemplate::default(),
            mode: RotationMode::Automatic {
                interval: Duration::from_secs(3600),
            },
            retention: Retention::Unbounded,
            retry_interval: Duration::from_secs(1),
            tick: Duration::from_millis(100),
            response_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteQueueEntry {
    pub sequence: u64,
    pub block: SampleBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterSummary {
    pub blocks_written: u64,
    pub items_written: u64,
    pub files_opened: u64,
    pub dropped_blocks: u64,
    pub unwritten_blocks: usize,
}

enum Command {
    Block(WriteQueueEntry),
    WriteNow,
    SetMode(RotationMode),
    SetTemplate(FileNameTemplate),
    Flush(Sender<Result<()>>),
    Shutdown(Sender<WriterSummary>),
}

// Producer side of the writer queue. Enqueueing never blocks.
#[derive(Clone)]
pub struct BlockQueue {
    tx: Sender<Command>,
    next_sequence: Arc<AtomicU64>,
}

impl BlockQueue {
    // Hand a block to the writer thread; returns its sequence number.
    pub fn enqueue(&self, block: SampleBlock) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.send(Command::Block(WriteQueueEntry { sequence, block }))?;
        Ok(sequence)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::watchdog(THREAD_NAME, "has exited"))
    }
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockQueue")
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug)]
pub struct FileWriter {
    queue: BlockQueue,
    handle: Option<JoinHandle<()>>,
    response_timeout: Duration,
}

impl FileWriter {
    pub fn spawn(
        settings: WriterSettings,
        config: ProtocolConfig,
        sink: StatusSink,
        watchdog: &Watchdog,
    ) -> Result<Self> {
        validate_mode(settings.mode)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let response_timeout = settings.response_timeout;
        let heartbeat = watchdog.register(THREAD_NAME);
        let state = WriterLoop::new(settings, config, sink, heartbeat);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || state.run(rx))
            .map_err(|err| Error::watchdog(THREAD_NAME, format!("could not be started: {err}")))?;
        Ok(Self {
            queue: BlockQueue {
                tx,
                next_sequence: Arc::new(AtomicU64::new(0)),
            },
            handle: Some(handle),
            response_timeout,
        })
    }

    pub fn queue(&self) -> BlockQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, block: SampleBlock) -> Result<u64> {
        self.queue.enqueue(block)
    }

    // Rotation trigger: write everything queued and close the file.
    pub fn write_now(&self) -> Result<()> {
        self.queue.send(Command::WriteNow)
    }

    pub fn set_mode(&self, mode: RotationMode) -> Result<()> {
        validate_mode(mode)?;
        self.queue.send(Command::SetMode(mode))
    }

    // New name template, used from the next opened file on.
    pub fn set_template(&self, template: FileNameTemplate) -> Result<()> {
        self.queue.send(Command::SetTemplate(template))
    }

    // Wait until everything queued before this call was handled.
    //
    // Returns the write failure still outstanding, if any. In manual mode
    // queued blocks keep waiting for the next trigger.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.queue.send(Command::Flush(tx))?;
        match rx.recv_timeout(self.response_timeout) {
            Ok(result) => result,
            Err(_) => Err(Error::watchdog(
                THREAD_NAME,
                format!("did not finish flushing within {:?}", self.response_timeout),
            )),
        }
    }

    // Drain the queue, close the file and stop the thread.
    pub fn shutdown(mut self) -> Result<WriterSummary> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> Result<WriterSummary> {
        let Some(handle) = self.handle.take() else {
            return Err(Error::watchdog(THREAD_NAME, "was already shut down"));
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.queue.send(Command::Shutdown(tx))?;
        match rx.recv_timeout(self.response_timeout) {
            Ok(summary) => {
                if handle.join().is_err() {
                    return Err(Error::watchdog(THREAD_NAME, "panicked"));
                }
                Ok(summary)
            }
            Err(_) => Err(Error::watchdog(
                THREAD_NAME,
                format!("did not shut down within {:?}", self.response_timeout),
            )),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Err(err) = self.stop_thread()
        {
            log::error!("{err}");
        }
    }
}

fn validate_mode(mode: RotationMode) -> Result<()> {
    if let RotationMode::Automatic { interval } = mode
        && interval_millis(interval).is_none()
    {
        return Err(Error::Config(format!(
            "rotation interval of {interval:?} is out of range"
        )));
    }
    Ok(())
}

fn interval_millis(interval: Duration) -> Option<i64> {
    i64::try_from(interval.as_millis())
        .ok()
        .filter(|ms| *ms > 0 && *ms <= i64::MAX / 1000)
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    window_start: DateTime<Utc>,
    window_end: Option<DateTime<Utc>>,
}

struct WriterLoop {
    settings: WriterSettings,
    config: ProtocolConfig,
    sink: StatusSink,
    heartbeat: Heartbeat,
    pending: VecDeque<WriteQueueEntry>,
    // Leading entries of `pending` buffered into `current` but not yet flushed.
    in_flight: usize,
    current: Option<OpenFile>,
    anchor: Option<DateTime<Utc>>,
    last_sequence: Option<u64>,
    failing_since: Option<Instant>,
    last_attempt: Option<Instant>,
    summary: WriterSummary,
}

impl WriterLoop {
    fn new(
        settings: WriterSettings,
        config: ProtocolConfig,
        sink: StatusSink,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            settings,
            config,
            sink,
            heartbeat,
            pending: VecDeque::new(),
            in_flight: 0,
            current: None,
            anchor: None,
            last_sequence: None,
            failing_since: None,
            last_attempt: None,
            summary: WriterSummary::default(),
        }
    }

    fn run(mut self, rx: Receiver<Command>) {
        log::debug!("File writer started in {}", self.settings.directory.display());
        loop {
            self.heartbeat.beat();
            match rx.recv_timeout(self.settings.tick) {
                Ok(Command::Block(entry)) => {
                    self.push(entry);
                    if self.auto_writes() {
                        let _ = self.drain(false);
                    }
                }
                Ok(Command::WriteNow) => self.write_now(),
                Ok(Command::SetMode(mode)) => {
                    let _ = self.close_current();
                    self.settings.mode = mode;
                    self.anchor = None;
                    self.sink.info(format!("Rotation mode set to {mode:?}"));
                    if self.auto_writes() {
                        let _ = self.drain(false);
                    }
                }
                Ok(Command::SetTemplate(template)) => {
                    let _ = self.close_current();
                    self.sink
                        .info(format!("File name template set to {}", template.as_str()));
                    self.settings.template = template;
                }
                Ok(Command::Flush(reply)) => {
                    let result = self.flush();
                    let _ = reply.send(result);
                }
                Ok(Command::Shutdown(reply)) => {
                    let summary = self.finish();
                    let _ = reply.send(summary);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.failing_since.is_some() && self.auto_writes() {
                        let _ = self.drain(false);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish();
                    return;
                }
            }
        }
    }

    fn auto_writes(&self) -> bool {
        !matches!(self.settings.mode, RotationMode::Manual)
    }

    fn push(&mut self, entry: WriteQueueEntry) {
        if let Some(last) = self.last_sequence
            && entry.sequence <= last
        {
            self.sink.report(&Error::Integrity(format!(
                "block #{} arrived after block #{last}",
                entry.sequence
            )));
        }
        self.last_sequence = Some(entry.sequence);

        if let Retention::DropOldest { max_blocks } = self.settings.retention
            && self.failing_since.is_some()
        {
            while self.pending.len() >= max_blocks.max(1) {
                let Some(dropped) = self.pending.pop_front() else {
                    break;
                };
                self.summary.dropped_blocks += 1;
                self.sink.warning(format!(
                    "Retention limit of {max_blocks} blocks reached, dropped block #{} ({} items)",
                    dropped.sequence,
                    dropped.block.len()
                ));
            }
        }
        self.pending.push_back(entry);
    }

    fn write_now(&mut self) {
        if self.pending.is_empty() {
            self.sink.trace("Nothing to write to file");
            let _ = self.close_current();
            return;
        }
        if self.drain(true).is_ok() {
            let _ = self.close_current();
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.auto_writes() {
            self.drain(true)?;
        }
        self.confirm()
    }

    fn finish(&mut self) -> WriterSummary {
        if !self.pending.is_empty() {
            let _ = self.drain(true);
        }
        let _ = self.close_current();
        self.summary.unwritten_blocks = self.pending.len();
        if !self.pending.is_empty() {
            let items: usize = self.pending.iter().map(|entry| entry.block.len()).sum();
            self.sink.warning(format!(
                "{} blocks ({items} items) could not be written and are discarded",
                self.pending.len()
            ));
        }
        log::debug!(
            "File writer stopped: {} blocks, {} items, {} files",
            self.summary.blocks_written,
            self.summary.items_written,
            self.summary.files_opened
        );
        self.summary
    }

    // Write queued blocks in order. Without `force`, attempts after a failure
    // wait for the retry interval. Blocks leave the queue only once flushed.
    fn drain(&mut self, force: bool) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if !force
            && self.failing_since.is_some()
            && let Some(last) = self.last_attempt
            && last.elapsed() < self.settings.retry_interval
        {
            return Ok(());
        }
        self.last_attempt = Some(Instant::now());

        while self.in_flight < self.pending.len() {
            let first = self.pending[self.in_flight].block.first_timestamp();
            if let Err(err) = self.ensure_file(first) {
                return Err(self.fail(err));
            }
            let Some(file) = self.current.as_mut() else {
                break;
            };
            let text = format_block(&self.pending[self.in_flight].block);
            if let Err(source) = file.writer.write_all(text.as_bytes()) {
                let path = file.path.clone();
                self.discard_current();
                return Err(self.fail(Error::io(path, source)));
            }
            self.in_flight += 1;
        }

        self.confirm()?;
        if let Some(since) = self.failing_since.take() {
            self.sink.info(format!(
                "Writing to {} recovered after {:?}",
                self.settings.directory.display(),
                since.elapsed()
            ));
        }
        Ok(())
    }

    // Make sure the open file is the right one for a block starting at `first`.
    fn ensure_file(&mut self, first: DateTime<Utc>) -> Result<()> {
        if let Some(file) = &self.current {
            let inside = match file.window_end {
                Some(end) => first >= file.window_start && first < end,
                None => true,
            };
            if inside {
                return Ok(());
            }
        }
        self.close_current()?;

        let (window_start, window_end) = match self.settings.mode {
            RotationMode::Automatic { interval } => {
                let Some(step) = interval_millis(interval) else {
                    return Err(Error::Config(format!("invalid rotation interval {interval:?}")));
                };
                let anchor = *self.anchor.get_or_insert(first);
                let offset = (first - anchor).num_milliseconds().div_euclid(step);
                let start = anchor + TimeDelta::milliseconds(offset * step);
                (start, Some(start + TimeDelta::milliseconds(step)))
            }
            RotationMode::Manual | RotationMode::ManualAuto => (first, None),
        };

        let name = self.settings.template.render(window_start, &self.config);
        let path = self.settings.directory.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::io(&path, source))?;
        self.summary.files_opened += 1;
        self.sink.info(format!("Opened output file {}", path.display()));
        self.current = Some(OpenFile {
            path,
            writer: BufWriter::new(file),
            window_start,
            window_end,
        });
        Ok(())
    }

    // Flush the open file, then retire and count the blocks that reached it.
    fn confirm(&mut self) -> Result<()> {
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        if let Err(source) = file.writer.flush() {
            let path = file.path.clone();
            self.discard_current();
            return Err(self.fail(Error::io(path, source)));
        }
        if self.in_flight == 0 {
            return Ok(());
        }
        let path = file.path.clone();
        let items: usize = self
            .pending
            .drain(..self.in_flight)
            .map(|entry| entry.block.len())
            .sum();
        self.summary.blocks_written += self.in_flight as u64;
        self.summary.items_written += items as u64;
        self.in_flight = 0;
        self.sink
            .trace(format!("Written {items} items to file {}", path.display()));
        self.sink.publish(Event::Written { items, path });
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        self.confirm()?;
        if let Some(file) = self.current.take() {
            log::debug!("Closed output file {}", file.path.display());
        }
        Ok(())
    }

    // Forget the open file without flushing; its unflushed blocks stay queued.
    fn discard_current(&mut self) {
        if let Some(file) = self.current.take() {
            let (_file, _unflushed) = file.writer.into_parts();
        }
        self.in_flight = 0;
    }

    // Record a failure; only the first error of an episode is reported.
    fn fail(&mut self, err: Error) -> Error {
        if self.failing_since.is_none() {
            self.failing_since = Some(Instant::now());
            self.sink.report(&err);
            self.sink.warning(format!(
                "{} blocks retained until writing succeeds",
                self.pending.len()
            ));
        }
        err
    }
}

// Queue whose blocks are collected instead of written.
#[cfg(test)]
pub(crate) fn capture_queue() -> (BlockQueue, impl Fn() -> Vec<SampleBlock>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let queue = BlockQueue {
        tx,
        next_sequence: Arc::new(AtomicU64::new(0)),
    };
    let collected = move || {
        rx.try_iter()
            .filter_map(|command| match command {
                Command::Block(entry) => Some(entry.block),
                _ => None,
            })
            .collect()
    };
    (queue, collected)
}

fn format_block(block: &SampleBlock) -> String {
    let mut text = String::with_capacity(block.len() * 64);
    for (timestamp, sample) in block.iter() {
        text.push_str(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));
        for value in sample.channels {
            text.push('\t');
            text.push_str(&value.to_string());
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Sample;
    use chrono::TimeZone;
    use std::fs;

    fn block_at(start: DateTime<Utc>, count: usize, value: i32) -> SampleBlock {
        let timestamps = (0..count)
            .map(|i| start + TimeDelta::milliseconds(i as i64 * 10))
            .collect();
        let samples = (0..count)
            .map(|i| Sample::new([value, value + i as i32, -value]))
            .collect();
        SampleBlock::new(timestamps, samples).unwrap()
    }

    fn settings(dir: &std::path::Path, mode: RotationMode) -> WriterSettings {
        WriterSettings {
            directory: dir.to_path_buf(),
            mode,
            retry_interval: Duration::from_millis(10),
            tick: Duration::from_millis(10),
            ..WriterSettings::default()
        }
    }

    fn output_files(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn lines_carry_timestamp_and_channels() {
        let block = block_at(t0(), 2, 5);
        assert_eq!(
            format_block(&block),
            "2024-06-01T12:00:00.000000Z\t5\t5\t-5\n2024-06-01T12:00:00.010000Z\t5\t6\t-5\n"
        );
    }

    #[test]
    fn manual_mode_writes_only_on_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, events) = StatusSink::channel();
        let writer = FileWriter::spawn(
            settings(dir.path(), RotationMode::Manual),
            ProtocolConfig::default(),
            sink,
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        writer.enqueue(block_at(t0(), 3, 1)).unwrap();
        writer.flush().unwrap();
        assert!(output_files(dir.path()).is_empty());

        writer.write_now().unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::seconds(5), 2, 2)).unwrap();
        writer.write_now().unwrap();
        writer.write_now().unwrap();
        let summary = writer.shutdown().unwrap();

        let files = output_files(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read_to_string(&files[0]).unwrap().lines().count(), 3);
        assert_eq!(fs::read_to_string(&files[1]).unwrap().lines().count(), 2);
        assert_eq!(summary.files_opened, 2);
        assert_eq!(summary.items_written, 5);

        let events: Vec<Event> = events.try_iter().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            Event::Status { message, .. } if message == "Nothing to write to file"
        )));
        let written: usize = events
            .iter()
            .filter_map(|event| match event {
                Event::Written { items, .. } => Some(*items),
                _ => None,
            })
            .sum();
        assert_eq!(written, 5);
    }

    #[test]
    fn manual_auto_appends_until_next_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::spawn(
            settings(dir.path(), RotationMode::ManualAuto),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        writer.enqueue(block_at(t0(), 2, 1)).unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::seconds(1), 2, 2)).unwrap();
        writer.flush().unwrap();
        assert_eq!(output_files(dir.path()).len(), 1);

        writer.write_now().unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::seconds(2), 2, 3)).unwrap();
        let summary = writer.shutdown().unwrap();

        let files = output_files(dir.path());
        assert_eq!(files.len(), 2);
        let first = fs::read_to_string(&files[0]).unwrap();
        let values: Vec<&str> = first
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(values, ["1", "1", "2", "2"]);
        assert_eq!(summary.blocks_written, 3);
    }

    #[test]
    fn automatic_mode_never_splits_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::spawn(
            settings(
                dir.path(),
                RotationMode::Automatic {
                    interval: Duration::from_secs(1),
                },
            ),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        // 150 samples at 10 ms span 1.5 s but belong to the window they start in.
        writer.enqueue(block_at(t0(), 150, 1)).unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::milliseconds(1500), 10, 2)).unwrap();
        let summary = writer.shutdown().unwrap();

        let files = output_files(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read_to_string(&files[0]).unwrap().lines().count(), 150);
        assert_eq!(fs::read_to_string(&files[1]).unwrap().lines().count(), 10);
        assert_eq!(summary.items_written, 160);
    }

    #[test]
    fn blocks_are_retained_while_the_directory_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("later");
        let (sink, events) = StatusSink::channel();
        let writer = FileWriter::spawn(
            settings(&dir, RotationMode::ManualAuto),
            ProtocolConfig::default(),
            sink,
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        writer.enqueue(block_at(t0(), 4, 1)).unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::seconds(1), 4, 2)).unwrap();
        let err = writer.flush().unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        let errors = events
            .try_iter()
            .filter(|event| matches!(event, Event::Status { level: crate::events::Level::Error, .. }))
            .count();
        assert_eq!(errors, 1);

        fs::create_dir(&dir).unwrap();
        writer.flush().unwrap();
        let summary = writer.shutdown().unwrap();
        assert_eq!(summary.items_written, 8);
        assert_eq!(summary.unwritten_blocks, 0);
        let files = output_files(&dir);
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read_to_string(&files[0]).unwrap().lines().count(), 8);
    }

    #[test]
    fn drop_oldest_bounds_the_backlog() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("missing");
        let writer = FileWriter::spawn(
            WriterSettings {
                retention: Retention::DropOldest { max_blocks: 2 },
                ..settings(&dir, RotationMode::ManualAuto)
            },
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        for i in 0..5 {
            writer
                .enqueue(block_at(t0() + TimeDelta::seconds(i), 1, i as i32))
                .unwrap();
        }
        assert!(writer.flush().is_err());
        fs::create_dir(&dir).unwrap();
        let summary = writer.shutdown().unwrap();

        assert_eq!(summary.dropped_blocks, 3);
        assert_eq!(summary.blocks_written, 2);
        let files = output_files(&dir);
        let text = fs::read_to_string(&files[0]).unwrap();
        let values: Vec<&str> = text
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(values, ["3", "4"]);
    }

    #[test]
    fn shutdown_reports_blocks_it_could_not_write() {
        let root = tempfile::tempdir().unwrap();
        let writer = FileWriter::spawn(
            settings(&root.path().join("never"), RotationMode::ManualAuto),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();
        writer.enqueue(block_at(t0(), 3, 1)).unwrap();
        let summary = writer.shutdown().unwrap();
        assert_eq!(summary.unwritten_blocks, 1);
        assert_eq!(summary.items_written, 0);
    }

    #[test]
    fn failed_flush_keeps_blocks_queued() {
        let (sink, events) = StatusSink::channel();
        let writer = FileWriter::spawn(
            WriterSettings {
                template: FileNameTemplate::new("full", "", "").unwrap(),
                ..settings(std::path::Path::new("/dev"), RotationMode::ManualAuto)
            },
            ProtocolConfig::default(),
            sink,
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        for i in 0..3 {
            writer
                .enqueue(block_at(t0() + TimeDelta::seconds(i), 1, i as i32))
                .unwrap();
        }
        assert!(matches!(writer.flush(), Err(Error::Io { .. })));
        let summary = writer.shutdown().unwrap();

        assert_eq!(summary.blocks_written, 0);
        assert_eq!(summary.items_written, 0);
        assert_eq!(summary.unwritten_blocks, 3);
        assert!(!events.try_iter().any(|event| matches!(event, Event::Written { .. })));
    }

    #[test]
    fn switching_to_manual_auto_writes_the_backlog_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::spawn(
            settings(dir.path(), RotationMode::Manual),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        for i in 0..3 {
            writer
                .enqueue(block_at(t0() + TimeDelta::seconds(i), 1, i as i32))
                .unwrap();
        }
        writer.flush().unwrap();
        assert!(output_files(dir.path()).is_empty());

        writer.set_mode(RotationMode::ManualAuto).unwrap();
        writer.flush().unwrap();
        let files = output_files(dir.path());
        assert_eq!(files.len(), 1);
        let text = fs::read_to_string(&files[0]).unwrap();
        let values: Vec<&str> = text
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(values, ["0", "1", "2"]);

        assert!(matches!(
            writer.set_mode(RotationMode::Automatic {
                interval: Duration::ZERO
            }),
            Err(Error::Config(_))
        ));
        writer.shutdown().unwrap();
    }

    #[test]
    fn new_template_applies_from_the_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::spawn(
            settings(dir.path(), RotationMode::ManualAuto),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        )
        .unwrap();

        writer.enqueue(block_at(t0(), 2, 1)).unwrap();
        writer.flush().unwrap();
        writer
            .set_template(FileNameTemplate::new("site-", "{hour}{minute}", ".txt").unwrap())
            .unwrap();
        writer.enqueue(block_at(t0() + TimeDelta::seconds(1), 2, 2)).unwrap();
        let summary = writer.shutdown().unwrap();

        let names: Vec<String> = output_files(dir.path())
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["data-2024-06-01-12-00-00.dat", "site-1200.txt"]);
        assert_eq!(summary.files_opened, 2);
    }

    #[test]
    fn zero_rotation_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileWriter::spawn(
            settings(
                dir.path(),
                RotationMode::Automatic {
                    interval: Duration::ZERO,
                },
            ),
            ProtocolConfig::default(),
            StatusSink::detached(),
            &Watchdog::new(Duration::from_secs(5)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
