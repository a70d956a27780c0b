//! Event store and the asynchronous writer in front of it
//!
//! The pipeline never touches the store directly: it hands events to an
//! [`EventWriter`], whose background thread batches them into appends. Appends
//! serialize on one writer lock; queries open their own read handle and never
//! wait on it.

use crate::error::{CounterError, Result};
use crate::types::{CrossingEvent, Direction};
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

/// In/out totals for one UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRollup {
    pub day: NaiveDate,
    #[serde(rename = "in")]
    pub in_count: u64,
    #[serde(rename = "out")]
    pub out_count: u64,
    pub net: i64,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl DailyRollup {
    pub fn from_events(day: NaiveDate, events: &[CrossingEvent]) -> Self {
        let in_count = events.iter().filter(|e| e.direction == Direction::In).count() as u64;
        let out_count = events.len() as u64 - in_count;
        Self {
            day,
            in_count,
            out_count,
            net: in_count as i64 - out_count as i64,
            first_event: events.iter().map(|e| e.timestamp).min(),
            last_event: events.iter().map(|e| e.timestamp).max(),
        }
    }
}

/// Durable, ordered log of crossing events
pub trait EventStore: Send + Sync {
    fn append(&self, event: &CrossingEvent) -> Result<()>;

    fn append_batch(&self, events: &[CrossingEvent]) -> Result<()> {
        events.iter().try_for_each(|e| self.append(e))
    }

    /// Events whose timestamp falls on `day` (UTC), in append order
    fn query(&self, day: NaiveDate) -> Result<Vec<CrossingEvent>>;

    fn rollup(&self, day: NaiveDate) -> Result<DailyRollup> {
        Ok(DailyRollup::from_events(day, &self.query(day)?))
    }
}

/// Append-only JSON-lines file, one event per line
pub struct JsonlEventStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CounterError::storage(format!("{}: {}", parent.display(), e)))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CounterError::storage(format!("{}: {}", path.display(), e)))?;
        let torn = Self::has_torn_tail(&path)
            .map_err(|e| CounterError::storage(format!("{}: {}", path.display(), e)))?;
        if torn {
            // Terminate the partial line so the next append starts on a fresh one
            log::warn!("{}: last line is incomplete, terminating it", path.display());
            file.write_all(b"\n")
                .and_then(|()| file.sync_data())
                .map_err(|e| CounterError::storage(format!("{}: {}", path.display(), e)))?;
        }
        log::info!("Event store at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Whether a non-empty file ends without a newline
    fn has_torn_tail(path: &Path) -> std::io::Result<bool> {
        let mut file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_lines(&self, events: &[CrossingEvent]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            serde_json::to_writer(&mut *writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl EventStore for JsonlEventStore {
    fn append(&self, event: &CrossingEvent) -> Result<()> {
        self.write_lines(std::slice::from_ref(event))
    }

    fn append_batch(&self, events: &[CrossingEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.write_lines(events)
    }

    fn query(&self, day: NaiveDate) -> Result<Vec<CrossingEvent>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CrossingEvent>(&line) {
                Ok(event) if event.timestamp.date_naive() == day => events.push(event),
                Ok(_) => {}
                // A torn final line from a crash must not hide the rest of the log
                Err(e) => log::warn!(
                    "{}:{}: skipping unreadable event: {}",
                    self.path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        Ok(events)
    }
}

/// In-memory store for tests and dry runs
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<CrossingEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<CrossingEvent> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, event: &CrossingEvent) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn query(&self, day: NaiveDate) -> Result<Vec<CrossingEvent>> {
        Ok(self
            .events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.timestamp.date_naive() == day)
            .cloned()
            .collect())
    }
}

/// A command for the writer thread
enum WriterCommand {
    Append(CrossingEvent),
    /// Reply once everything queued before it has been written
    Flush(Sender<()>),
}

#[derive(Debug, Default)]
struct WriterCounters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub written: u64,
    /// Rejected because the queue was full
    pub dropped: u64,
    /// Lost after a failed append and its retry
    pub failed: u64,
}

/// Non-blocking front end to an [`EventStore`]
pub struct EventWriter {
    command_tx: Option<Sender<WriterCommand>>,
    counters: Arc<WriterCounters>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventWriter {
    pub fn spawn(store: Arc<dyn EventStore>, capacity: usize, batch_size: usize) -> Result<Self> {
        let (command_tx, command_rx) = bounded::<WriterCommand>(capacity.max(1));
        let counters = Arc::new(WriterCounters::default());
        let thread_counters = Arc::clone(&counters);
        let batch_size = batch_size.max(1);
        let handle = thread::Builder::new()
            .name("event-writer".to_string())
            .spawn(move || Self::writer_loop(store, command_rx, batch_size, thread_counters))?;
        Ok(Self {
            command_tx: Some(command_tx),
            counters,
            handle: Some(handle),
        })
    }

    fn write_batch(store: &dyn EventStore, batch: &mut Vec<CrossingEvent>, counters: &WriterCounters) {
        if batch.is_empty() {
            return;
        }
        let result = store.append_batch(batch).or_else(|e| {
            log::warn!("Event append failed ({}), retrying once", e);
            store.append_batch(batch)
        });
        match result {
            Ok(()) => {
                counters.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                log::error!("Dropping {} events after failed retry: {}", batch.len(), e);
            }
        }
        batch.clear();
    }

    fn writer_loop(
        store: Arc<dyn EventStore>,
        command_rx: Receiver<WriterCommand>,
        batch_size: usize,
        counters: Arc<WriterCounters>,
    ) {
        log::info!("Event writer started");
        let mut batch = Vec::with_capacity(batch_size);
        let mut acks = Vec::new();

        // Block for the first command, then take whatever else is already queued
        while let Ok(first) = command_rx.recv() {
            let mut next = Some(first);
            while let Some(command) = next.take() {
                match command {
                    WriterCommand::Append(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            Self::write_batch(store.as_ref(), &mut batch, &counters);
                        }
                    }
                    WriterCommand::Flush(ack) => {
                        Self::write_batch(store.as_ref(), &mut batch, &counters);
                        acks.push(ack);
                    }
                }
                next = command_rx.try_recv().ok();
            }
            Self::write_batch(store.as_ref(), &mut batch, &counters);
            for ack in acks.drain(..) {
                let _ = ack.send(());
            }
        }

        log::info!(
            "Event writer stopped: {} written, {} dropped, {} failed",
            counters.written.load(Ordering::Relaxed),
            counters.dropped.load(Ordering::Relaxed),
            counters.failed.load(Ordering::Relaxed)
        );
    }

    /// Queue an event without blocking; `false` if it was dropped
    pub fn submit(&self, event: CrossingEvent) -> bool {
        let Some(tx) = &self.command_tx else {
            return false;
        };
        match tx.try_send(WriterCommand::Append(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Event queue full, dropped event ({} dropped so far)", dropped);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("Event writer is gone, event lost");
                false
            }
        }
    }

    /// Block until everything submitted so far has been written
    pub fn flush(&self) {
        if let Some(tx) = &self.command_tx {
            let (ack_tx, ack_rx) = bounded(1);
            if tx.send(WriterCommand::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue and stop the writer thread
    pub fn shutdown(&mut self) {
        self.command_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Event writer thread panicked");
            }
        }
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
