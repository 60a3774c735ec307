//! Record sinks.
//!
//! Producers sit on the tick path and the network path, so `push_record`
//! never blocks: the CSV sink pushes onto a bounded lock-free queue that a
//! background thread drains to disk, dropping (and counting) records when
//! the queue is full.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_queue::ArrayQueue;
use csv::Writer;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::Result;

const RECORD_CAPACITY: usize = 16_384; // per sink
const CONSUMER_POLL_MS: u64 = 5;
const DRAIN_BATCH: usize = 256;
const FLUSH_BATCHES: usize = 8;

/// One row: field names in column order with their numeric values.
///
/// Booleans are stored as 0/1 and missing values as NaN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, f64)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            fields: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.fields.push((name.into(), value));
    }

    pub fn field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.fields.iter().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fire-and-forget record sink.
pub trait Recorder: Send + Sync {
    fn push_record(&self, record: Record);

    /// Flushes whatever is buffered. Records pushed afterwards may be lost.
    fn shutdown(&self) {}
}

pub type SharedRecorder = Arc<dyn Recorder>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn push_record(&self, _record: Record) {}
}

/// Keeps every record in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<Record>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Every value recorded under `name`, in push order.
    pub fn column(&self, name: &str) -> Vec<f64> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| r.get(name))
            .collect()
    }
}

impl Recorder for MemoryRecorder {
    fn push_record(&self, record: Record) {
        self.records.lock().push(record);
    }
}

/// CSV sink backed by a lock-free queue and a consumer thread.
pub struct CsvRecorder {
    path: PathBuf,
    queue: Arc<ArrayQueue<Record>>,
    dropped: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl CsvRecorder {
    /// Creates (truncating) `path` and starts the consumer thread. The header
    /// row is taken from the first record pushed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let queue = Arc::new(ArrayQueue::new(RECORD_CAPACITY));
        let dropped = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let consumer = {
            let queue = queue.clone();
            let running = running.clone();
            let dropped = dropped.clone();
            let name = path.display().to_string();
            thread::Builder::new()
                .name("csv-recorder".into())
                .spawn(move || {
                    let mut wtr = Writer::from_writer(BufWriter::new(file));
                    let mut header: Option<Vec<String>> = None;
                    let mut flush_counter = 0usize;

                    while running.load(Ordering::SeqCst) {
                        let mut any = false;
                        for _ in 0..DRAIN_BATCH {
                            match queue.pop() {
                                Some(record) => {
                                    any = true;
                                    write_row(&mut wtr, &mut header, &record);
                                }
                                None => break,
                            }
                        }
                        if any {
                            flush_counter += 1;
                            if flush_counter >= FLUSH_BATCHES {
                                wtr.flush().ok();
                                flush_counter = 0;
                            }
                        } else {
                            thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
                        }
                    }

                    // final drain
                    while let Some(record) = queue.pop() {
                        write_row(&mut wtr, &mut header, &record);
                    }
                    if let Err(e) = wtr.flush() {
                        error!("failed to flush {name}: {e}");
                    }
                    let lost = dropped.load(Ordering::Relaxed);
                    if lost > 0 {
                        warn!("{name}: {lost} records dropped on a full queue");
                    }
                    debug!("[CsvRecorder] {name} closed");
                })?
        };

        Ok(Self {
            path,
            queue,
            dropped,
            running,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn write_row<W: std::io::Write>(
    wtr: &mut Writer<W>,
    header: &mut Option<Vec<String>>,
    record: &Record,
) {
    let columns = header.get_or_insert_with(|| {
        let names: Vec<String> = record.names().map(str::to_owned).collect();
        wtr.write_record(&names).ok();
        names
    });

    let row: Vec<String> = if record.names().eq(columns.iter().map(String::as_str)) {
        record.values().map(|v| v.to_string()).collect()
    } else {
        columns
            .iter()
            .map(|c| record.get(c).unwrap_or(f64::NAN).to_string())
            .collect()
    };
    if let Err(e) = wtr.write_record(&row) {
        error!("failed to write record: {e}");
    }
}

impl Recorder for CsvRecorder {
    fn push_record(&self, record: Record) {
        if self.queue.push(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.consumer.lock().take();
        if let Some(h) = handle {
            if h.join().is_err() {
                error!("CSV consumer for {} panicked", self.path.display());
            }
        }
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
