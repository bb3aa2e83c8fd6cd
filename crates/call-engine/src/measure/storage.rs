//! Row capture and disk storage for measurement apps.
//!
//! A [`DataStorer`] accepts rows from the event-processing side, buffers
//! them in a fixed-size ring and flushes full rings to a pluggable
//! [`Store`] from a background writer task. Closing the channel acts as
//! the termination sentinel: the writer flushes the partial buffer and
//! exits.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Minimum width reserved for string columns in the binary store; app
/// names should generally be shorter than this.
pub const MIN_STR_WIDTH: usize = 30;

const ENQUEUE_WARN_THRESHOLD_MS: u128 = 5;

/// A storable measurement row.
pub trait Record: Clone + Send + Serialize + DeserializeOwned + 'static {
    fn field_names() -> &'static [&'static str];

    /// Render the row for the CSV store, one string per field.
    fn csv_row(&self) -> Vec<String>;

    /// Pad string columns up to [`MIN_STR_WIDTH`] for fixed-width stores.
    fn pad_strings(&mut self) {}
}

/// A circular buffer of the most recently captured rows.
#[derive(Debug)]
pub struct RingBuffer<R> {
    slots: Vec<Option<R>>,
    ri: u64,
}

impl<R: Clone> RingBuffer<R> {
    pub fn new(size: usize) -> RingBuffer<R> {
        assert!(size > 0, "ring buffer size must be positive");
        RingBuffer {
            slots: vec![None; size],
            ri: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Absolute insertion index of the next row.
    pub fn insertions(&self) -> u64 {
        self.ri
    }

    /// Next in-buffer insertion slot.
    pub fn bi(&self) -> usize {
        (self.ri % self.slots.len() as u64) as usize
    }

    pub fn put(&mut self, row: R) {
        let bi = self.bi();
        self.slots[bi] = Some(row);
        self.ri += 1;
    }

    /// True right after an insertion filled the last free slot.
    pub fn is_full(&self) -> bool {
        self.bi() == 0 && self.ri > self.slots.len() as u64 - 1
    }

    /// Rows currently buffered, oldest slot first.
    pub fn read(&self) -> Vec<R> {
        self.slots[..self.len()]
            .iter()
            .filter_map(|slot| slot.clone())
            .collect()
    }

    /// Rows inserted since the last full wrap.
    pub fn tail(&self) -> Vec<R> {
        if self.is_full() {
            return Vec::new();
        }
        self.slots[..self.bi()]
            .iter()
            .filter_map(|slot| slot.clone())
            .collect()
    }

    /// Buffered row count up to the last inserted data point.
    pub fn len(&self) -> usize {
        let bi = self.bi();
        if bi == 0 {
            if self.ri < self.slots.len() as u64 {
                0
            } else {
                self.slots.len()
            }
        } else {
            bi
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A disk sink for measurement rows.
pub trait Store<R: Record>: Send + 'static {
    fn open(&mut self) -> Result<()>;
    fn put(&mut self, rows: &[R]) -> Result<()>;
    /// Push buffered bytes to disk with an fsync.
    fn flush(&mut self) -> Result<()>;
    fn path(&self) -> &Path;
}

/// CSV storage: one header row, then comma-separated rows in field order.
pub struct CsvStore<R> {
    path: PathBuf,
    file: Option<File>,
    _marker: std::marker::PhantomData<R>,
}

impl<R: Record> CsvStore<R> {
    pub fn new(path: impl Into<PathBuf>) -> CsvStore<R> {
        CsvStore {
            path: path.into(),
            file: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Read every data row (header excluded) back as strings.
    pub fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let mut rows: Vec<Vec<String>> = contents
            .lines()
            .map(|line| line.split(',').map(unescape_field).collect())
            .collect();
        if !rows.is_empty() {
            rows.remove(0);
        }
        Ok(rows)
    }

    /// Store row sets under `dir`, one csv file per name.
    pub fn multiwrite(dir: &Path, items: &[(String, Vec<R>)]) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, rows) in items {
            let filename = format!("{}.csv", name.replace('/', "-"));
            let mut store = CsvStore::<R>::new(dir.join(filename));
            store.open()?;
            store.put(rows)?;
            store.flush()?;
        }
        Ok(())
    }

    /// Read every csv file under `dir`, plain data sets before derived
    /// (dash-named) ones.
    pub fn multiread(dir: &Path) -> Result<Vec<(String, Vec<Vec<String>>)>> {
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".csv"))
            .collect();
        names.sort_by_key(|name| (name.contains('-'), name.clone()));
        let mut sets = Vec::new();
        for name in names {
            let rows = CsvStore::<R>::read_rows(&dir.join(&name))?;
            sets.push((name, rows));
        }
        Ok(sets)
    }
}

impl<R: Record> Store<R> for CsvStore<R> {
    fn open(&mut self) -> Result<()> {
        let existed = self.path.exists() && std::fs::metadata(&self.path)?.len() > 0;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if !existed {
            writeln!(file, "{}", R::field_names().join(","))?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn put(&mut self, rows: &[R]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Config("csv store is not open".to_string()))?;
        for row in rows {
            let fields: Vec<String> = row.csv_row().iter().map(|f| escape_field(f)).collect();
            writeln!(file, "{}", fields.join(","))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn unescape_field(field: &str) -> String {
    let trimmed = field.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Columnar binary storage: length-prefixed bincode frames of row batches,
/// string columns padded to a fixed minimum width.
pub struct BinStore<R> {
    path: PathBuf,
    file: Option<File>,
    _marker: std::marker::PhantomData<R>,
}

impl<R: Record> BinStore<R> {
    pub fn new(path: impl Into<PathBuf>) -> BinStore<R> {
        BinStore {
            path: path.into(),
            file: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Read the entire data set back.
    pub fn read(path: &Path) -> Result<Vec<R>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let mut rows = Vec::new();
        let mut offset = 0usize;
        while offset + 8 <= bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            offset += 8;
            if offset + len > bytes.len() {
                return Err(Error::Config("truncated binary store frame".to_string()));
            }
            let batch: Vec<R> = bincode::deserialize(&bytes[offset..offset + len])?;
            rows.extend(batch);
            offset += len;
        }
        Ok(rows)
    }

    pub fn multiwrite(dir: &Path, items: &[(String, Vec<R>)]) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, rows) in items {
            let filename = format!("{}.bin", name.replace('/', "-"));
            let mut store = BinStore::<R>::new(dir.join(filename));
            store.open()?;
            store.put(rows)?;
            store.flush()?;
        }
        Ok(())
    }

    pub fn multiread(dir: &Path) -> Result<Vec<(String, Vec<R>)>> {
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".bin"))
            .collect();
        names.sort_by_key(|name| (name.contains('-'), name.clone()));
        let mut sets = Vec::new();
        for name in names {
            let rows = BinStore::<R>::read(&dir.join(&name))?;
            sets.push((name, rows));
        }
        Ok(sets)
    }
}

impl<R: Record> Store<R> for BinStore<R> {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    fn put(&mut self, rows: &[R]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Config("binary store is not open".to_string()))?;
        let padded: Vec<R> = rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.pad_strings();
                row
            })
            .collect();
        let frame = bincode::serialize(&padded)?;
        file.write_all(&(frame.len() as u64).to_le_bytes())?;
        file.write_all(&frame)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Receive and store row-oriented data points from measurement apps.
///
/// Single producer, single consumer: rows travel over a channel to a
/// background writer which owns the disk store; the ring itself is
/// read-only from the operator side (a latest-contents snapshot).
pub struct DataStorer<R: Record> {
    name: String,
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<R>>>,
    ring: Arc<Mutex<RingBuffer<R>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Record> DataStorer<R> {
    pub const DEFAULT_BUF_SIZE: usize = 1024;

    pub fn new(name: impl Into<String>, store: Box<dyn Store<R>>, buf_size: usize) -> DataStorer<R> {
        let name = name.into();
        let path = store.path().to_path_buf();
        let ring = Arc::new(Mutex::new(RingBuffer::new(buf_size)));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(consume_and_write(rx, ring.clone(), store, name.clone()));
        DataStorer {
            name,
            path,
            tx: Mutex::new(Some(tx)),
            ring,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// CSV-backed storer with the default ring size.
    pub fn csv(name: impl Into<String>, path: impl Into<PathBuf>) -> DataStorer<R> {
        DataStorer::new(name, Box::new(CsvStore::new(path)), Self::DEFAULT_BUF_SIZE)
    }

    /// Binary-backed storer with the default ring size.
    pub fn bin(name: impl Into<String>, path: impl Into<PathBuf>) -> DataStorer<R> {
        DataStorer::new(name, Box::new(BinStore::new(path)), Self::DEFAULT_BUF_SIZE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Push a row onto the writer queue.
    pub fn append_row(&self, row: R) {
        let start = Instant::now();
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(row).is_err() {
                    warn!("storer '{}' writer is gone, row dropped", self.name);
                }
            }
            None => warn!("storer '{}' is stopped, row dropped", self.name),
        }
        let elapsed = start.elapsed().as_millis();
        if elapsed > ENQUEUE_WARN_THRESHOLD_MS {
            warn!("queue put took '{elapsed}' ms");
        }
    }

    /// Latest buffered rows not yet pushed to disk.
    pub fn buffer(&self) -> Vec<R> {
        self.ring.lock().read()
    }

    /// Total rows accepted so far.
    pub fn row_count(&self) -> u64 {
        self.ring.lock().insertions()
    }

    /// Stop the writer, flushing any partial buffer to disk.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

async fn consume_and_write<R: Record>(
    mut rx: mpsc::UnboundedReceiver<R>,
    ring: Arc<Mutex<RingBuffer<R>>>,
    mut store: Box<dyn Store<R>>,
    name: String,
) {
    debug!("starting storage writer '{name}'");
    if let Err(e) = store.open() {
        error!("storage writer '{name}' failed to open store: {e}");
        return;
    }
    debug!("storage path is '{}'", store.path().display());

    while let Some(row) = rx.recv().await {
        let full_buffer = {
            let mut ring = ring.lock();
            ring.put(row);
            if ring.is_full() {
                Some(ring.read())
            } else {
                None
            }
        };
        if let Some(rows) = full_buffer {
            debug!("writing {} rows to storage...", rows.len());
            if let Err(e) = store.put(&rows).and_then(|_| store.flush()) {
                error!("storage write failed: {e}");
            }
        }
    }

    // channel closed: flush whatever the ring still holds
    let tail = ring.lock().tail();
    if !tail.is_empty() {
        if let Err(e) = store.put(&tail).and_then(|_| store.flush()) {
            error!("final storage flush failed: {e}");
        }
    }
    debug!("terminating frame writer '{name}'");
}
