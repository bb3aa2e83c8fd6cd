//! Ring buffer and disk store behavior.

use serde::{Deserialize, Serialize};

use crate::measure::storage::{
    BinStore, CsvStore, DataStorer, Record, RingBuffer, Store, MIN_STR_WIDTH,
};
use crate::tests::wait_until;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestRow {
    seq: u64,
    label: String,
}

impl TestRow {
    fn new(seq: u64) -> TestRow {
        TestRow {
            seq,
            label: format!("row-{seq}"),
        }
    }
}

impl Record for TestRow {
    fn field_names() -> &'static [&'static str] {
        &["seq", "label"]
    }

    fn csv_row(&self) -> Vec<String> {
        vec![self.seq.to_string(), self.label.trim_end().to_string()]
    }

    fn pad_strings(&mut self) {
        while self.label.len() < MIN_STR_WIDTH {
            self.label.push(' ');
        }
    }
}

fn tmp_path(ext: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "switchgen_test_{}.{ext}",
        uuid::Uuid::new_v4().simple()
    ))
}

#[test]
fn ring_buffer_wraps_and_reports_fullness() {
    let mut ring: RingBuffer<TestRow> = RingBuffer::new(4);
    assert!(ring.is_empty());

    for seq in 0..3 {
        ring.put(TestRow::new(seq));
        assert!(!ring.is_full());
    }
    ring.put(TestRow::new(3));
    assert!(ring.is_full());
    assert_eq!(ring.len(), 4);
    assert_eq!(ring.read().len(), 4);
    assert!(ring.tail().is_empty());

    // one more row starts the next lap
    ring.put(TestRow::new(4));
    assert!(!ring.is_full());
    assert_eq!(ring.len(), 1);
    assert_eq!(ring.tail(), vec![TestRow::new(4)]);
}

#[tokio::test]
async fn storer_flushes_full_rings_and_partial_on_stop() {
    let path = tmp_path("csv");
    let storer = DataStorer::new("test", Box::new(CsvStore::<TestRow>::new(&path)), 4);

    for seq in 0..10 {
        storer.append_row(TestRow::new(seq));
    }
    // two full rings flushed in the background
    wait_until("two ring flushes", || {
        CsvStore::<TestRow>::read_rows(&path)
            .map(|rows| rows.len() == 8)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(storer.row_count(), 10);

    // the sentinel flushes the two buffered rows
    storer.stop().await;
    let rows = CsvStore::<TestRow>::read_rows(&path).unwrap();
    assert_eq!(rows.len(), 10);
    let seqs: Vec<String> = rows.iter().map(|row| row[0].clone()).collect();
    let expected: Vec<String> = (0..10).map(|seq| seq.to_string()).collect();
    assert_eq!(seqs, expected);

    // exactly one header line
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        contents.lines().filter(|line| *line == "seq,label").count(),
        1
    );
    let _ = std::fs::remove_file(&path);
}

#[test]
fn csv_store_writes_header_once_across_reopens() {
    let path = tmp_path("csv");
    {
        let mut store = CsvStore::<TestRow>::new(&path);
        store.open().unwrap();
        store.put(&[TestRow::new(1)]).unwrap();
        store.flush().unwrap();
    }
    {
        let mut store = CsvStore::<TestRow>::new(&path);
        store.open().unwrap();
        store.put(&[TestRow::new(2)]).unwrap();
        store.flush().unwrap();
    }
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        contents.lines().filter(|line| *line == "seq,label").count(),
        1
    );
    assert_eq!(CsvStore::<TestRow>::read_rows(&path).unwrap().len(), 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn bin_store_round_trips_with_string_padding() {
    let path = tmp_path("bin");
    let rows = vec![TestRow::new(1), TestRow::new(2)];
    {
        let mut store = BinStore::<TestRow>::new(&path);
        store.open().unwrap();
        store.put(&rows).unwrap();
        store.put(&[TestRow::new(3)]).unwrap();
        store.flush().unwrap();
    }
    let read = BinStore::<TestRow>::read(&path).unwrap();
    assert_eq!(read.len(), 3);
    for (row, seq) in read.iter().zip(1u64..) {
        assert_eq!(row.seq, seq);
        // the fixed minimum string width is enforced on disk
        assert!(row.label.len() >= MIN_STR_WIDTH);
        assert_eq!(row.label.trim_end(), format!("row-{seq}"));
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn multiwrite_then_multiread_preserves_sets() {
    let dir = tmp_path("d");
    let items = vec![
        ("cdr".to_string(), vec![TestRow::new(1)]),
        ("cdr/metrics".to_string(), vec![TestRow::new(2), TestRow::new(3)]),
    ];
    CsvStore::<TestRow>::multiwrite(&dir, &items).unwrap();

    let sets = CsvStore::<TestRow>::multiread(&dir).unwrap();
    assert_eq!(sets.len(), 2);
    // plain data sets come before derived-operator (dash named) ones
    assert_eq!(sets[0].0, "cdr.csv");
    assert_eq!(sets[1].0, "cdr-metrics.csv");
    assert_eq!(sets[0].1.len(), 1);
    assert_eq!(sets[1].1.len(), 2);
    let _ = std::fs::remove_dir_all(&dir);
}
