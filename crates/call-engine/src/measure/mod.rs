//! Measurement capture: ring-buffered row storage and the CDR app.

pub mod cdr;
pub mod storage;

pub use cdr::{Cdr, CdrRow};
pub use storage::{BinStore, CsvStore, DataStorer, Record, RingBuffer, Store};
