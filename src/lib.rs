//! Rolling time-series historian.
//!
//! Batches of timestamped topic values are written transactionally into a
//! SQLite file, which is archived under a timestamped name and replaced by a
//! fresh file once its configured period has elapsed.

pub mod historian;
pub mod storage;

pub use historian::{BatchOutcome, Historian, HistorianConfig, HistorianWorker, Record};
pub use storage::{ArchiveStore, Error, Result};
