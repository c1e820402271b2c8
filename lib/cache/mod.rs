/// Cache size bookkeeping and the in-use lock table.
pub mod eviction;

pub use eviction::{EvictionDaemon, EvictionTask, ScanReport};
