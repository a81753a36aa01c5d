//! BLE scanning and its development stand-ins.

pub mod scanner;

pub use scanner::{Scanner, SnapshotEntry};
