//! Append-only event log with group-commit durability, snapshots and
//! deterministic replay.

pub mod error;
pub mod event;
mod log;
pub mod snapshot;

pub use error::WalError;
pub use event::{
    BalanceReason, Event, EventBody, EventKind, EventPayload, EventSink, MemorySink, RejectCode,
};
pub use log::{EventIter, EventLog, ReplayControl, WalConfig, WalSink};
pub use snapshot::{
    BookDump, RestingOrderDump, SnapshotSections, StateDump, list_snapshots, load_snapshot,
    snapshot_path, write_snapshot,
};
