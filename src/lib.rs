//! Append-only commit-log storage engine for a distributed message broker.
//!
//! `CommitLog` (see [`engine`]) wires a segment-based, memory-mapped append
//! log (`segment`, `segment_queue`) behind a single-writer critical section
//! (`appender`) with pluggable durability (`flusher`), crash recovery
//! (`recoverer`), and the handful of external collaborators (`dispatch`,
//! `ha`, `checkpoint`) a broker supplies at construction time.

pub mod allocate;
pub mod appender;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flusher;
pub mod ha;
pub mod mmap;
pub mod record;
pub mod recoverer;
pub mod segment;
pub mod segment_queue;

pub use checkpoint::StoreCheckpoint;
pub use clock::{Clock, QuantaClock, SystemClock};
pub use config::{BrokerRole, CommitLogConfig, FlushDiskType};
pub use dispatch::{DispatchRequest, DispatchSink, NullDispatchSink};
pub use engine::{CommitLog, PutResult, PutStatus, ShutdownKind};
pub use error::{Error, Result};
pub use ha::{HAService, NoopHAService};
pub use record::MessageExt;
pub use recoverer::RecoveryOutcome;
