//! `HAService` collaborator (§6): HA replication transport is explicitly
//! out of scope (§1) — this module only defines the interface the engine
//! calls through, plus a no-op stand-in for brokers that don't run with a
//! slave attached.

use std::time::Duration;

/// Consumed by the engine when `brokerRole` is `SyncMaster` and a put asks
/// to wait for slave acknowledgement. `isSlaveOK`/`putRequest`/`wakeUp`
/// mirror the three calls §6 lists as this collaborator's whole surface.
pub trait HAService: Send + Sync {
    /// Whether a slave has caught up close enough to `offset` to accept a
    /// new synchronous request. A `false` here means the engine returns
    /// `SlaveNotAvailable` without even enqueuing a request (§7).
    fn is_slave_ok(&self, offset: u64) -> bool;

    /// Enqueue a group-commit-style request for the slave to acknowledge
    /// `offset`, blocking up to `timeout`. Returns whether the ack arrived
    /// in time — the spec reuses `syncFlushTimeout` for this (§4.5, §9 open
    /// questions), which is why the engine passes it through unchanged.
    fn put_request(&self, offset: u64, timeout: Duration) -> bool;

    /// Nudge the HA transport's own wait loop, analogous to the flusher's
    /// wake-on-write behavior.
    fn wake_up(&self);
}

/// Used when no slave is configured (`AsyncMaster`/`Slave` roles never
/// consult HA on the put path at all, and this is also a reasonable
/// default for `SyncMaster` in a single-node deployment): always reports
/// the slave caught up and acknowledges instantly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHAService;

impl HAService for NoopHAService {
    fn is_slave_ok(&self, _offset: u64) -> bool {
        true
    }

    fn put_request(&self, _offset: u64, _timeout: Duration) -> bool {
        true
    }

    fn wake_up(&self) {}
}
