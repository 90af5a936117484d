//! C7: one-directional hand-off of each persisted record's metadata to
//! downstream index builders (§4.7). The engine only promises to call
//! `dispatch` once per persisted data record, in physical-offset order,
//! from inside the put-lock critical section — it never retries a failed
//! dispatch (§7 "Failures inside DispatchSink are propagated").

use crate::error::Result;

/// Metadata of one persisted data record, handed to downstream indexers
/// (consume-queue index, key-hash index, HA transport, …) — all external
/// collaborators referenced only through this struct and the `DispatchSink`
/// trait (§1, §3 "DispatchRequest").
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: i32,
    pub physical_offset: u64,
    pub size: usize,
    pub tags_code: i64,
    pub store_timestamp: i64,
    pub queue_offset: u64,
    pub keys: String,
    pub sys_flag: i32,
    pub prepared_txn_offset: i64,
}

/// Consumed by `Appender` and `Recoverer`. A sink's failure is fatal to the
/// engine — see §4.7 and §7.
pub trait DispatchSink: Send + Sync {
    fn dispatch(&self, request: &DispatchRequest) -> Result<()>;

    /// Discard any index data built for physical offsets at or beyond
    /// `offset`. Called by abnormal recovery after truncation (§4.6).
    fn truncate_above(&self, offset: u64) -> Result<()>;
}

/// A `DispatchSink` that drops every request. Useful as an engine default
/// when no downstream indexer is wired up yet, and in tests that only care
/// about the commit log itself.
#[derive(Debug, Default)]
pub struct NullDispatchSink;

impl DispatchSink for NullDispatchSink {
    fn dispatch(&self, _request: &DispatchRequest) -> Result<()> {
        Ok(())
    }

    fn truncate_above(&self, _offset: u64) -> Result<()> {
        Ok(())
    }
}

/// Records every dispatched request in memory, in the order received.
/// Grounded in the same "record what happened, let the test assert on it"
/// style as the teacher's in-process test fixtures; useful for asserting
/// dispatch order and content without standing up a real index.
#[derive(Default)]
pub struct RecordingDispatchSink {
    requests: std::sync::Mutex<Vec<DispatchRequest>>,
}

impl RecordingDispatchSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().expect("dispatch log poisoned").clone()
    }
}

impl DispatchSink for RecordingDispatchSink {
    fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        self.requests
            .lock()
            .expect("dispatch log poisoned")
            .push(request.clone());
        Ok(())
    }

    fn truncate_above(&self, offset: u64) -> Result<()> {
        self.requests
            .lock()
            .expect("dispatch log poisoned")
            .retain(|request| request.physical_offset < offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(physical_offset: u64) -> DispatchRequest {
        DispatchRequest {
            topic: "orders".to_string(),
            queue_id: 0,
            physical_offset,
            size: 64,
            tags_code: 0,
            store_timestamp: 0,
            queue_offset: 0,
            keys: String::new(),
            sys_flag: 0,
            prepared_txn_offset: 0,
        }
    }

    #[test]
    fn recording_sink_preserves_order() {
        let sink = RecordingDispatchSink::new();
        sink.dispatch(&sample(0)).unwrap();
        sink.dispatch(&sample(128)).unwrap();
        let requests = sink.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].physical_offset, 0);
        assert_eq!(requests[1].physical_offset, 128);
    }

    #[test]
    fn truncate_above_drops_requests_past_boundary() {
        let sink = RecordingDispatchSink::new();
        sink.dispatch(&sample(0)).unwrap();
        sink.dispatch(&sample(128)).unwrap();
        sink.truncate_above(128).unwrap();
        assert_eq!(sink.requests().len(), 1);
    }
}
