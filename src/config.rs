use std::path::PathBuf;

/// Durability fidelity selected at engine construction (§4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDiskType {
    Async,
    Sync,
}

/// Role this broker instance plays in HA replication (§6). The engine only
/// consults this to decide whether a sync put must also wait on the
/// `HAService`; replication transport itself is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    AsyncMaster,
    SyncMaster,
    Slave,
}

/// Recognized configuration options (§6).
#[derive(Debug, Clone)]
pub struct CommitLogConfig {
    pub store_path_commit_log: PathBuf,
    pub mapped_file_size_commit_log: usize,
    pub max_message_size: usize,
    pub flush_disk_type: FlushDiskType,
    pub flush_interval_commit_log_ms: u64,
    pub flush_commit_log_least_pages: usize,
    pub flush_commit_log_thorough_interval_ms: u64,
    pub sync_flush_timeout_ms: u64,
    pub use_reentrant_lock_when_put_message: bool,
    pub broker_role: BrokerRole,
    pub check_crc_on_recover: bool,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            store_path_commit_log: PathBuf::from("store/commitlog"),
            mapped_file_size_commit_log: 1024 * 1024 * 1024,
            max_message_size: 4 * 1024 * 1024,
            flush_disk_type: FlushDiskType::Async,
            flush_interval_commit_log_ms: 500,
            flush_commit_log_least_pages: 4,
            flush_commit_log_thorough_interval_ms: 10_000,
            sync_flush_timeout_ms: 5_000,
            use_reentrant_lock_when_put_message: false,
            broker_role: BrokerRole::AsyncMaster,
            check_crc_on_recover: true,
        }
    }
}
