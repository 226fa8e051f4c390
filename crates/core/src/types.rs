/// Caller-supplied identifier of one grid batch execution.
pub type BatchId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, time-ordered batch id for callers that do not
/// supply their own.
pub fn new_batch_id() -> BatchId {
    uuid::Uuid::now_v7().to_string()
}

pub const BYTES_PER_MB: u64 = 1024 * 1024;
pub const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;
