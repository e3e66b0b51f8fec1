use serde::{Deserialize, Serialize};

/// Reply codes shared by all task-facing and worker-facing messages.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    SUCCESS = 0,
    FAILED = 1,
    SLOT_NOT_AVAILABLE = 2,
    RESERVE_SLOTS_FAILED = 3,
    SHUFFLE_NOT_REGISTERED = 4,
    MAP_ENDED = 5,
    STAGE_END_TIMEOUT = 6,
    SHUFFLE_DATA_LOST = 7,
    PARTIAL_SUCCESS = 8,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::SUCCESS)
    }
}

impl Into<i32> for StatusCode {
    fn into(self) -> i32 {
        self as i32
    }
}

/// Granularity of the bounded waits on stage-end completion.
pub const STAGE_END_POLL_INTERVAL_MS: u64 = 100;

/// An attempt slot that has not seen its mapper end yet.
pub const OPEN_ATTEMPT: i64 = -1;
