// Shared utility functions for MnemoDB Core

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique memory id.
pub fn generate_memory_id() -> String {
    format!("mem_{}", uuid::Uuid::new_v4().simple())
}
