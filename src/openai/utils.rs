use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch, used for the `created` field of responses.
pub fn get_created_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
