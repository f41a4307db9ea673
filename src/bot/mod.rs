pub mod connection;
pub mod credentials;
pub mod lifecycle;
pub mod poller;
pub mod socketio;
pub mod synchronizer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
