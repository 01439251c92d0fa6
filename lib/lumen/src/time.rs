use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Milliseconds elapsed since the process clock was first read. Used as the
/// age stamp on outgoing UDP packets; 0 never occurs naturally, which is why
/// the handshake can reserve it.
#[inline]
pub fn age_millis() -> u64 {
    let elapsed = PROCESS_START.elapsed().as_millis() as u64;

    // The first read can land inside the first millisecond.
    elapsed + 1
}
