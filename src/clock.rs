//! Coarse server clock.
//!
//! The whole server keys item expiration off a single `AtomicU32` holding
//! "seconds since the server started". The dispatcher refreshes it at 1 Hz;
//! anything that needs a fresher value (flush_all) refreshes it on demand.
//! Word-sized reads need no synchronization beyond the atomic itself.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Client-supplied expiration values at or below this are deltas from now;
/// anything larger is an absolute unix timestamp.
pub const REALTIME_MAXDELTA: i64 = 60 * 60 * 24 * 30;

static STARTED: AtomicI64 = AtomicI64::new(0);
static CURRENT_TIME: AtomicU32 = AtomicU32::new(0);

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Record the server start time. Backdated two seconds so `current_time` is
/// never zero and values that double as booleans (the flush horizon) stay
/// truthy.
pub fn init() {
    STARTED.store(unix_now() - 2, Ordering::Relaxed);
    set_current_time();
}

/// Unix time the server started at.
pub fn started() -> i64 {
    STARTED.load(Ordering::Relaxed)
}

/// Seconds since server start.
pub fn current_time() -> u32 {
    CURRENT_TIME.load(Ordering::Relaxed)
}

/// Refresh `current_time` from the wall clock.
pub fn set_current_time() {
    let now = unix_now() - STARTED.load(Ordering::Relaxed);
    CURRENT_TIME.store(now.max(0) as u32, Ordering::Relaxed);
}

/// Convert a client-supplied expiration value to relative server time.
pub fn realtime(exptime: i64) -> u32 {
    realtime_at(exptime, current_time(), started())
}

/// given time value that's either unix time or delta from current unix time,
/// return relative time. Uses the fact that delta can't exceed one month
/// (and a real unix time value can't be that low).
fn realtime_at(exptime: i64, now: u32, started: i64) -> u32 {
    if exptime == 0 {
        return 0; /* 0 means never expire */
    }

    if exptime > REALTIME_MAXDELTA {
        /* An absolute expiration at/before the server started would
         * underflow to a huge relative value, turning "expired in the past"
         * into "expires never". Give those items one second past start. */
        if exptime <= started {
            1
        } else {
            (exptime - started) as u32
        }
    } else {
        now.wrapping_add(exptime as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_never() {
        assert_eq!(realtime_at(0, 100, 1_000_000), 0);
    }

    #[test]
    fn small_values_are_deltas() {
        assert_eq!(realtime_at(1, 100, 1_000_000), 101);
        assert_eq!(realtime_at(REALTIME_MAXDELTA, 100, 1_000_000), 100 + REALTIME_MAXDELTA as u32);
    }

    #[test]
    fn absolute_times_are_made_relative() {
        let started = 1_000_000;
        let exptime = started + 500;
        assert_eq!(realtime_at(exptime, 100, started), 500);
    }

    #[test]
    fn past_absolute_times_expire_just_after_start() {
        let started = REALTIME_MAXDELTA + 10_000;
        assert_eq!(realtime_at(started, 100, started), 1);
        assert_eq!(realtime_at(started - 50, 100, started), 1);
    }
}
