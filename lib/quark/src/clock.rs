use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

/// Unix milliseconds of the application epoch (2020-01-01T00:00:00Z). Packet
/// timestamps and generated ids are both expressed relative to this point.
pub const APP_EPOCH_UNIX_MS: u64 = 1_577_836_800_000;

/// Monotonic UTC time source. The wall clock is sampled exactly once at
/// construction and every subsequent reading is derived from the elapsed
/// monotonic time, so readings never go backwards even if the system clock
/// is adjusted.
pub struct Clock {
    base_unix_micros: u64,
    base: Instant,
}

impl Clock {
    /// Captures the current wall-clock time as the fixed base.
    pub fn capture() -> Clock {
        let base_unix_micros = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("Closed timelike curve, reality compromised")
            .as_micros() as u64;

        Clock {
            base_unix_micros,
            base: Instant::now(),
        }
    }

    /// Microseconds elapsed since 1970-01-01T00:00:00Z.
    #[inline]
    pub fn unix_micros(&self) -> u64 {
        self.base_unix_micros + self.base.elapsed().as_micros() as u64
    }

    /// Milliseconds elapsed since 1970-01-01T00:00:00Z.
    #[inline]
    pub fn unix_millis(&self) -> u64 {
        self.unix_micros() / 1000
    }

    /// Seconds elapsed since 1970-01-01T00:00:00Z.
    #[inline]
    pub fn unix_secs(&self) -> u64 {
        self.unix_micros() / 1_000_000
    }

    /// Microseconds elapsed since the application epoch.
    #[inline]
    pub fn app_micros(&self) -> u64 {
        self.unix_micros() - APP_EPOCH_UNIX_MS * 1000
    }
}

lazy_static! {
    static ref CLOCK: Clock = Clock::capture();
}

/// Current unix timestamp in microseconds, from the process-wide clock.
#[inline]
pub fn unix_micros() -> u64 {
    CLOCK.unix_micros()
}

/// Current unix timestamp in milliseconds, from the process-wide clock.
#[inline]
pub fn unix_millis() -> u64 {
    CLOCK.unix_millis()
}

/// Current unix timestamp in seconds, from the process-wide clock.
#[inline]
pub fn timestamp_secs() -> u64 {
    CLOCK.unix_secs()
}

/// Microseconds since the application epoch, from the process-wide clock.
#[inline]
pub fn app_micros() -> u64 {
    CLOCK.app_micros()
}
