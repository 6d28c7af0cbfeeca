use crate::clock;
use std::fmt;
use std::sync::Mutex;
use std::thread;

const KIND_BITS: u64 = 4;
const MACHINE_BITS: u64 = 12;
const TIMESTAMP_BITS: u64 = 32;
const SEQUENCE_BITS: u64 = 16;

const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const KIND_SHIFT: u64 = MACHINE_BITS + TIMESTAMP_BITS + SEQUENCE_BITS;
const MACHINE_SHIFT: u64 = TIMESTAMP_BITS + SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS;

#[derive(Debug, Eq, PartialEq)]
pub enum IdError {
    /// The system clock moved behind the timestamp of the last generated id.
    ClockRegression { last: u64, now: u64 },
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdError::ClockRegression { last, now } => {
                write!(f, "clock moved backwards: last={} now={}", last, now)
            }
        }
    }
}

impl std::error::Error for IdError {}

struct GeneratorState {
    last_timestamp: u64,
    sequence: u64,
}

/// Generates 64-bit ids laid out as
/// `kind(4) | machine(12) | timestamp(32) | sequence(16)` where the
/// timestamp is milliseconds since the application epoch. Ids from a single
/// generator are strictly monotonically increasing.
pub struct IdGenerator {
    prefix: u64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Creates a generator for the given id kind and machine number. Values
    /// outside the 4/12 bit ranges are a programmer error.
    pub fn new(kind: u8, machine: u16) -> IdGenerator {
        if u64::from(kind) > KIND_MASK {
            panic!("Id kind {} exceeds {} bits", kind, KIND_BITS);
        }

        if u64::from(machine) > MACHINE_MASK {
            panic!("Machine number {} exceeds {} bits", machine, MACHINE_BITS);
        }

        IdGenerator {
            prefix: (u64::from(kind) << KIND_SHIFT) | (u64::from(machine) << MACHINE_SHIFT),
            state: Mutex::new(GeneratorState {
                last_timestamp: 0,
                sequence: 0,
            }),
        }
    }

    /// Produces the next id. On sequence exhaustion within a single
    /// millisecond the call spins until the clock advances. Fails only when
    /// the clock runs backwards.
    pub fn next(&self) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = clock::unix_millis();

        if now < state.last_timestamp {
            return Err(IdError::ClockRegression {
                last: state.last_timestamp,
                now,
            });
        }

        if now == state.last_timestamp {
            state.sequence += 1;

            if state.sequence > SEQUENCE_MASK {
                // Sequence exhausted, wait out the current millisecond
                while now <= state.last_timestamp {
                    thread::yield_now();
                    now = clock::unix_millis();
                }

                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = now;

        let timestamp = (now - clock::APP_EPOCH_UNIX_MS) & TIMESTAMP_MASK;

        Ok(self.prefix | (timestamp << TIMESTAMP_SHIFT) | state.sequence)
    }
}

/// Decomposes an id into its `(kind, machine, timestamp, sequence)` fields.
#[inline]
pub fn decompose(id: u64) -> (u8, u16, u64, u16) {
    (
        ((id >> KIND_SHIFT) & KIND_MASK) as u8,
        ((id >> MACHINE_SHIFT) & MACHINE_MASK) as u16,
        (id >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK,
        (id & SEQUENCE_MASK) as u16,
    )
}

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Compact 32-bit identifier used for log correlation and other
/// human-facing contexts. Renders as Base36 or hex.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ShortId(u32);

impl ShortId {
    #[inline]
    pub fn new(raw: u32) -> ShortId {
        ShortId(raw)
    }

    /// Folds a 64-bit id into a short id.
    #[inline]
    pub fn derive(id: u64) -> ShortId {
        ShortId((id ^ (id >> 32)) as u32)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Base36 rendering, at most 7 characters.
    pub fn to_base36(self) -> String {
        let mut value = self.0;
        let mut digits = [0u8; 7];
        let mut cursor = digits.len();

        loop {
            cursor -= 1;
            digits[cursor] = BASE36_DIGITS[(value % 36) as usize];
            value /= 36;

            if value == 0 {
                break;
            }
        }

        String::from_utf8_lossy(&digits[cursor..]).into_owned()
    }

    /// Fixed-width hex rendering.
    pub fn to_hex(self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base36())
    }
}
