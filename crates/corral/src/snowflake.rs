use crate::types::MachineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Error returned when the snowflake generator cannot produce an ID.
#[derive(Debug, thiserror::Error)]
pub enum SnowflakeError {
    /// The system clock jumped backward by more than the maximum tolerable drift.
    #[error(
        "system clock jumped backward by {drift_ms}ms (>{max_drift_ms}ms max) — check NTP configuration"
    )]
    ClockDriftExceeded { drift_ms: i64, max_drift_ms: i64 },
}

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const CUSTOM_EPOCH_MS: i64 = 1_735_689_600_000;

/// Maximum backward clock drift tolerated before generation fails instead of
/// waiting for the clock to catch up.
const MAX_CLOCK_DRIFT_MS: i64 = 5_000;

const MACHINE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = MACHINE_ID_BITS + SEQUENCE_BITS;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// A distributed unique ID using the Snowflake algorithm.
/// Layout: 42-bit timestamp (ms since custom epoch), 10-bit machine ID, 12-bit sequence.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Snowflake(pub i64);

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decomposed parts of a Snowflake ID.
#[derive(Debug, Clone, Copy)]
pub struct SnowflakeParts {
    pub timestamp: i64,
    pub machine_id: MachineId,
    pub sequence: i32,
}

impl Snowflake {
    /// Extract the parts of this snowflake ID.
    pub fn parts(&self) -> SnowflakeParts {
        SnowflakeParts {
            timestamp: (self.0 >> TIMESTAMP_SHIFT) + CUSTOM_EPOCH_MS,
            machine_id: MachineId::new_unchecked(
                ((self.0 >> MACHINE_ID_SHIFT) & ((1 << MACHINE_ID_BITS) - 1)) as i32,
            ),
            sequence: (self.0 & SEQUENCE_MASK) as i32,
        }
    }
}

/// Lock-free snowflake ID generator.
///
/// The last-used timestamp and the per-millisecond sequence live in a single
/// `AtomicI64` (`ts_seq`, upper 52 bits timestamp / lower 12 bits sequence) so
/// both advance in one CAS. A split representation would let a concurrent
/// caller observe a fresh timestamp with a stale sequence and mint a
/// duplicate ID.
pub struct SnowflakeGenerator {
    machine_id: AtomicI32,
    ts_seq: AtomicI64,
}

fn pack_ts_seq(timestamp: i64, sequence: i64) -> i64 {
    (timestamp << SEQUENCE_BITS) | sequence
}

fn unpack_timestamp(ts_seq: i64) -> i64 {
    ts_seq >> SEQUENCE_BITS
}

fn unpack_sequence(ts_seq: i64) -> i64 {
    ts_seq & SEQUENCE_MASK
}

impl SnowflakeGenerator {
    pub fn new() -> Self {
        Self {
            machine_id: AtomicI32::new(0),
            // timestamp=-1 so the first CAS always takes the new-millisecond path
            ts_seq: AtomicI64::new(pack_ts_seq(-1, 0)),
        }
    }

    /// Update the machine ID used for subsequent snowflake generation.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the valid range `0..=1023`. Use
    /// [`MachineId::validated`] or [`MachineId::wrapping`] to ensure valid values.
    pub fn set_machine_id(&self, id: MachineId) {
        assert!(
            id.value() >= 0 && id.value() <= crate::types::MAX_MACHINE_ID,
            "machine ID {} is out of range (valid: 0..=1023)",
            id.value()
        );
        self.machine_id.store(id.value(), Ordering::Release);
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as i64
    }

    /// Generate the next unique snowflake ID asynchronously. Lock-free.
    /// On backward clock drift or sequence exhaustion, yields to the tokio
    /// runtime instead of blocking the worker thread.
    ///
    /// Returns `Err(SnowflakeError::ClockDriftExceeded)` if the system clock
    /// has jumped backward by more than 5 seconds.
    ///
    /// Prefer this over [`next()`](Self::next) in async contexts.
    pub async fn next_async(&self) -> Result<Snowflake, SnowflakeError> {
        loop {
            match self.try_next()? {
                Some(id) => return Ok(id),
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Generate the next unique snowflake ID. Lock-free.
    /// On backward clock drift, waits until the clock catches up.
    ///
    /// **Warning:** this method uses `std::thread::yield_now()` on contention,
    /// which blocks the calling OS thread. In async contexts, prefer
    /// [`next_async()`](Self::next_async) to avoid stalling tokio workers.
    ///
    /// Returns `Err(SnowflakeError::ClockDriftExceeded)` if the system clock
    /// has jumped backward by more than 5 seconds.
    pub fn next(&self) -> Result<Snowflake, SnowflakeError> {
        loop {
            match self.try_next()? {
                Some(id) => return Ok(id),
                None => std::thread::yield_now(),
            }
        }
    }

    /// One CAS attempt. `Ok(None)` means the caller should yield and retry:
    /// either the clock is behind, the sequence for this millisecond is
    /// exhausted, or another thread won the CAS.
    fn try_next(&self) -> Result<Option<Snowflake>, SnowflakeError> {
        let timestamp = Self::current_timestamp();
        let current = self.ts_seq.load(Ordering::Acquire);
        let last_ts = unpack_timestamp(current);

        if timestamp < last_ts {
            let drift_ms = last_ts - timestamp;
            if drift_ms > MAX_CLOCK_DRIFT_MS {
                return Err(SnowflakeError::ClockDriftExceeded {
                    drift_ms,
                    max_drift_ms: MAX_CLOCK_DRIFT_MS,
                });
            }
            if drift_ms > 100 {
                tracing::warn!(
                    drift_ms,
                    "snowflake: system clock jumped backward, waiting for clock to catch up"
                );
            }
            return Ok(None);
        }

        let (new_val, seq) = if timestamp == last_ts {
            let seq = unpack_sequence(current) + 1;
            if seq > SEQUENCE_MASK {
                // >4096 IDs this millisecond, wait for the next one
                return Ok(None);
            }
            (pack_ts_seq(timestamp, seq), seq)
        } else {
            (pack_ts_seq(timestamp, 0), 0)
        };

        // Capture machine_id before the CAS so the composed ID uses the value
        // that was active when the slot was reserved.
        let machine_id = self.machine_id.load(Ordering::Acquire);

        if self
            .ts_seq
            .compare_exchange(current, new_val, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Ok(None);
        }

        let id = ((timestamp - CUSTOM_EPOCH_MS) << TIMESTAMP_SHIFT)
            | ((machine_id as i64) << MACHINE_ID_SHIFT)
            | seq;
        Ok(Some(Snowflake(id)))
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
