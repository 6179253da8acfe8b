//! Cycle-time clock adapter.
//!
//! The controller exposes a free-running cycle timer (7-bit seconds, 13-bit
//! cycle, 12-bit offset). Events carry only a 16-bit timestamp (3 bits of
//! seconds and the cycle), which is expanded against a reference sample of
//! the full timer taken after the event.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::FwError;
use crate::protocol::constants::*;
use crate::sync::lock;
use crate::transport::BusTransport;

/// A bus-cycle-accurate point in time: seconds (0..128) and cycle (0..8000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CycleTimestamp {
    pub sec: u32,
    pub cycle: u32,
}

impl CycleTimestamp {
    /// Create a timestamp, carrying excess cycles into seconds.
    pub fn new(sec: u32, cycle: u32) -> Self {
        let sec = (sec + cycle / CYCLES_PER_SEC) % CYCLE_TIMER_SEC_WRAP;
        Self {
            sec,
            cycle: cycle % CYCLES_PER_SEC,
        }
    }

    /// Timestamp for an absolute cycle count, folded into the 128-second window.
    pub fn from_cycles(cycles: u64) -> Self {
        let window = u64::from(CYCLES_PER_SEC) * u64::from(CYCLE_TIMER_SEC_WRAP);
        let cycles = cycles % window;
        Self {
            sec: (cycles / u64::from(CYCLES_PER_SEC)) as u32,
            cycle: (cycles % u64::from(CYCLES_PER_SEC)) as u32,
        }
    }

    pub fn to_cycles(&self) -> u64 {
        u64::from(self.sec) * u64::from(CYCLES_PER_SEC) + u64::from(self.cycle)
    }

    /// Cycles from `earlier` to `self`, modulo the 128-second window.
    pub fn cycles_since(&self, earlier: &CycleTimestamp) -> u64 {
        let window = u64::from(CYCLES_PER_SEC) * u64::from(CYCLE_TIMER_SEC_WRAP);
        (self.to_cycles() + window - earlier.to_cycles()) % window
    }
}

impl fmt::Display for CycleTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sec {} cycle", self.sec, self.cycle)
    }
}

/// One sample of the controller's cycle timer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTime {
    raw: u32,
    /// Monotonic system time at which the register was latched.
    system_time: Duration,
}

impl CycleTime {
    pub fn from_raw(raw: u32, system_time: Duration) -> Self {
        Self { raw, system_time }
    }

    /// Compose a register value from its fields, wrapping each to its width.
    pub fn from_fields(sec: u32, cycle: u32, offset: u32, system_time: Duration) -> Self {
        let raw = ((sec % CYCLE_TIMER_SEC_WRAP) << CYCLE_TIMER_SEC_SHIFT)
            | ((cycle % CYCLES_PER_SEC) << CYCLE_TIMER_CYCLE_SHIFT)
            | (offset % OFFSETS_PER_CYCLE);
        Self { raw, system_time }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn system_time(&self) -> Duration {
        self.system_time
    }

    pub fn seconds(&self) -> u32 {
        (self.raw & CYCLE_TIMER_SEC_MASK) >> CYCLE_TIMER_SEC_SHIFT
    }

    pub fn cycle(&self) -> u32 {
        (self.raw & CYCLE_TIMER_CYCLE_MASK) >> CYCLE_TIMER_CYCLE_SHIFT
    }

    pub fn offset(&self) -> u32 {
        self.raw & CYCLE_TIMER_OFFSET_MASK
    }

    /// Seconds, cycle and offset.
    pub fn fields(&self) -> [u16; 3] {
        [
            self.seconds() as u16,
            self.cycle() as u16,
            self.offset() as u16,
        ]
    }

    pub fn timestamp(&self) -> CycleTimestamp {
        CycleTimestamp {
            sec: self.seconds(),
            cycle: self.cycle(),
        }
    }

    /// Expand a 16-bit event timestamp taken at or before this sample.
    ///
    /// Ticks within the 8 seconds preceding the sample map monotonically.
    pub fn expand_tstamp(&self, tstamp: u16) -> CycleTimestamp {
        let tick_sec_low = u32::from((tstamp & TSTAMP_SEC_MASK) >> TSTAMP_SEC_SHIFT);
        let tick_cycle = u32::from(tstamp & TSTAMP_CYCLE_MASK) % CYCLES_PER_SEC;

        let ref_sec = self.seconds();
        let ref_sec_low = ref_sec & 0x7;
        let mut sec = (ref_sec & !0x7) | tick_sec_low;

        // The tick lies in the previous 8-second window.
        if tick_sec_low > ref_sec_low || (tick_sec_low == ref_sec_low && tick_cycle > self.cycle())
        {
            sec = (sec + CYCLE_TIMER_SEC_WRAP - 8) % CYCLE_TIMER_SEC_WRAP;
        }

        CycleTimestamp {
            sec,
            cycle: tick_cycle,
        }
    }
}

/// Compose a 16-bit event timestamp from a full timer value.
pub fn tstamp_of(cycle_time: &CycleTime) -> u16 {
    (((cycle_time.seconds() & 0x7) as u16) << TSTAMP_SEC_SHIFT) | (cycle_time.cycle() as u16)
}

/// Clock adapter over the transport's cycle timer.
pub struct CycleClock {
    source: Arc<dyn BusTransport>,
    reference: Mutex<Option<CycleTime>>,
}

impl CycleClock {
    pub fn new(source: Arc<dyn BusTransport>) -> Self {
        Self {
            source,
            reference: Mutex::new(None),
        }
    }

    /// Read the timer and keep it as the new conversion reference.
    pub fn sample_cycle_time(&self) -> Result<CycleTime, FwError> {
        let cycle_time = self.source.read_cycle_time()?;
        *lock(&self.reference) = Some(cycle_time);
        Ok(cycle_time)
    }

    /// Current (seconds, cycle).
    pub fn sample(&self) -> Result<CycleTimestamp, FwError> {
        Ok(self.sample_cycle_time()?.timestamp())
    }

    /// Map a tick captured earlier onto the reference of the latest sample.
    pub fn convert(&self, tstamp: u16) -> Result<CycleTimestamp, FwError> {
        let reference = *lock(&self.reference);
        let reference = match reference {
            Some(r) => r,
            None => self.sample_cycle_time()?,
        };
        Ok(reference.expand_tstamp(tstamp))
    }

    /// Most recent sample, if any.
    pub fn reference(&self) -> Option<CycleTime> {
        *lock(&self.reference)
    }

    /// Sample, or fall back to the last reference when the timer is gone.
    pub(crate) fn sample_or_last(&self) -> CycleTimestamp {
        match self.sample() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "Cycle timer read failed, using last reference");
                self.reference()
                    .map(|r| r.timestamp())
                    .unwrap_or_default()
            }
        }
    }
}
