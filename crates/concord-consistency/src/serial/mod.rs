//! Serial generator
//!
//! Serials are `now_ms * 10000 + offset`, with a bounded sub-serial when
//! more than one value is requested inside one millisecond. Only the
//! coordinator runs a generator; participants forward their requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::{error, info};

use concord_common::{ConcordError, Result, Serial, current_timestamp};

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        current_timestamp()
    }
}

/// Manually driven clock, for deterministic ordering tests
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SerialState {
    offset: i64,
    last_coarse: i64,
    sub_serial: i64,
    last_issued: Serial,
}

/// Coordinator-owned serial generator
pub struct SerialGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<SerialState>,
}

impl SerialGenerator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SerialState::default()),
        }
    }

    /// Issue the next serial.
    ///
    /// Fails with `FatalOrdering` if the clock moved backward past the last
    /// issued coarse value, or if more than 10000 serials are requested
    /// inside one millisecond.
    pub fn next_serial(&self) -> Result<Serial> {
        let mut state = self.state.lock();
        let coarse = self.clock.now_millis() * Serial::SUB_SERIALS + state.offset;

        if coarse < state.last_coarse {
            error!(
                "Serial clock moved backward: {} < {} (offset {})",
                coarse, state.last_coarse, state.offset
            );
            return Err(ConcordError::FatalOrdering(format!(
                "serial time moved backward from {} to {}",
                state.last_coarse, coarse
            )));
        }

        if coarse == state.last_coarse {
            state.sub_serial += 1;
            if state.sub_serial >= Serial::SUB_SERIALS {
                error!("Sub-serial space exhausted at coarse serial {}", coarse);
                return Err(ConcordError::FatalOrdering(format!(
                    "more than {} serials requested within one millisecond",
                    Serial::SUB_SERIALS
                )));
            }
        } else {
            state.last_coarse = coarse;
            state.sub_serial = 0;
        }

        let serial = Serial(coarse + state.sub_serial);
        state.last_issued = serial;
        metrics::counter!("concord_serials_issued_total").increment(1);
        Ok(serial)
    }

    /// Raise the offset so every serial issued from now on is above `floor`.
    ///
    /// A newly elected coordinator calls this with the highest serial seen
    /// anywhere in the group, so ordering holds across coordinator restarts
    /// even when clocks disagree.
    pub fn ensure_above(&self, floor: Serial) {
        let mut state = self.state.lock();
        let coarse = self.clock.now_millis() * Serial::SUB_SERIALS + state.offset;
        if coarse <= floor.0 {
            let shift = floor.0 - coarse + Serial::SUB_SERIALS;
            state.offset += shift;
            info!(
                "Raised serial offset by {} to stay above {} (offset now {})",
                shift, floor, state.offset
            );
        }
    }

    /// The most recently issued serial (zero before the first call)
    pub fn last_issued(&self) -> Serial {
        self.state.lock().last_issued
    }

    pub fn offset(&self) -> i64 {
        self.state.lock().offset
    }
}

impl Default for SerialGenerator {
    fn default() -> Self {
        Self::new()
    }
}
