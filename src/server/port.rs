//! Port allocation for pooled listeners
//!
//! Ports are handed out from a cursor that advances through `[min, max]`,
//! skipping every port divisible by 10 and wrapping below `min` once it
//! passes `max`. A failed bind moves on to the next candidate.

use std::future::Future;
use std::io;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{PoolError, Result};

/// Lowest port the cursor ever wraps to
const WRAP_FLOOR: u32 = 30000;
/// Distance below `min` the cursor wraps to
const WRAP_SPAN: u32 = 10000;

/// Inclusive range of ports the allocator walks through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min == 0 || min >= max {
            return Err(PoolError::InvalidConfig(format!(
                "port range {}-{} is empty or inverted",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Where the cursor lands after passing `max`
    ///
    /// Ranges that end at or below the wrap floor wrap back to `min`, so the
    /// cursor always has at least two consecutive ports to land on.
    pub fn wrap_start(&self) -> u32 {
        let start = (self.min as u32).saturating_sub(WRAP_SPAN).max(WRAP_FLOOR);
        if start >= self.max as u32 {
            self.min as u32
        } else {
            start
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 40000,
            max: 65000,
        }
    }
}

/// Hands out bound listeners on the next free port
pub struct PortAllocator {
    range: PortRange,
    cursor: Mutex<u32>,
    default_port: Mutex<Option<u16>>,
    max_attempts: Option<u32>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            cursor: Mutex::new(range.min as u32),
            default_port: Mutex::new(None),
            max_attempts: None,
        }
    }

    /// Try `port` once before walking the range
    pub fn with_default_port(mut self, port: Option<u16>) -> Self {
        self.default_port = Mutex::new(port.filter(|p| *p > 0));
        self
    }

    /// Give up with `PortsExhausted` after this many failed binds
    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts.filter(|a| *a > 0);
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Advance the cursor to the next candidate port
    pub fn next_port(&self) -> u16 {
        let mut cursor = self.cursor.lock();
        loop {
            *cursor += 1;
            if *cursor > self.range.max as u32 {
                *cursor = self.range.wrap_start();
            }
            if *cursor % 10 != 0 {
                return *cursor as u16;
            }
        }
    }

    /// Bind a listener with `bind`, retrying on the next port until one succeeds
    ///
    /// Each retry yields to the scheduler first, so sustained contention
    /// never grows the stack.
    pub async fn allocate<L, F, Fut>(&self, mut bind: F) -> Result<(L, u16)>
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = io::Result<L>>,
    {
        let default_port = self.default_port.lock().take();
        if let Some(port) = default_port {
            match bind(port).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => debug!(port, "Default port unavailable, using range: {}", e),
            }
        }

        let mut attempts = 0u32;
        loop {
            let port = self.next_port();
            match bind(port).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => {
                    attempts += 1;
                    trace!(port, attempts, "Bind failed: {}", e);
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(PoolError::PortsExhausted {
                            min: self.range.min,
                            max: self.range.max,
                            attempts,
                        });
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}
