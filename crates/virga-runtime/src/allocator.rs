//! Memory accounting for block builders
//!
//! Builders charge the query's allocator as they grow and release on flush.
//! Charges past the quota surface as `ResourceExhausted`, which becomes the
//! query's terminal error.

use std::sync::atomic::{AtomicU64, Ordering};
use virga_core::{Error, Result};

/// Process-wide byte accounting against an optional quota.
#[derive(Debug, Default)]
pub struct Allocator {
    used: AtomicU64,
    peak: AtomicU64,
    /// Zero means unlimited.
    quota: u64,
}

impl Allocator {
    pub fn new(quota: u64) -> Self {
        Allocator {
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            quota,
        }
    }

    pub fn unlimited() -> Self {
        Allocator::new(0)
    }

    /// Charge `bytes`; fails without charging when the quota would be
    /// exceeded.
    pub fn account(&self, bytes: u64) -> Result<()> {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if self.quota > 0 && used > self.quota {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
            return Err(Error::ResourceExhausted(format!(
                "memory quota of {} bytes exceeded (wanted {} more)",
                self.quota, bytes
            )));
        }
        self.record_peak(used);
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    fn record_peak(&self, used: u64) {
        let mut cur = self.peak.load(Ordering::Relaxed);
        while used > cur {
            match self
                .peak
                .compare_exchange(cur, used, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }
}
