//! Store health flags
//!
//! A compact bitset surfaced to health checks. Background services set the
//! relevant bit when they exhaust their retries; the store keeps serving
//! reads but reports itself degraded and refuses writes where appropriate.

use std::sync::atomic::{AtomicU32, Ordering};

const NOT_WRITEABLE_BIT: u32 = 1;
const LOGICS_QUEUE_ERROR_BIT: u32 = 1 << 1;
const INDEX_FILE_ERROR_BIT: u32 = 1 << 2;

/// Shared run-state bits
#[derive(Default)]
pub struct RunningFlags {
    bits: AtomicU32,
}

impl RunningFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether appends are currently allowed
    pub fn is_writeable(&self) -> bool {
        self.bits.load(Ordering::Acquire) & (NOT_WRITEABLE_BIT | LOGICS_QUEUE_ERROR_BIT) == 0
    }

    /// Whether any degraded bit is set
    pub fn is_degraded(&self) -> bool {
        self.bits.load(Ordering::Acquire) & (LOGICS_QUEUE_ERROR_BIT | INDEX_FILE_ERROR_BIT) != 0
    }

    pub fn mark_not_writeable(&self) {
        self.bits.fetch_or(NOT_WRITEABLE_BIT, Ordering::AcqRel);
    }

    /// Consume-queue update failed beyond its retry budget: the logical
    /// indices may lag the commit log, which must never go unnoticed.
    pub fn mark_logics_queue_error(&self) {
        self.bits.fetch_or(LOGICS_QUEUE_ERROR_BIT, Ordering::AcqRel);
    }

    pub fn mark_index_file_error(&self) {
        self.bits.fetch_or(INDEX_FILE_ERROR_BIT, Ordering::AcqRel);
    }

    pub fn has_logics_queue_error(&self) -> bool {
        self.bits.load(Ordering::Acquire) & LOGICS_QUEUE_ERROR_BIT != 0
    }

    pub fn has_index_file_error(&self) -> bool {
        self.bits.load(Ordering::Acquire) & INDEX_FILE_ERROR_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = RunningFlags::new();
        assert!(flags.is_writeable());
        assert!(!flags.is_degraded());

        flags.mark_index_file_error();
        assert!(flags.is_degraded());
        assert!(flags.is_writeable());

        flags.mark_logics_queue_error();
        assert!(!flags.is_writeable());
        assert!(flags.has_logics_queue_error());
    }
}
