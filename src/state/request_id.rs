use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-request trace id surfaced on the `trace-id` response header and
/// appended to error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId(uuid::Uuid);

impl From<uuid::Uuid> for TraceId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates process-unique trace ids cheaply: a random 128-bit seed drawn
/// once at startup, XORed with a monotonic counter per request. Avoids a
/// syscall-backed UUID generation on every request while remaining globally
/// unique for the lifetime of the process.
pub(crate) struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub(crate) fn trace_id(&self, request_seq: u64) -> TraceId {
        TraceId(uuid::Uuid::from_u128(
            self.seed ^ u128::from(request_seq),
        ))
    }
}
