use std::sync::atomic::{AtomicU64, Ordering};

static SHARED_TAG: AtomicU64 = AtomicU64::new(0);

/// Next value of the process-wide generation counter. Strictly increasing; never returns 0, so a
/// zero tag means "never touched".
pub fn next_shared_tag() -> u64 {
    SHARED_TAG.fetch_add(1, Ordering::Relaxed) + 1
}
