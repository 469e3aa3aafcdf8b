use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot guard: the first `trip` wins, every later call is told it lost.
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns true for exactly one caller.
    pub fn trip(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Registered/unregistered flag for one viewer's presence entry.
/// Each transition succeeds only from the opposite state.
#[derive(Debug, Default)]
pub struct PresenceLatch(AtomicBool);

impl PresenceLatch {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// True if this call moved unregistered -> registered.
    pub fn try_register(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True if this call moved registered -> unregistered.
    pub fn try_unregister(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_registered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
