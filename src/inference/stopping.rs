//! Cooperative cancellation
//!
//! [`StoppingToken`] is the early-stop predicate the decode loop polls after
//! every emitted token. Each generation re-arms the token with its own id;
//! interrupts carrying an older id are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::inference::protocol::GenerationId;

#[derive(Debug, Default)]
struct Inner {
    stop: AtomicBool,
    generation: AtomicU64,
}

/// Shared stop flag plus the id of the generation it currently guards
#[derive(Debug, Clone, Default)]
pub struct StoppingToken {
    inner: Arc<Inner>,
}

impl StoppingToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag and bind the token to `generation`.
    pub fn reset(&self, generation: GenerationId) {
        self.inner.generation.store(generation, Ordering::SeqCst);
        self.inner.stop.store(false, Ordering::SeqCst);
    }

    /// Clear the flag without rebinding.
    pub fn clear(&self) {
        self.inner.stop.store(false, Ordering::SeqCst);
    }

    /// Set the flag for whichever generation the token guards.
    pub fn interrupt(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    /// Set the flag only if the token still guards `generation`.
    ///
    /// Returns false for a stale interrupt.
    pub fn interrupt_generation(&self, generation: GenerationId) -> bool {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Generation the token is currently bound to
    pub fn generation(&self) -> GenerationId {
        self.inner.generation.load(Ordering::SeqCst)
    }
}
