use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation token for long-running operations (page loops, shard discovery, batches).
///
/// Clones share the same flag, so a token handed to a worker can be cancelled from anywhere.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
