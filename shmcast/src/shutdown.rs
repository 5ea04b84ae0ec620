use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Process-local stop flag, cheap to clone into signal handlers and threads.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the token had already been cancelled.
    pub fn cancel(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
