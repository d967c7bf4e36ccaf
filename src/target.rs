//! Delivery boundary: where images end up and on which thread.

use crate::decoder::DecodedImage;

/// Display target for a request. Implementations are usually weak handles to
/// a UI view; `is_valid` turns false once the view is gone or reused.
pub trait Target: Send + Sync {
    fn is_valid(&self) -> bool;

    /// Show `image`. `animated` asks for a fade-in.
    fn set(&self, image: &DecodedImage, animated: bool);

    fn set_as_empty(&self);
}

/// Posts work to the UI thread. Jobs posted from one thread run in order.
pub trait MainThreadDispatcher: Send + Sync {
    fn post(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs jobs immediately on the calling thread. Used headless and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl MainThreadDispatcher for InlineDispatcher {
    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_dispatcher_runs_in_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            let counter = Arc::clone(&counter);
            InlineDispatcher.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(i);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
