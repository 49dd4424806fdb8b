use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A handle to a scheduled timer callback.
///
/// Dropping a handle does not cancel the timer; call [`Timer::cancel`]
/// explicitly. Handles are never reused.
#[derive(Debug, Clone)]
pub struct Handle {
    cancelled: Arc<AtomicBool>,
}

/// The minimal clock/scheduler interface the engine depends on.
///
/// Kept this small and host-runtime agnostic so tests can swap in a fake
/// that fires deterministically instead of sleeping in real time.
pub trait Timer: Send + Sync {
    /// Schedules `callback` to run once, after `delay`. Returns a handle
    /// that can be passed to [`Timer::cancel`].
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send + 'static>) -> Handle;

    /// Cancels a previously scheduled timer. Idempotent: cancelling twice,
    /// or cancelling after the timer already fired, is a no-op.
    fn cancel(&self, handle: &Handle) {
        handle.cancelled.store(true, Ordering::SeqCst);
    }
}

/// The default [`Timer`] for production use, backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send + 'static>) -> Handle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = cancelled.clone();

        tokio::spawn(async move {
            tokio::time::delay_for(delay).await;
            if !guard.load(Ordering::SeqCst) {
                callback();
            }
        });

        Handle { cancelled }
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{Handle, Timer};

    /// A deterministic stand-in for [`super::TokioTimer`] used in
    /// `#[cfg(test)]` engine tests: rather than sleeping, it records what
    /// was scheduled so a test can fire callbacks itself instead of
    /// waiting on real time.
    #[derive(Default, Clone)]
    pub struct FakeTimer {
        pending: Arc<Mutex<Vec<(Handle, Box<dyn FnOnce() + Send>)>>>,
    }

    impl FakeTimer {
        pub fn new() -> Self {
            Self::default()
        }

        /// runs every callback that is still pending and not cancelled,
        /// oldest first.
        pub fn fire_all(&self) {
            let mut pending = self.pending.lock().unwrap();
            let callbacks = std::mem::take(&mut *pending);
            drop(pending);

            for (handle, callback) in callbacks {
                if !handle.cancelled.load(Ordering::SeqCst) {
                    callback();
                }
            }
        }

        pub fn pending_count(&self) -> usize {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(h, _)| !h.cancelled.load(Ordering::SeqCst))
                .count()
        }
    }

    impl Timer for FakeTimer {
        fn schedule(&self, _delay: Duration, callback: Box<dyn FnOnce() + Send + 'static>) -> Handle {
            let handle = Handle {
                cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            };

            self.pending
                .lock()
                .unwrap()
                .push((handle.clone(), callback));

            handle
        }
    }
}
