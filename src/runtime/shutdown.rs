//! Cooperative shutdown for the event loop.
//!
//! The loop checks the flag once per iteration, so a handler that is
//! already running always completes. The loop registers a `mio::Waker`
//! so a request interrupts the readiness wait instead of sitting out the
//! poll timeout.

use mio::Waker;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Cloneable handle that stops a running server.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wakers: Arc<Mutex<Vec<Arc<Waker>>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event loop's waker to the set woken on shutdown.
    pub(crate) fn register(&self, waker: Arc<Waker>) {
        if let Ok(mut wakers) = self.wakers.lock() {
            wakers.push(waker);
        }
    }

    /// Ask every registered loop to stop after its current iteration.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);

        let wakers = match self.wakers.lock() {
            Ok(wakers) => wakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for waker in wakers.iter() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Trigger `handle` on the first SIGINT or SIGTERM.
///
/// Signals are received on a dedicated background thread.
pub fn install_signal_handler(handle: ShutdownHandle) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown requested");
                handle.trigger();
            }
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::{Duration, Instant};

    #[test]
    fn test_trigger_sets_flag() {
        let handle = ShutdownHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_triggered());

        handle.trigger();
        assert!(clone.is_triggered());
    }

    #[test]
    fn test_trigger_wakes_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(7)).unwrap());

        let handle = ShutdownHandle::new();
        handle.register(waker);

        let trigger = handle.clone();
        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });

        let mut events = Events::with_capacity(8);
        let start = Instant::now();
        poll.poll(&mut events, Some(Duration::from_secs(10))).unwrap();
        thread.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|event| event.token() == Token(7)));
        assert!(handle.is_triggered());
    }
}
