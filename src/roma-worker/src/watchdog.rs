//! Deadline watchdog for guest execution.
//!
//! A single long-lived thread sleeps until the armed deadline and then sets
//! the shared interrupt flag. The engine's interrupt handler polls that flag
//! from QuickJS safepoints, so an expired deadline unwinds the running
//! script instead of blocking the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct State {
    deadline: Option<Instant>,
    generation: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    fired: Arc<AtomicBool>,
}

/// Arms wall-clock deadlines for the engine.
///
/// `arm` and `disarm` are called from the worker's main thread around each
/// compile/execute; the watchdog thread is the only other writer of the
/// interrupt flag.
pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the watchdog thread.
    pub fn spawn() -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                deadline: None,
                generation: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            fired: Arc::new(AtomicBool::new(false)),
        });
        let run_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("roma-watchdog".to_string())
            .spawn(move || watch(run_inner))?;
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// The flag the engine's interrupt handler polls.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.fired)
    }

    /// Arm a deadline `budget` from now. Clears any previous expiry.
    pub fn arm(&self, budget: Duration) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.fired.store(false, Ordering::SeqCst);
        state.deadline = Some(Instant::now() + budget);
        state.generation = state.generation.wrapping_add(1);
        self.inner.cv.notify_one();
    }

    /// Disarm the current deadline. Returns whether it had already expired.
    pub fn disarm(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.deadline = None;
        self.inner.cv.notify_one();
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Whether the most recently armed deadline expired.
    pub fn expired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            self.inner.cv.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(inner: Arc<Inner>) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = inner.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    let generation = state.generation;
                    inner.fired.store(true, Ordering::SeqCst);
                    state.deadline = None;
                    tracing::debug!(generation, "execution deadline expired");
                } else {
                    let (next, _timeout) = inner
                        .cv
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
            }
        }
    }
}
