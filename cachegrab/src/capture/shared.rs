//! State shared by the threads of a capture pass.

use std::sync::{ Condvar, Mutex };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

use crate::status::Status;

#[derive(Default)]
struct Readiness {
    count: usize,
    released: bool,
}

pub struct SharedState {
    /// Status of the pass. Any thread may overwrite it; the last write wins.
    status: Mutex<Status>,
    readiness: Mutex<Readiness>,
    all_ready: Condvar,
    /// Set once the victim has exited.
    target_finished: AtomicBool,
}

impl SharedState {
    /// How often the orchestrator checks on the barrier.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self {
            status: Mutex::new(Status::Ok),
            readiness: Mutex::new(Readiness::default()),
            all_ready: Condvar::new(),
            target_finished: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        match self.status.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_status(&self, status: Status) {
        let mut s = match self.status.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *s = status;
    }

    pub fn is_ok(&self) -> bool { self.status().is_ok() }

    /// Report that the calling thread is set up, then wait for the
    /// orchestrator to release everyone.
    pub fn signal_ready(&self) {
        let mut r = match self.readiness.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        r.count += 1;
        while !r.released {
            r = match self.all_ready.wait(r) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn ready_count(&self) -> usize {
        match self.readiness.lock() {
            Ok(r) => r.count,
            Err(poisoned) => poisoned.into_inner().count,
        }
    }

    /// Poll until `n` threads are waiting at the barrier.
    pub fn wait_for_ready(&self, n: usize) {
        while self.ready_count() < n {
            std::thread::sleep(Self::POLL_INTERVAL);
        }
    }

    /// Let every thread waiting at the barrier (and every thread that
    /// arrives later) go.
    pub fn release(&self) {
        let mut r = match self.readiness.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        r.released = true;
        self.all_ready.notify_all();
    }

    pub fn finish_target(&self) {
        self.target_finished.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn target_finished(&self) -> bool {
        self.target_finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn last_status_wins() {
        let s = SharedState::new();
        assert!(s.is_ok());
        s.set_status(Status::OutOfMemory);
        s.set_status(Status::CaptureSetupError);
        assert_eq!(s.status(), Status::CaptureSetupError);
    }

    #[test]
    fn nobody_starts_early() {
        const N: usize = 6;
        let shared = SharedState::new();
        let started = AtomicUsize::new(0);
        let release_time = Mutex::new(None);

        let starts: Vec<Instant> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..N).map(|_| s.spawn(|| {
                shared.signal_ready();
                started.fetch_add(1, Ordering::SeqCst);
                Instant::now()
            })).collect();

            shared.wait_for_ready(N);
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(started.load(Ordering::SeqCst), 0);
            *release_time.lock().unwrap() = Some(Instant::now());
            shared.release();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(started.load(Ordering::SeqCst), N);
        let released = release_time.lock().unwrap().unwrap();
        for t in starts {
            assert!(t >= released);
            assert!(t.duration_since(released) < Duration::from_secs(1));
        }
    }

    #[test]
    fn late_arrivals_pass() {
        let shared = SharedState::new();
        shared.release();
        shared.signal_ready();
        assert_eq!(shared.ready_count(), 1);
    }

    #[test]
    fn target_flag() {
        let shared = SharedState::new();
        assert!(!shared.target_finished());
        shared.finish_target();
        assert!(shared.target_finished());
    }
}
