//! Cross-calls: running a job synchronously on the target core.
//!
//! A collection has to happen on the core being measured while the caller
//! (the scope thread) runs somewhere else. [`PinnedWorker`] keeps a thread
//! pinned to the target core and hands it one job at a time, blocking until
//! the job has finished. [`Inline`] just runs the job on the calling thread.

use std::thread::JoinHandle;
use crossbeam_channel::{ bounded, Receiver, Sender };

use crate::status::{ Error, Result };
use crate::util::GrabEnv;

/// Real-time priority requested for a [`PinnedWorker`]. It sits above
/// [`VICTIM_PRIORITY`] so that a collection preempts the victim.
pub const WORKER_PRIORITY: i32 = 2;

/// Real-time priority requested for the victim process.
pub const VICTIM_PRIORITY: i32 = 1;

/// A job run by [`CrossCall::call`].
pub type Job<'a> = dyn FnMut() + Send + 'a;

/// Something that can run a job on the target core.
pub trait CrossCall: Send {
    /// Run `job` to completion on the target core.
    fn call(&mut self, job: &mut Job<'_>) -> Result<()>;

    /// Kernel thread ID of the thread that runs jobs. PMU counters used by
    /// jobs must be bound to this thread.
    fn target_tid(&self) -> i32;

    /// The core that jobs run on, if known.
    fn target_cpu(&self) -> Option<usize>;
}

/// Runs jobs on the calling thread.
pub struct Inline {
    tid: i32,
}
impl Inline {
    pub fn new() -> Self { Self { tid: GrabEnv::gettid() } }
}
impl CrossCall for Inline {
    fn call(&mut self, job: &mut Job<'_>) -> Result<()> {
        job();
        Ok(())
    }
    fn target_tid(&self) -> i32 { self.tid }
    fn target_cpu(&self) -> Option<usize> { None }
}

/// A job with its lifetime erased, so it can cross the channel.
///
/// Only ever built by [`PinnedWorker::call`], which does not return until
/// the worker is done with it.
struct ErasedJob(*mut Job<'static>);
unsafe impl Send for ErasedJob {}

/// A thread pinned to the target core that runs jobs on request.
pub struct PinnedWorker {
    cpu: usize,
    tid: i32,
    jobs: Option<Sender<ErasedJob>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl PinnedWorker {
    /// Spawn a worker and wait until it is running on `cpu`.
    pub fn spawn(cpu: usize) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<ErasedJob>(0);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (boot_tx, boot_rx) = bounded::<Result<i32>>(1);

        let handle = std::thread::Builder::new()
            .name(format!("cachegrab-xcall-{}", cpu))
            .spawn(move || {
                if let Err(e) = GrabEnv::pin_to_core(cpu) {
                    let _ = boot_tx.send(Err(e));
                    return;
                }
                if !GrabEnv::set_fifo_priority(WORKER_PRIORITY) {
                    log::debug!("cross-call worker on cpu {} is not real-time", cpu);
                }
                let _ = boot_tx.send(Ok(GrabEnv::gettid()));
                for ErasedJob(job) in job_rx.iter() {
                    unsafe { (*job)(); }
                    if done_tx.send(()).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| Error::internal(format!("couldn't spawn worker: {}", e)))?;

        let tid = match boot_rx.recv() {
            Ok(Ok(tid)) => tid,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            },
            Err(_) => {
                let _ = handle.join();
                return Err(Error::internal("cross-call worker exited during startup"));
            },
        };
        log::debug!("cross-call worker running on cpu {} (tid {})", cpu, tid);
        Ok(Self { cpu, tid, jobs: Some(job_tx), done: done_rx, handle: Some(handle) })
    }
}

impl CrossCall for PinnedWorker {
    fn call(&mut self, job: &mut Job<'_>) -> Result<()> {
        let jobs = self.jobs.as_ref()
            .ok_or_else(|| Error::internal("cross-call worker is gone"))?;
        let ptr: *mut Job<'_> = job;
        let erased = ErasedJob(unsafe {
            std::mem::transmute::<*mut Job<'_>, *mut Job<'static>>(ptr)
        });
        jobs.send(erased)
            .map_err(|_| Error::internal("cross-call worker is gone"))?;
        // The job borrows from our caller; don't return until it's done.
        self.done.recv()
            .map_err(|_| Error::internal("cross-call worker died during a job"))
    }
    fn target_tid(&self) -> i32 { self.tid }
    fn target_cpu(&self) -> Option<usize> { Some(self.cpu) }
}

impl Drop for PinnedWorker {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
