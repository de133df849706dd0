//! Capture passes.
//!
//! A pass runs a victim command on the target core while the scope samples
//! it. Three kinds of thread take part:
//!
//! - The target thread, pinned to the target core, runs the victim.
//! - The scope thread, pinned to the scope core, prepares samples and then
//!   collects them on the target core.
//! - One stall thread on every other usable core keeps that core busy until
//!   the victim exits.
//!
//! Every thread sets itself up and then waits at a barrier. Once all of
//! them are waiting, they are released together.

pub mod config;
pub mod shared;
pub mod target;
pub mod stall;
pub mod sampler;
pub mod data;

pub use config::{ CaptureConfig, TriggerMode };
pub use data::{ CaptureData, ProbeData, RawEncoder, SampleEncoder };

use std::thread::ScopedJoinHandle;

use crate::scope::Scope;
use crate::status::{ Error, Result, Status };
use crate::util::GrabEnv;
use shared::SharedState;
use target::TargetReport;

/// The outcome of a capture pass.
#[derive(Clone, Debug)]
pub struct CaptureOutput {
    /// Overall status of the pass.
    pub result: Status,
    /// Exit code of the victim.
    pub status: Option<i32>,
    pub out_stream: Vec<u8>,
    pub err_stream: Vec<u8>,
    /// Number of samples collected.
    pub nsamples: usize,
    /// Retrieved samples (only present when every thread was started).
    pub data: Option<CaptureData>,
}
impl CaptureOutput {
    fn failed(result: Status) -> Self {
        Self {
            result,
            status: None,
            out_stream: Vec::new(),
            err_stream: Vec::new(),
            nsamples: 0,
            data: None,
        }
    }
}

/// Cores that get a stall thread.
pub fn stall_cores(target_cpu: usize, scope_cpu: usize) -> Result<Vec<usize>> {
    Ok(GrabEnv::allowed_cores()?
        .into_iter()
        .filter(|c| *c != target_cpu && *c != scope_cpu)
        .collect())
}

/// Run one capture pass with `scope`.
///
/// Returns an error if the pass can't be attempted at all. Otherwise the
/// status of the pass is in [`CaptureOutput::result`].
pub fn run(scope: &mut Scope, cfg: &CaptureConfig) -> Result<CaptureOutput> {
    let target_cpu = scope.target_cpu();
    let scope_cpu = scope.scope_cpu();
    if target_cpu == scope_cpu {
        return Err(Error::BadArgument("target and scope cpus must differ"));
    }
    cfg.validate()?;
    // Counters are bound to the cross-call thread, so collections made
    // from the scope thread itself would read nothing.
    if scope.collection_cpu() != Some(target_cpu) {
        return Err(Error::BadArgument(
            "capture needs a cross-call worker pinned to the target cpu"
        ));
    }
    let stalls = stall_cores(target_cpu, scope_cpu)?;
    log::info!("capture: target cpu {}, scope cpu {}, {} stall threads",
        target_cpu, scope_cpu, stalls.len());

    let shared = SharedState::new();
    let trigger = scope.trigger().clone();

    let (started, report, nsamples) = std::thread::scope(|s| {
        let mut spawned = 0;
        let mut started = true;

        let target = std::thread::Builder::new()
            .name("cachegrab-target".to_string())
            .spawn_scoped(s, || target::run(target_cpu, cfg, &trigger, &shared));
        let target = match target {
            Ok(h) => { spawned += 1; Some(h) },
            Err(e) => {
                log::warn!("couldn't spawn target thread: {}", e);
                started = false;
                None
            },
        };

        let sampler = if started {
            let res = std::thread::Builder::new()
                .name("cachegrab-scope".to_string())
                .spawn_scoped(s, || sampler::run(scope, cfg, &shared));
            match res {
                Ok(h) => { spawned += 1; Some(h) },
                Err(e) => {
                    log::warn!("couldn't spawn scope thread: {}", e);
                    started = false;
                    None
                },
            }
        } else {
            None
        };

        let mut stall_threads: Vec<ScopedJoinHandle<'_, u64>> = Vec::new();
        for &cpu in stalls.iter() {
            if !started {
                break;
            }
            let shared = &shared;
            let res = std::thread::Builder::new()
                .name(format!("cachegrab-stall-{}", cpu))
                .spawn_scoped(s, move || stall::run(cpu, cfg.stall_cutoff, shared));
            match res {
                Ok(h) => { spawned += 1; stall_threads.push(h); },
                Err(e) => {
                    log::warn!("couldn't spawn stall thread for cpu {}: {}", cpu, e);
                    started = false;
                },
            }
        }

        if started {
            shared.wait_for_ready(spawned);
            log::debug!("releasing {} threads", spawned);
        } else {
            shared.set_status(Status::CaptureSetupError);
        }
        shared.release();

        for h in stall_threads {
            if h.join().is_err() {
                log::warn!("a stall thread panicked");
            }
        }
        let nsamples = match sampler.map(|h| h.join()) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                log::warn!("the scope thread panicked");
                shared.set_status(Status::InternalError);
                0
            },
            None => 0,
        };
        let report = match target.map(|h| h.join()) {
            Some(Ok(r)) => r,
            Some(Err(_)) => {
                log::warn!("the target thread panicked");
                shared.set_status(Status::InternalError);
                TargetReport::default()
            },
            None => TargetReport::default(),
        };
        (started, report, nsamples)
    });

    if !started {
        return Ok(CaptureOutput::failed(Status::CaptureSetupError));
    }

    let data = CaptureData::retrieve(scope)?;
    let result = shared.status();
    log::info!("capture finished: {} ({} samples, victim exit {:?})",
        result, nsamples, report.exit_code);
    Ok(CaptureOutput {
        result,
        status: report.exit_code,
        out_stream: report.stdout,
        err_stream: report.stderr,
        nsamples,
        data: Some(data),
    })
}
