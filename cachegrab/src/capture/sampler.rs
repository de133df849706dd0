//! The scope thread: drives collection from its own core.

use crate::capture::config::CaptureConfig;
use crate::capture::shared::SharedState;
use crate::scope::Scope;
use crate::status::{ Error, Result };
use crate::util::GrabEnv;

/// Pin the scope thread, then prepare samples and arm the probes.
/// Returns the number of samples prepared.
fn setup(scope: &mut Scope, cfg: &CaptureConfig) -> Result<usize> {
    let cpu = scope.scope_cpu();
    GrabEnv::pin_to_core(cpu).map_err(|e| {
        Error::CaptureSetup(format!("scope thread couldn't pin to cpu {}: {}", cpu, e))
    })?;
    if !GrabEnv::raise_priority() {
        log::debug!("scope thread is running at normal priority");
    }

    let prepared = scope.prepare(cfg.max_samples);
    if prepared == 0 {
        return Err(Error::OutOfMemory("couldn't prepare any samples"));
    }
    if prepared < cfg.max_samples {
        log::info!("only prepared {} of {} samples", prepared, cfg.max_samples);
    }
    scope.arm().map_err(|e| {
        Error::CaptureSetup(format!("couldn't arm the scope: {}", e))
    })?;
    Ok(prepared)
}

/// Body of the scope thread. Returns the number of samples collected.
pub fn run(scope: &mut Scope, cfg: &CaptureConfig, shared: &SharedState) -> usize {
    if let Err(e) = setup(scope, cfg) {
        log::warn!("{}", e);
        shared.set_status(e.status());
    }

    shared.signal_ready();
    let mut nsamples = 0;
    if shared.is_ok() {
        match scope.collect(cfg.time_delta, cfg.timeout) {
            Ok(n) => nsamples = n,
            Err(e) => {
                log::warn!("collection failed: {}", e);
                shared.set_status(e.status());
            },
        }
    }
    scope.deactivate();
    nsamples
}
