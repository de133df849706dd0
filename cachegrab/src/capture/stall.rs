//! Stall threads keep every other core busy while the victim runs, so that
//! the scheduler has nowhere to migrate it.

use crate::capture::shared::SharedState;
use crate::status::Status;
use crate::util::GrabEnv;

/// Body of a stall thread. Returns the number of iterations spun.
pub fn run(cpu: usize, cutoff: u64, shared: &SharedState) -> u64 {
    if let Err(e) = GrabEnv::pin_to_core(cpu) {
        log::warn!("stall thread couldn't pin to cpu {}: {}", cpu, e);
        shared.set_status(Status::CaptureSetupError);
    }
    shared.signal_ready();
    if !shared.is_ok() {
        return 0;
    }

    let mut spins = 0;
    while !shared.target_finished() && spins < cutoff {
        spins += 1;
        std::hint::spin_loop();
    }
    spins
}
