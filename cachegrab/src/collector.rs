//! The routine that takes one sample on the target core.

use crate::probe::ProbeSet;
use crate::scope::Sample;
use crate::trigger::TriggerLine;

/// Number of times each probe's refill routine runs after a measurement.
pub const REFILL_ROUNDS: usize = 7;

/// Take one sample.
///
/// This runs on the target core inside a cross-call, so it must not
/// allocate or block. If the trigger line is low the sample is marked as
/// not collected and no probe is touched.
///
/// Activated probes are measured in sample order (L1D, L1I, BTB), folded
/// into `sample` at consecutive offsets, and then refilled in the reverse
/// order (BTB, L1I, L1D).
pub fn collect(probes: &mut ProbeSet, sample: &mut Sample, trigger: &TriggerLine) {
    if !trigger.is_raised() {
        sample.collected = false;
        return;
    }

    for p in probes.iter_mut().filter(|p| p.is_activated()) {
        p.measure();
    }

    let mut offs = 0;
    for p in probes.iter_mut().filter(|p| p.is_activated()) {
        let out = sample.data.get_mut(offs..).unwrap_or_default();
        offs += p.state().fold(out);
    }

    for p in probes.iter_mut().rev().filter(|p| p.is_activated()) {
        for _ in 0..REFILL_ROUNDS {
            p.refill();
        }
    }

    sample.collected = true;
}
