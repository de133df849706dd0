//! Branch target buffer probe.

use crate::asm::{ BEQ_4, CMP_TRUE, READ_EVCNTR, STORE_VALUE };
use crate::pmu::PmuEvent;
use crate::probe::ProbeKind;
use crate::probe::sweep::{ Gadget, SweepProbe };

/// An always-taken conditional branch to the next instruction, followed by
/// a read of the branch-mispredict counter.
///
/// NOTE: The branch only occupies a BTB entry once it has been taken, so
/// every active line gets a fresh one.
pub struct BtbGadget;
impl Gadget for BtbGadget {
    const KIND: ProbeKind = ProbeKind::Btb;
    const EVENT: PmuEvent = PmuEvent::BranchMispredict;
    const WORDS: &'static [u32] = &[
        CMP_TRUE,
        BEQ_4,
        READ_EVCNTR,
        STORE_VALUE,
    ];
}

pub type BtbProbe = SweepProbe<BtbGadget>;
