//! L1 instruction cache probe.

use crate::asm::{ READ_EVCNTR, STORE_VALUE };
use crate::pmu::PmuEvent;
use crate::probe::ProbeKind;
use crate::probe::sweep::{ Gadget, SweepProbe };

/// Reads the L1I refill counter from inside the line being measured.
pub struct L1iGadget;
impl Gadget for L1iGadget {
    const KIND: ProbeKind = ProbeKind::L1i;
    const EVENT: PmuEvent = PmuEvent::L1iRefill;
    const WORDS: &'static [u32] = &[
        READ_EVCNTR,
        STORE_VALUE,
    ];
}

pub type L1iProbe = SweepProbe<L1iGadget>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::{ code_words, NOP, RET };
    use crate::pmu::CounterTarget;
    use crate::pmu::fake::FakeCounterSource;
    use crate::probe::Probe;
    use crate::probe::sweep::test::slots;
    use crate::shape::{ CacheShape, ProbeConfig };
    use crate::status::Error;

    const TARGET: CounterTarget = CounterTarget { cpu: 0, tid: 0 };

    fn attached(shape: CacheShape) -> (L1iProbe, FakeCounterSource) {
        let mut src = FakeCounterSource::default();
        let mut p = L1iProbe::new();
        p.attach(shape, &mut src, TARGET).unwrap();
        p.configure(None).unwrap();
        (p, src)
    }

    #[test]
    fn gadget_counts() {
        let shape = CacheShape::new(64, 4, 64);
        let (mut p, _src) = attached(shape);
        p.configure(Some(ProbeConfig::new(0, 8))).unwrap();

        let code = p.routine_bytes().unwrap();
        let slots = slots(code, &shape);
        assert_eq!(slots.len(), 256);
        let gadgets = slots.iter()
            .filter(|s| s[0] == READ_EVCNTR && s[1] == STORE_VALUE)
            .count();
        let nops = slots.iter()
            .filter(|s| s[0] == NOP && s[1] == NOP)
            .count();
        assert_eq!(gadgets, 32);
        assert_eq!(nops, 224);

        // Each slot but the last is padded to a full line, then one `ret`.
        let words = code_words(code);
        assert_eq!(words.iter().filter(|w| **w == RET).count(), 1);
        assert_eq!(*words.last().unwrap(), RET);
        assert!(slots[..255].iter().all(|s| s.len() == 16 && s[2..].iter().all(|w| *w == NOP)));
    }

    #[test]
    fn routine_starts_on_set_start() {
        let shape = CacheShape::new(64, 4, 64);
        let (mut p, _src) = attached(shape);
        for (s, e) in [(0, 8), (13, 20), (60, 4), (63, 64)] {
            p.configure(Some(ProbeConfig::new(s, e))).unwrap();
            let entry = p.arena().unwrap().base_addr() + p.routine_offset();
            assert_eq!(shape.set_of(entry), s);
        }
    }

    #[test]
    fn bad_shapes_rejected() {
        let mut src = FakeCounterSource::default();
        let mut p = L1iProbe::new();
        for shape in [CacheShape::new(64, 4, 4), CacheShape::new(64, 4, 10)] {
            let res = p.attach(shape, &mut src, TARGET);
            assert!(matches!(res, Err(Error::BadArgument(_))));
            assert!(!p.state().is_attached());
        }
        assert_eq!(src.live(), 0);
    }

    #[test]
    fn attach_twice_keeps_state() {
        let shape = CacheShape::new(64, 4, 64);
        let (mut p, mut src) = attached(shape);
        let base = p.arena().unwrap().base_addr();
        let res = p.attach(CacheShape::new(32, 2, 64), &mut src, TARGET);
        assert_eq!(res, Err(Error::ProbeAlreadyAttached));
        assert_eq!(p.arena().unwrap().base_addr(), base);
        assert_eq!(p.state().shape(), Some(&shape));
    }

    #[test]
    fn detach_and_reattach() {
        let shape = CacheShape::new(64, 4, 64);
        let (mut p, mut src) = attached(shape);
        p.detach();
        assert!(p.arena().is_none() && p.routine_bytes().is_none());
        assert_eq!(src.live(), 0);
        p.attach(shape, &mut src, TARGET).unwrap();
        p.configure(Some(ProbeConfig::new(4, 2))).unwrap();
        assert_eq!(p.sample_size(), 62);
    }

    #[test]
    fn bad_config_keeps_routine() {
        let shape = CacheShape::new(64, 4, 64);
        let (mut p, _src) = attached(shape);
        p.configure(Some(ProbeConfig::new(3, 9))).unwrap();
        let before = p.routine_bytes().unwrap().to_vec();
        assert!(p.configure(Some(ProbeConfig::new(5, 5))).is_err());
        assert_eq!(p.state().config(), Some(&ProbeConfig::new(3, 9)));
        assert_eq!(p.routine_bytes().unwrap(), &before[..]);
    }
}
