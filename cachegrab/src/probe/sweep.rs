//! Probes implemented with generated code.
//!
//! Both the L1I and BTB probes work the same way: a routine is laid out in
//! an executable arena so that every cache line it covers holds a small
//! measurement gadget (or an equal-width run of `nop`s), and executing the
//! routine once both measures and refills the structure.
//!
//! Layout for a 4-set, 2-way cache with sets `[1, 3)` selected, assuming
//! the arena starts on set 0 (`G` is a gadget, `.` a padded no-op slot):
//!
//! ```text
//!   arena line:  0  1  2  3  4  5  6  7  8  9
//!   routine:        G  G  .  .  G  G  .  .ret
//! ```

use std::marker::PhantomData;
use itertools::iproduct;

use crate::arch::{ self, RoutineFn };
use crate::asm::{ A64Assembler, A64Emitter, Arena, ArenaKind };
use crate::pmu::{ CounterSource, CounterTarget, PmuEvent };
use crate::probe::{ Probe, ProbeKind, ProbeState };
use crate::shape::{ CacheShape, ProbeConfig, INS_SIZE };
use crate::status::{ Error, Result };

/// The measurement gadget placed in every active line.
///
/// A gadget must read the selected event counter into `x1` and store it
/// with `str x1, [x0], #8`.
pub trait Gadget: Send + 'static {
    const KIND: ProbeKind;
    const EVENT: PmuEvent;
    const WORDS: &'static [u32];

    /// Size of the gadget (in bytes).
    fn size() -> usize { Self::WORDS.len() * INS_SIZE }
}

/// Number of bytes needed for the arena backing a sweep routine.
///
/// One extra way is reserved so the routine can start on any set; when a
/// gadget fills a whole line there is no padding to hold the trailing `ret`,
/// so one more instruction is reserved for it.
pub fn arena_size(shape: &CacheShape, gadget_size: usize) -> usize {
    let mut res = shape.num_sets * (shape.associativity + 1) * shape.line_size;
    if shape.line_size == gadget_size {
        res += INS_SIZE;
    }
    res
}

/// Emit a sweep routine.
///
/// Slots are visited way-major: every set of way 0, then every set of way 1,
/// and so on. The first `active` slots of each way hold `gadget`; the others
/// hold the same number of `nop`s. Every slot but the last is padded out to
/// a full line.
pub fn emit_sweep(ops: &mut A64Assembler,
    shape: &CacheShape,
    active: usize,
    gadget: &[u32],
)
{
    let nways = shape.associativity;
    let nsets = shape.num_sets;
    let numext = shape.line_size / INS_SIZE - gadget.len();

    for (way, set) in iproduct!(0..nways, 0..nsets) {
        if set < active {
            ops.emit_words(gadget);
        } else {
            ops.emit_nops(gadget.len());
        }
        if set < nsets - 1 || way < nways - 1 {
            ops.emit_nops(numext);
        }
    }
    ops.emit_ret();
}

/// A probe backed by a generated sweep routine.
pub struct SweepProbe<G: Gadget> {
    state: ProbeState,
    arena: Option<Arena>,
    /// Entry point of the current routine.
    routine: Option<RoutineFn>,
    /// Offset of the current routine in the arena.
    routine_offset: usize,
    _gadget: PhantomData<G>,
}

impl<G: Gadget> SweepProbe<G> {
    pub fn new() -> Self {
        Self {
            state: ProbeState::new(),
            arena: None,
            routine: None,
            routine_offset: 0,
            _gadget: PhantomData,
        }
    }

    pub fn arena(&self) -> Option<&Arena> { self.arena.as_ref() }

    /// Offset of the current routine in the arena.
    pub fn routine_offset(&self) -> usize { self.routine_offset }

    /// The bytes of the current routine, if one has been generated.
    pub fn routine_bytes(&self) -> Option<&[u8]> {
        self.routine?;
        let arena = self.arena.as_ref()?;
        let shape = self.state.shape()?;
        let len = shape.num_lines() * shape.line_size
            - (shape.line_size - G::size())
            + INS_SIZE;
        arena.as_slice().get(self.routine_offset..self.routine_offset + len)
    }

    /// Generate a routine for the current configuration and commit it.
    fn regenerate(&mut self) -> Result<()> {
        let shape = *self.state.shape().ok_or(Error::ProbeNotAttached)?;
        let active = self.state.active_sets();
        let arena = self.arena.as_mut().ok_or(Error::ProbeNotAttached)?;

        let offset = self.state.start_line() * shape.line_size;
        let mut ops = A64Assembler::new(arena.base_addr() + offset);
        emit_sweep(&mut ops, &shape, active, G::WORDS);
        let code = ops.finalize()
            .map_err(|e| Error::internal(format!("sweep assembly: {:?}", e)))?;

        // The old routine is gone as soon as the arena is overwritten.
        self.routine = None;
        arena.commit(offset, &code)?;
        self.routine = Some(unsafe { arena.routine_at(offset) });
        self.routine_offset = offset;
        log::debug!("{} routine: {} sets x {} ways at {:016x} ({:#x} bytes)",
            G::KIND, active, shape.associativity,
            arena.base_addr() + offset, code.len());
        Ok(())
    }

    #[inline(always)]
    fn run(&mut self, from: usize) {
        if let Some(f) = self.routine {
            if !arch::can_execute_routines() {
                return;
            }
            let raw = self.state.raw_mut();
            if let Some(out) = raw.get_mut(from..) {
                unsafe { arch::call_routine(f, out.as_mut_ptr()); }
            }
        }
    }
}

impl<G: Gadget> Probe for SweepProbe<G> {
    fn kind(&self) -> ProbeKind { G::KIND }
    fn state(&self) -> &ProbeState { &self.state }
    fn state_mut(&mut self) -> &mut ProbeState { &mut self.state }

    fn attach(&mut self,
        shape: CacheShape,
        counters: &mut dyn CounterSource,
        target: CounterTarget,
    ) -> Result<()>
    {
        if self.state.is_attached() {
            log::info!("{} probe already attached", G::KIND);
            return Err(Error::ProbeAlreadyAttached);
        }
        shape.validate_for_code(G::WORDS.len())?;

        let arena = Arena::new(arena_size(&shape, G::size()), ArenaKind::Code)?;
        self.state.attach(shape, G::EVENT, counters, target)?;
        self.state.set_reference(arena.base_addr());
        self.arena = Some(arena);
        Ok(())
    }

    fn detach(&mut self) {
        self.state.detach();
        self.routine = None;
        self.routine_offset = 0;
        self.arena = None;
    }

    fn configure(&mut self, cfg: Option<ProbeConfig>) -> Result<()> {
        let prev = self.state.config().copied();
        self.state.configure(cfg)?;
        if let Err(e) = self.regenerate() {
            // Put the previous routine back (if there was one).
            if let Some(prev) = prev {
                self.state.configure(Some(prev))?;
                self.regenerate()?;
            }
            return Err(e);
        }
        Ok(())
    }

    fn measure(&mut self) {
        if self.state.select_counter() {
            self.run(1);
        }
    }

    fn refill(&mut self) {
        self.run(0);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::asm::{ code_words, NOP, RET };

    /// Split a routine into line-sized slots of instruction words.
    pub fn slots(code: &[u8], shape: &CacheShape) -> Vec<Vec<u32>> {
        code_words(code)
            .chunks(shape.line_size / INS_SIZE)
            .map(|c| c.to_vec())
            .collect()
    }

    pub fn sweep(shape: &CacheShape, active: usize, gadget: &[u32]) -> Vec<u8> {
        let mut ops = A64Assembler::new(0);
        emit_sweep(&mut ops, shape, active, gadget);
        ops.finalize().unwrap()
    }

    #[test]
    fn sweep_layout() {
        let shape = CacheShape::new(4, 2, 16);
        let g = [0x1111_1111, 0x2222_2222];
        let code = sweep(&shape, 2, &g);
        let words = code_words(&code);
        // 8 slots of 4 words, minus the last slot's padding, plus `ret`
        assert_eq!(words.len(), 8 * 4 - 2 + 1);
        assert_eq!(&words[0..4], &[g[0], g[1], NOP, NOP]);
        assert_eq!(&words[8..12], &[NOP, NOP, NOP, NOP]);
        assert_eq!(&words[16..20], &[g[0], g[1], NOP, NOP]);
        assert_eq!(&words[28..], &[NOP, NOP, RET]);
    }

    #[test]
    fn sweep_tight_lines() {
        // Gadget fills the whole line; no padding anywhere.
        let shape = CacheShape::new(2, 2, 8);
        let g = [0xaaaa_aaaa, 0xbbbb_bbbb];
        let words = code_words(&sweep(&shape, 1, &g));
        assert_eq!(words, vec![g[0], g[1], NOP, NOP, g[0], g[1], NOP, NOP, RET]);
        assert!(words.len() * INS_SIZE <= arena_size(&shape, 8));
    }

    #[test]
    fn arena_sizes() {
        let shape = CacheShape::new(64, 4, 64);
        assert_eq!(arena_size(&shape, 8), 64 * 5 * 64);
        let tight = CacheShape::new(64, 4, 8);
        assert_eq!(arena_size(&tight, 8), 64 * 5 * 8 + 4);
    }

    #[test]
    fn routine_fits_at_any_start() {
        // The routine must fit wherever the first active set lands.
        for (line_size, gsize) in [(8, 8), (16, 16), (64, 8), (64, 16)] {
            let shape = CacheShape::new(16, 3, line_size);
            let g: Vec<u32> = vec![0; gsize / INS_SIZE];
            let len = sweep(&shape, 16, &g).len();
            let max_offset = (shape.num_sets - 1) * line_size;
            assert!(max_offset + len <= arena_size(&shape, gsize));
        }
    }
}
