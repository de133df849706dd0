//! L1 data cache probe.
//!
//! The probe walks an owned eviction region with one load per line,
//! reading the L1D refill counter after each load.

use itertools::iproduct;

use crate::arch;
use crate::asm::{ Arena, ArenaKind };
use crate::pmu::{ CounterSource, CounterTarget, PmuEvent };
use crate::probe::{ Probe, ProbeKind, ProbeState };
use crate::shape::{ CacheShape, ProbeConfig };
use crate::status::{ Error, Result };
use crate::util::pagemap::PageMap;

pub struct L1dProbe {
    state: ProbeState,
    /// Eviction region. Like the code probes, one extra way is reserved so
    /// that the walk can start on any set.
    region: Option<Arena>,
}

impl L1dProbe {
    pub fn new() -> Self {
        Self { state: ProbeState::new(), region: None }
    }

    pub fn region(&self) -> Option<&Arena> { self.region.as_ref() }

    /// Address used to compute the set offset of `region`.
    ///
    /// The L1D is indexed with physical addresses, so use the physical
    /// address when the kernel is willing to tell us.
    fn reference_addr(region: &Arena) -> usize {
        let vaddr = region.base_addr();
        match PageMap::resolve_paddr(vaddr) {
            Ok(paddr) => paddr,
            Err(e) => {
                log::warn!("Using virtual address of the L1D eviction region \
                    for set indexing ({})", e);
                vaddr
            },
        }
    }

    /// Visit every active line, way-major. Returns `None` when detached.
    #[inline(always)]
    fn lines(&self) -> Option<(*const u8, CacheShape, usize)> {
        let region = self.region.as_ref()?;
        let shape = *self.state.shape()?;
        let base = unsafe {
            region.as_ptr().add(self.state.start_line() * shape.line_size)
        };
        Some((base, shape, self.state.active_sets()))
    }
}

impl Probe for L1dProbe {
    fn kind(&self) -> ProbeKind { ProbeKind::L1d }
    fn state(&self) -> &ProbeState { &self.state }
    fn state_mut(&mut self) -> &mut ProbeState { &mut self.state }

    fn attach(&mut self,
        shape: CacheShape,
        counters: &mut dyn CounterSource,
        target: CounterTarget,
    ) -> Result<()>
    {
        if self.state.is_attached() {
            log::info!("l1d probe already attached");
            return Err(Error::ProbeAlreadyAttached);
        }
        shape.validate()?;

        let len = shape.num_sets * (shape.associativity + 1) * shape.line_size;
        let region = Arena::new(len, ArenaKind::Data)?;
        let reference = Self::reference_addr(&region);
        self.state.attach(shape, PmuEvent::L1dRefill, counters, target)?;
        self.state.set_reference(reference);
        self.region = Some(region);
        Ok(())
    }

    fn detach(&mut self) {
        self.state.detach();
        self.region = None;
    }

    fn configure(&mut self, cfg: Option<ProbeConfig>) -> Result<()> {
        self.state.configure(cfg).map(|_| ())
    }

    fn measure(&mut self) {
        let (base, shape, active) = match self.lines() {
            Some(x) => x,
            None => return,
        };
        if !self.state.select_counter() {
            return;
        }
        let stride = shape.way_stride();
        let raw = self.state.raw_mut();
        let slots = raw.iter_mut().skip(1);
        for ((way, set), slot) in iproduct!(0..shape.associativity, 0..active).zip(slots) {
            let addr = unsafe { base.add(way * stride + set * shape.line_size) };
            *slot = arch::touch_and_read(addr);
        }
    }

    fn refill(&mut self) {
        let (base, shape, active) = match self.lines() {
            Some(x) => x,
            None => return,
        };
        let stride = shape.way_stride();
        for (way, set) in iproduct!(0..shape.associativity, 0..active) {
            arch::touch(unsafe { base.add(way * stride + set * shape.line_size) });
        }
    }
}
