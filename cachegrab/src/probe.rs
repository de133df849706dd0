//! Cache probes.
//!
//! A probe owns everything needed to Prime+Probe one cache-like structure
//! on the target core: a bound PMU counter, a buffer for raw counter values,
//! and either an eviction region (L1D) or generated code (L1I, BTB).
//!
//! Probe lifecycle:
//!
//! ```text
//!   Detached --attach--> Attached --activate--> Activated
//!      ^                  |   ^                    |
//!      +-----detach-------+   +-----deactivate-----+
//! ```

pub mod l1d;
pub mod sweep;
pub mod l1i;
pub mod btb;

pub use l1d::L1dProbe;
pub use l1i::L1iProbe;
pub use btb::BtbProbe;

use num_enum::{ IntoPrimitive, TryFromPrimitive };

use crate::arch;
use crate::pmu::{ CounterSource, CounterTarget, PmuCounter, PmuEvent };
use crate::shape::{ CacheShape, ProbeConfig };
use crate::status::{ Error, Result };

/// The kinds of probe a scope can hold.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(IntoPrimitive, TryFromPrimitive, clap::ValueEnum)]
pub enum ProbeKind {
    L1d = 1,
    L1i = 2,
    Btb = 3,
}
impl ProbeKind {
    /// All probe kinds, in the order their data appears in a sample.
    pub const ALL: [ProbeKind; 3] = [Self::L1d, Self::L1i, Self::Btb];

    pub const fn index(&self) -> usize {
        match self {
            Self::L1d => 0,
            Self::L1i => 1,
            Self::Btb => 2,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::L1d => "l1d",
            Self::L1i => "l1i",
            Self::Btb => "btb",
        }
    }
}
impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Shape and configuration of an attached probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeInfo {
    pub kind: ProbeKind,
    pub shape: CacheShape,
    pub config: ProbeConfig,
}

/// State shared by every kind of probe.
#[derive(Default)]
pub struct ProbeState {
    /// Cache shape (present while attached).
    shape: Option<CacheShape>,
    /// Currently selected range of sets.
    config: Option<ProbeConfig>,
    activated: bool,
    counter: Option<Box<dyn PmuCounter>>,
    /// Raw counter values from the last measurement. Slot 0 holds the
    /// baseline read before the first line is measured.
    raw: Vec<u64>,
    /// The cache set that the start of the reference region maps to.
    set_offset: usize,
}

impl ProbeState {
    pub fn new() -> Self { Self::default() }

    pub fn is_attached(&self) -> bool { self.shape.is_some() }
    pub fn is_activated(&self) -> bool { self.activated }
    pub fn shape(&self) -> Option<&CacheShape> { self.shape.as_ref() }
    pub fn config(&self) -> Option<&ProbeConfig> { self.config.as_ref() }
    pub fn set_offset(&self) -> usize { self.set_offset }
    pub fn raw(&self) -> &[u64] { &self.raw }

    /// Number of sets currently selected (zero when detached).
    pub fn active_sets(&self) -> usize {
        match (self.shape, self.config) {
            (Some(shape), Some(cfg)) => cfg.active_sets(&shape),
            _ => 0,
        }
    }

    /// Width (in bytes) of this probe's data in a sample.
    pub fn sample_size(&self) -> usize { self.active_sets() }

    /// Distance (in lines) from the start of the reference region to the
    /// first line that maps onto `set_start`.
    pub fn start_line(&self) -> usize {
        match (self.shape, self.config) {
            (Some(shape), Some(cfg)) => {
                let n = shape.num_sets;
                (cfg.set_start + n - self.set_offset) % n
            },
            _ => 0,
        }
    }

    pub fn info(&self, kind: ProbeKind) -> Result<ProbeInfo> {
        match (self.shape, self.config) {
            (Some(shape), Some(config)) => Ok(ProbeInfo { kind, shape, config }),
            _ => Err(Error::ProbeNotAttached),
        }
    }

    /// Allocate the raw buffer and bind a (disabled) counter for `event`.
    ///
    /// Nothing is kept if this fails.
    pub fn attach(&mut self,
        shape: CacheShape,
        event: PmuEvent,
        counters: &mut dyn CounterSource,
        target: CounterTarget,
    ) -> Result<()>
    {
        if self.is_attached() {
            return Err(Error::ProbeAlreadyAttached);
        }
        shape.validate()?;

        let meas_cnt = shape.num_lines() + 1;
        let mut raw = Vec::new();
        raw.try_reserve_exact(meas_cnt)
            .map_err(|_| Error::OutOfMemory("probe raw buffer"))?;
        raw.resize(meas_cnt, 0);
        log::debug!("{:?} probe has {} raw counter slots", event, meas_cnt);

        let mut counter = counters.bind(event, target)?;
        counter.disable()?;

        self.raw = raw;
        self.counter = Some(counter);
        self.shape = Some(shape);
        self.config = None;
        self.activated = false;
        Ok(())
    }

    /// Record the address of the reference region, which determines the
    /// set offset. Must be called after the shape is known.
    pub fn set_reference(&mut self, addr: usize) {
        if let Some(shape) = self.shape {
            self.set_offset = shape.set_of(addr);
        }
    }

    /// Release the counter and the raw buffer.
    pub fn detach(&mut self) {
        if !self.is_attached() {
            return;
        }
        if self.activated {
            self.deactivate();
        }
        self.counter = None;
        self.raw = Vec::new();
        self.shape = None;
        self.config = None;
        self.set_offset = 0;
    }

    /// Validate and store a new configuration (`None` selects every set).
    pub fn configure(&mut self, cfg: Option<ProbeConfig>) -> Result<ProbeConfig> {
        let shape = self.shape.ok_or(Error::ProbeNotAttached)?;
        let cfg = cfg.unwrap_or(ProbeConfig::all_sets(&shape));
        cfg.validate(&shape)?;
        self.config = Some(cfg);
        Ok(cfg)
    }

    pub fn activate(&mut self) -> Result<()> {
        let counter = self.counter.as_mut().ok_or(Error::ProbeNotAttached)?;
        counter.enable()?;
        self.activated = true;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        if !self.activated {
            return;
        }
        if let Some(counter) = self.counter.as_mut() {
            match counter.read() {
                Ok(val) => log::debug!("final counter value {}", val),
                Err(e) => log::debug!("couldn't read final counter value: {}", e),
            }
            if let Err(e) = counter.disable() {
                log::warn!("couldn't disable counter: {}", e);
            }
        }
        self.activated = false;
    }

    /// Select this probe's hardware counter and read the baseline into
    /// raw slot 0. Returns false if the counter isn't on a PMC right now.
    ///
    /// Runs on the target core.
    #[inline(always)]
    pub fn select_counter(&mut self) -> bool {
        let idx = match self.counter.as_ref().and_then(|c| c.hw_index()) {
            Some(idx) => idx,
            None => {
                self.raw.iter_mut().for_each(|v| *v = 0);
                return false;
            },
        };
        arch::select_counter(idx);
        if let Some(v) = self.raw.first_mut() {
            *v = arch::read_counter();
        }
        true
    }

    /// Mutable access to the raw buffer.
    pub fn raw_mut(&mut self) -> &mut [u64] { &mut self.raw }

    /// Fold the raw counter values into one hit count per active set and
    /// write them into `out`. Returns the number of sets folded.
    ///
    /// A way counts as a hit for a set when the counter advanced while that
    /// line was being measured.
    pub fn fold(&self, out: &mut [u8]) -> usize {
        let (shape, nsets) = match self.shape {
            Some(shape) => (shape, self.active_sets()),
            None => return 0,
        };
        fold_hits(&self.raw, nsets, shape.associativity, out)
    }
}

/// See [`ProbeState::fold`].
pub fn fold_hits(raw: &[u64], nsets: usize, nways: usize, out: &mut [u8]) -> usize {
    let count = nsets.min(out.len());
    for (i, byte) in out.iter_mut().take(count).enumerate() {
        let mut cnt = 0u8;
        for j in 0..nways {
            let prev = raw[j * nsets + i];
            let val = raw[j * nsets + i + 1];
            if val > prev {
                cnt = cnt.saturating_add(1);
            }
        }
        *byte = cnt;
    }
    count
}

/// Interface shared by all probes.
pub trait Probe: Send {
    fn kind(&self) -> ProbeKind;
    fn state(&self) -> &ProbeState;
    fn state_mut(&mut self) -> &mut ProbeState;

    /// Attach to the target core with the given cache shape.
    fn attach(&mut self,
        shape: CacheShape,
        counters: &mut dyn CounterSource,
        target: CounterTarget,
    ) -> Result<()>;

    /// Release everything acquired by [`Probe::attach`].
    fn detach(&mut self);

    /// Select a new range of sets (`None` selects every set).
    fn configure(&mut self, cfg: Option<ProbeConfig>) -> Result<()>;

    /// Select the counter, take a baseline and measure every active line.
    ///
    /// Runs on the target core; must not allocate or block.
    fn measure(&mut self);

    /// Bring every active line back into the structure being probed.
    ///
    /// Runs on the target core; must not allocate or block.
    fn refill(&mut self);

    fn is_attached(&self) -> bool { self.state().is_attached() }
    fn is_activated(&self) -> bool { self.state().is_activated() }
    fn sample_size(&self) -> usize { self.state().sample_size() }
    fn info(&self) -> Result<ProbeInfo> { self.state().info(self.kind()) }
    fn activate(&mut self) -> Result<()> { self.state_mut().activate() }
    fn deactivate(&mut self) { self.state_mut().deactivate() }
}

/// One probe of each kind.
pub struct ProbeSet {
    probes: [Box<dyn Probe>; 3],
}
impl ProbeSet {
    pub fn new() -> Self {
        Self {
            probes: [
                Box::new(L1dProbe::new()),
                Box::new(L1iProbe::new()),
                Box::new(BtbProbe::new()),
            ],
        }
    }

    /// Build a set from existing probes; `probes[i]` must be of kind
    /// `ProbeKind::ALL[i]`.
    pub fn from_probes(probes: [Box<dyn Probe>; 3]) -> Result<Self> {
        if probes.iter().zip(ProbeKind::ALL).any(|(p, k)| p.kind() != k) {
            return Err(Error::BadArgument("probes must be in L1D, L1I, BTB order"));
        }
        Ok(Self { probes })
    }

    pub fn get(&self, kind: ProbeKind) -> &dyn Probe {
        self.probes[kind.index()].as_ref()
    }

    pub fn get_mut(&mut self, kind: ProbeKind) -> &mut dyn Probe {
        self.probes[kind.index()].as_mut()
    }

    /// Probes in sample order (L1D, L1I, BTB).
    pub fn iter(&self) -> impl Iterator<Item=&dyn Probe> {
        self.probes.iter().map(|p| p.as_ref())
    }

    /// Probes in sample order (L1D, L1I, BTB).
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item=&mut Box<dyn Probe>> {
        self.probes.iter_mut()
    }

    pub fn attached(&self) -> impl Iterator<Item=&dyn Probe> {
        self.iter().filter(|p| p.is_attached())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A probe that records what the collector does with it.

    use super::*;
    use std::sync::{ Arc, Mutex };

    /// Shared record of collector activity, across every [`FakeProbe`]
    /// that holds it.
    #[derive(Default, Debug)]
    pub struct Trace {
        pub events: Vec<(ProbeKind, &'static str)>,
    }

    pub struct FakeProbe {
        kind: ProbeKind,
        state: ProbeState,
        trace: Arc<Mutex<Trace>>,
        /// Ways that should look like misses, per set.
        pub pattern: Vec<u8>,
    }
    impl FakeProbe {
        pub fn new(kind: ProbeKind, trace: Arc<Mutex<Trace>>) -> Self {
            Self { kind, state: ProbeState::new(), trace, pattern: Vec::new() }
        }
        fn record(&self, what: &'static str) {
            self.trace.lock().unwrap().events.push((self.kind, what));
        }
    }
    impl Probe for FakeProbe {
        fn kind(&self) -> ProbeKind { self.kind }
        fn state(&self) -> &ProbeState { &self.state }
        fn state_mut(&mut self) -> &mut ProbeState { &mut self.state }
        fn attach(&mut self, shape: CacheShape, counters: &mut dyn CounterSource,
            target: CounterTarget) -> Result<()>
        {
            self.state.attach(shape, PmuEvent::L1dRefill, counters, target)
        }
        fn detach(&mut self) { self.state.detach() }
        fn configure(&mut self, cfg: Option<ProbeConfig>) -> Result<()> {
            self.state.configure(cfg).map(|_| ())
        }

        /// Fake a raw buffer where set `i` sees `pattern[i]` misses.
        fn measure(&mut self) {
            self.record("measure");
            let FakeProbe { state, pattern, .. } = self;
            let nsets = state.active_sets();
            let nways = state.shape().map(|s| s.associativity).unwrap_or(0);
            let raw = state.raw_mut();
            let mut ctr = 100;
            raw[0] = ctr;
            for j in 0..nways {
                for i in 0..nsets {
                    let misses = pattern.get(i).copied().unwrap_or(0) as usize;
                    if j < misses { ctr += 1; }
                    raw[j * nsets + i + 1] = ctr;
                }
            }
        }
        fn refill(&mut self) { self.record("refill"); }
    }
}
