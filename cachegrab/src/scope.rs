//! The scope: a set of probes on one target core, and the samples they
//! produce.
//!
//! Samples move through two queues. [`Scope::prepare`] allocates records
//! into the prepared queue; [`Scope::collect`] fills them on the target core
//! and moves them to the collected queue; [`Scope::retrieve`] copies them
//! out and frees them.

pub mod sample;

pub use sample::{ Field, Sample, SampleDescription };

use std::collections::VecDeque;

use crate::collector;
use crate::pmu::{ CounterSource, CounterTarget };
use crate::probe::{ Probe, ProbeInfo, ProbeKind, ProbeSet };
use crate::shape::{ CacheShape, ProbeConfig };
use crate::status::{ Error, Result };
use crate::trigger::TriggerLine;
use crate::util::spin_ns;
use crate::xcall::CrossCall;

/// A summary of the scope, as reported to clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    pub created: bool,
    pub target_cpu: Option<usize>,
    pub scope_cpu: Option<usize>,
    pub l1d_attached: bool,
    pub l1i_attached: bool,
    pub btb_attached: bool,
}

pub struct Scope {
    /// The core being measured.
    target_cpu: usize,
    /// The core that drives collection during a capture.
    scope_cpu: usize,
    probes: ProbeSet,
    prepared: VecDeque<Sample>,
    collected: VecDeque<Sample>,
    /// Collection only happens while this is raised.
    trigger: TriggerLine,
    xcall: Box<dyn CrossCall>,
}

impl Scope {
    pub fn from_parts(target_cpu: usize,
        scope_cpu: usize,
        xcall: Box<dyn CrossCall>,
        trigger: TriggerLine,
        probes: ProbeSet,
    ) -> Self
    {
        Self {
            target_cpu,
            scope_cpu,
            probes,
            prepared: VecDeque::new(),
            collected: VecDeque::new(),
            trigger,
            xcall,
        }
    }

    pub fn target_cpu(&self) -> usize { self.target_cpu }
    pub fn scope_cpu(&self) -> usize { self.scope_cpu }
    pub fn trigger(&self) -> &TriggerLine { &self.trigger }
    pub fn probes(&self) -> &ProbeSet { &self.probes }

    /// The core collections run on, if they run on a dedicated thread.
    pub fn collection_cpu(&self) -> Option<usize> { self.xcall.target_cpu() }

    pub fn get_config(&self) -> ScopeConfig {
        ScopeConfig {
            created: true,
            target_cpu: Some(self.target_cpu),
            scope_cpu: Some(self.scope_cpu),
            l1d_attached: self.probes.get(ProbeKind::L1d).is_attached(),
            l1i_attached: self.probes.get(ProbeKind::L1i).is_attached(),
            btb_attached: self.probes.get(ProbeKind::Btb).is_attached(),
        }
    }
}

/// Probe management.
impl Scope {
    /// Attach a probe to the target core and select every set.
    pub fn attach(&mut self,
        kind: ProbeKind,
        shape: CacheShape,
        counters: &mut dyn CounterSource,
    ) -> Result<()>
    {
        let target = CounterTarget {
            cpu: self.target_cpu,
            tid: self.xcall.target_tid(),
        };
        let probe = self.probes.get_mut(kind);
        if let Err(e) = probe.attach(shape, counters, target) {
            log::info!("couldn't attach {} probe to cpu {}: {}",
                kind, self.target_cpu, e);
            return Err(e);
        }
        if let Err(e) = probe.configure(None) {
            log::warn!("{} probe attached, but the default configuration \
                failed: {}", kind, e);
            probe.detach();
            return Err(e);
        }
        log::info!("attached {} probe to cpu {} ({:?})", kind, self.target_cpu, shape);
        Ok(())
    }

    /// Detach a probe. Detaching a detached probe does nothing.
    pub fn detach(&mut self, kind: ProbeKind) {
        let probe = self.probes.get_mut(kind);
        if probe.is_attached() {
            probe.detach();
            log::info!("detached {} probe", kind);
        }
    }

    /// Select a range of sets for a probe (`None` selects every set).
    pub fn configure(&mut self, kind: ProbeKind, cfg: Option<ProbeConfig>) -> Result<()> {
        let probe = self.probes.get_mut(kind);
        if !probe.is_attached() {
            return Err(Error::ProbeNotAttached);
        }
        match probe.configure(cfg) {
            Ok(()) => {
                log::debug!("configured {} probe: {:?}", kind, probe.info()?.config);
                Ok(())
            },
            Err(e) => {
                log::warn!("{} probe configuration failed: {}", kind, e);
                Err(e)
            },
        }
    }

    pub fn get_probe_config(&self, kind: ProbeKind) -> Result<ProbeInfo> {
        self.probes.get(kind).info()
    }

    /// Enable the counters of every attached probe and raise the trigger.
    pub fn activate(&mut self) -> Result<()> {
        self.arm()?;
        self.trigger.raise();
        Ok(())
    }

    /// Enable the counters of every attached probe, leaving the trigger
    /// line as it is.
    pub fn arm(&mut self) -> Result<()> {
        log::debug!("activating scope on cpu {}", self.target_cpu);
        let res = self.probes.iter_mut()
            .filter(|p| p.is_attached())
            .try_for_each(|p| {
                p.activate().map_err(|e| {
                    log::warn!("couldn't activate {} probe: {}", p.kind(), e);
                    e
                })
            });
        if res.is_err() {
            self.deactivate();
        }
        res
    }

    /// Lower the trigger and disable every counter.
    pub fn deactivate(&mut self) {
        log::debug!("deactivating scope on cpu {}", self.target_cpu);
        self.trigger.lower();
        for p in self.probes.iter_mut().filter(|p| p.is_attached()) {
            p.deactivate();
        }
    }
}

/// Samples.
impl Scope {
    /// Where each probe's data lives in a sample.
    pub fn describe(&self) -> SampleDescription {
        let mut desc = SampleDescription::default();
        let mut offs = 0;
        for p in self.probes.attached() {
            let size = p.sample_size();
            *desc.field_mut(p.kind()) = Field { offs, size };
            offs += size;
        }
        desc.total_size = offs;
        desc
    }

    /// Number of collected samples waiting to be retrieved.
    pub fn sample_count(&self) -> usize { self.collected.len() }

    /// Number of samples waiting to be collected.
    pub fn prepared_count(&self) -> usize { self.prepared.len() }

    /// Drop every sample, collected or not.
    pub fn flush(&mut self) {
        log::debug!("flushing {} prepared and {} collected samples",
            self.prepared.len(), self.collected.len());
        self.prepared = VecDeque::new();
        self.collected = VecDeque::new();
    }

    /// Discard all samples and allocate up to `max_samples` new ones.
    /// Returns the number allocated, which is smaller than requested if
    /// memory ran out.
    pub fn prepare(&mut self, max_samples: usize) -> usize {
        self.flush();
        let size = self.describe().total_size;

        let mut cnt = 0;
        while cnt < max_samples {
            if self.prepared.try_reserve(1).is_err() {
                break;
            }
            match Sample::try_new(size) {
                Ok(s) => self.prepared.push_back(s),
                Err(_) => break,
            }
            cnt += 1;
        }

        // Collection moves samples without reallocating.
        while self.collected.try_reserve_exact(cnt).is_err() && cnt > 0 {
            self.prepared.pop_back();
            cnt -= 1;
        }
        log::debug!("prepared {} samples of {} bytes", cnt, size);
        cnt
    }

    /// Collect samples on the target core.
    ///
    /// First waits for the head sample to collect, making at most `timeout`
    /// attempts `delay` nanoseconds apart. Then collects prepared samples
    /// in order until one fails to collect (the trigger went low) or the
    /// queue runs out. Returns the number of samples collected.
    pub fn collect(&mut self, delay: u64, timeout: usize) -> Result<usize> {
        let Scope { probes, prepared, collected, trigger, xcall, .. } = self;
        let mut timeout = timeout;

        let head = match prepared.front_mut() {
            Some(head) => head,
            None => return Ok(0),
        };
        while !head.collected {
            if timeout == 0 {
                log::debug!("timed out waiting for the trigger");
                return Ok(0);
            }
            timeout -= 1;
            xcall.call(&mut || collector::collect(probes, head, trigger))?;
            spin_ns(delay);
        }

        let mut cnt = 0;
        while let Some(samp) = prepared.front_mut() {
            xcall.call(&mut || collector::collect(probes, samp, trigger))?;
            if !samp.collected {
                break;
            }
            if let Some(samp) = prepared.pop_front() {
                collected.push_back(samp);
            }
            cnt += 1;
            spin_ns(delay);
        }
        log::debug!("collected {} samples", cnt);
        Ok(cnt)
    }

    /// Move whole collected samples (oldest first) into `buf` while they
    /// fit. Returns the number of bytes written.
    pub fn retrieve(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while let Some(samp) = self.collected.front() {
            let len = samp.len();
            let dst = match buf.get_mut(written..written + len) {
                Some(dst) => dst,
                None => break,
            };
            dst.copy_from_slice(&samp.data);
            written += len;
            self.collected.pop_front();
        }
        log::trace!("retrieved {} bytes ({} samples left)", written, self.collected.len());
        written
    }

    /// Flush samples, deactivate and detach every probe.
    pub fn teardown(&mut self) {
        self.flush();
        self.deactivate();
        for kind in ProbeKind::ALL {
            self.detach(kind);
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{ Arc, Mutex };
    use crate::pmu::fake::FakeCounterSource;
    use crate::probe::fake::{ FakeProbe, Trace };
    use crate::xcall::{ Inline, Job };

    /// Runs jobs inline, lowering the trigger once it has run `budget` jobs.
    struct Limited {
        trigger: TriggerLine,
        budget: usize,
        calls: Arc<Mutex<usize>>,
    }
    impl CrossCall for Limited {
        fn call(&mut self, job: &mut Job<'_>) -> Result<()> {
            if self.budget == 0 {
                self.trigger.lower();
            } else {
                self.budget -= 1;
            }
            *self.calls.lock().unwrap() += 1;
            job();
            Ok(())
        }
        fn target_tid(&self) -> i32 { 0 }
        fn target_cpu(&self) -> Option<usize> { None }
    }

    fn fake_probes(trace: &Arc<Mutex<Trace>>) -> ProbeSet {
        ProbeSet::from_probes([
            Box::new(FakeProbe::new(ProbeKind::L1d, trace.clone())),
            Box::new(FakeProbe::new(ProbeKind::L1i, trace.clone())),
            Box::new(FakeProbe::new(ProbeKind::Btb, trace.clone())),
        ]).unwrap()
    }

    fn fake_scope(xcall: Box<dyn CrossCall>, trigger: TriggerLine) -> (Scope, Arc<Mutex<Trace>>) {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let scope = Scope::from_parts(2, 3, xcall, trigger, fake_probes(&trace));
        (scope, trace)
    }

    /// A scope with L1D (8 sets) and BTB (16 sets) probes attached.
    fn two_probe_scope(xcall: Box<dyn CrossCall>, trigger: TriggerLine)
        -> (Scope, Arc<Mutex<Trace>>)
    {
        let (mut scope, trace) = fake_scope(xcall, trigger);
        let mut src = FakeCounterSource::default();
        scope.attach(ProbeKind::L1d, CacheShape::new(8, 4, 64), &mut src).unwrap();
        scope.attach(ProbeKind::Btb, CacheShape::new(16, 2, 16), &mut src).unwrap();
        (scope, trace)
    }

    #[test]
    fn attach_applies_default_config() {
        let (mut scope, _) = fake_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        let mut src = FakeCounterSource::default();
        let shape = CacheShape::new(64, 4, 64);
        scope.attach(ProbeKind::L1i, shape, &mut src).unwrap();
        let info = scope.get_probe_config(ProbeKind::L1i).unwrap();
        assert_eq!(info.config, ProbeConfig::new(0, 64));
        assert_eq!(info.shape, shape);

        assert_eq!(scope.attach(ProbeKind::L1i, CacheShape::new(32, 4, 64), &mut src),
            Err(Error::ProbeAlreadyAttached));
        assert_eq!(scope.get_probe_config(ProbeKind::L1i).unwrap().shape, shape);

        let cfg = scope.get_config();
        assert!(cfg.created && cfg.l1i_attached);
        assert!(!cfg.l1d_attached && !cfg.btb_attached);
        assert_eq!((cfg.target_cpu, cfg.scope_cpu), (Some(2), Some(3)));
    }

    #[test]
    fn configure_requires_attach() {
        let (mut scope, _) = fake_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        assert_eq!(scope.configure(ProbeKind::Btb, None), Err(Error::ProbeNotAttached));
        assert_eq!(scope.get_probe_config(ProbeKind::Btb), Err(Error::ProbeNotAttached));
        // Detaching a detached probe is fine.
        scope.detach(ProbeKind::Btb);
    }

    #[test]
    fn bad_config_is_rejected() {
        let (mut scope, _) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        let res = scope.configure(ProbeKind::L1d, Some(ProbeConfig::new(3, 3)));
        assert_eq!(res.map_err(|e| e.status()), Err(crate::Status::BadArgument));
        assert_eq!(scope.get_probe_config(ProbeKind::L1d).unwrap().config,
            ProbeConfig::new(0, 8));
    }

    #[test]
    fn sample_layout() {
        let (mut scope, _) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        let desc = scope.describe();
        assert_eq!(desc.l1d, Field { offs: 0, size: 8 });
        assert_eq!(desc.l1i, Field::default());
        assert_eq!(desc.btb, Field { offs: 8, size: 16 });
        assert_eq!(desc.total_size, 24);

        scope.configure(ProbeKind::L1d, Some(ProbeConfig::new(6, 2))).unwrap();
        let desc = scope.describe();
        assert_eq!(desc.l1d.size, 4);
        assert_eq!(desc.btb, Field { offs: 4, size: 16 });
        assert_eq!(desc.total_size, 20);
    }

    #[test]
    fn prepare_then_flush() {
        let (mut scope, _) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        assert_eq!(scope.prepare(10), 10);
        assert_eq!(scope.prepared_count(), 10);
        scope.flush();
        assert_eq!(scope.sample_count(), 0);
        assert_eq!(scope.prepared_count(), 0);
    }

    #[test]
    fn collect_everything() {
        let (mut scope, trace) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        assert_eq!(scope.prepare(5), 5);
        scope.activate().unwrap();
        assert_eq!(scope.collect(0, 10).unwrap(), 5);
        assert_eq!(scope.sample_count(), 5);
        assert_eq!(scope.prepared_count(), 0);

        // The head sample is measured twice.
        let measures = trace.lock().unwrap().events.iter()
            .filter(|e| e == &&(ProbeKind::L1d, "measure"))
            .count();
        assert_eq!(measures, 6);

        let mut buf = vec![0u8; 1024];
        assert_eq!(scope.retrieve(&mut buf), 5 * 24);
        assert_eq!(scope.sample_count(), 0);
    }

    #[test]
    fn collect_stops_when_trigger_drops() {
        let trigger = TriggerLine::anonymous().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let xcall = Limited { trigger: trigger.clone(), budget: 4, calls: calls.clone() };
        let (mut scope, _) = two_probe_scope(Box::new(xcall), trigger);
        assert_eq!(scope.prepare(5), 5);
        scope.activate().unwrap();

        let k = scope.collect(0, 10).unwrap();
        assert_eq!(k, 3);
        assert_eq!(*calls.lock().unwrap(), 5);
        assert_eq!(scope.sample_count(), 3);
        assert_eq!(scope.prepared_count(), 2);

        let mut buf = vec![0u8; 4096];
        assert_eq!(scope.retrieve(&mut buf), k * scope.describe().total_size);
        assert_eq!(scope.sample_count(), 0);
    }

    #[test]
    fn collect_times_out() {
        let trigger = TriggerLine::anonymous().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let xcall = Limited { trigger: trigger.clone(), budget: 0, calls: calls.clone() };
        let (mut scope, trace) = two_probe_scope(Box::new(xcall), trigger);
        assert_eq!(scope.prepare(2), 2);
        scope.arm().unwrap();
        assert_eq!(scope.collect(10, 3).unwrap(), 0);
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(scope.prepared_count(), 2);
        assert!(trace.lock().unwrap().events.is_empty());

        // Nothing prepared, nothing to do.
        scope.flush();
        assert_eq!(scope.collect(0, 3).unwrap(), 0);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[test]
    fn retrieve_whole_samples_only() {
        let (mut scope, _) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        scope.prepare(3);
        scope.activate().unwrap();
        assert_eq!(scope.collect(0, 1).unwrap(), 3);

        let mut small = vec![0u8; 23];
        assert_eq!(scope.retrieve(&mut small), 0);
        assert_eq!(scope.sample_count(), 3);

        let mut buf = vec![0u8; 24 * 2 + 5];
        assert_eq!(scope.retrieve(&mut buf), 48);
        assert_eq!(scope.sample_count(), 1);
    }

    #[test]
    fn deactivate_lowers_trigger() {
        let (mut scope, _) = two_probe_scope(Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap());
        scope.arm().unwrap();
        assert!(!scope.trigger().is_raised());
        assert!(scope.probes().get(ProbeKind::Btb).is_activated());
        scope.activate().unwrap();
        assert!(scope.trigger().is_raised());
        scope.deactivate();
        assert!(!scope.trigger().is_raised());
        assert!(!scope.probes().get(ProbeKind::L1d).is_activated());
    }

    #[test]
    fn teardown_detaches_everything() {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let mut scope = Scope::from_parts(0, 1, Box::new(Inline::new()),
            TriggerLine::anonymous().unwrap(), fake_probes(&trace));
        let mut src = FakeCounterSource::default();
        scope.attach(ProbeKind::L1d, CacheShape::new(8, 4, 64), &mut src).unwrap();
        scope.activate().unwrap();
        scope.prepare(4);
        scope.teardown();
        assert_eq!(src.live(), 0);
        assert_eq!(scope.prepared_count(), 0);
        assert_eq!(scope.probes().attached().count(), 0);
    }
}
