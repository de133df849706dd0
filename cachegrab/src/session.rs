//! A session owns (at most) one scope, and the resources used to build it.

use crate::capture::{ self, CaptureConfig, CaptureOutput };
use crate::pmu::{ CounterSource, PerfCounterSource };
use crate::probe::{ ProbeInfo, ProbeKind, ProbeSet };
use crate::scope::{ SampleDescription, Scope, ScopeConfig };
use crate::shape::{ CacheShape, ProbeConfig };
use crate::status::{ Error, Result };
use crate::trigger::TriggerLine;
use crate::xcall::{ CrossCall, Inline, PinnedWorker };

/// How collections reach the target core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossCallMode {
    /// Run collections on the calling thread. Counters are bound to the
    /// thread that creates the scope, so every collection must be made
    /// from that thread; captures refuse this mode.
    Inline,
    /// Run collections on a worker thread pinned to the target core.
    Pinned,
}

/// Configuration used to build a [`Session`].
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub xcall: CrossCallMode,
    /// Back the trigger line with a file in `/dev/shm` so that other
    /// processes can raise it.
    pub shared_trigger: bool,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            xcall: CrossCallMode::Pinned,
            shared_trigger: true,
        }
    }

    pub fn xcall(mut self, x: CrossCallMode) -> Self {
        self.xcall = x;
        self
    }

    pub fn shared_trigger(mut self, x: bool) -> Self {
        self.shared_trigger = x;
        self
    }

    /// Create a [`Session`] that binds counters with `perf_event_open`.
    pub fn build(self) -> Session {
        self.build_with(Box::new(PerfCounterSource::new()))
    }

    /// Create a [`Session`] that binds counters with `counters`.
    pub fn build_with(self, counters: Box<dyn CounterSource>) -> Session {
        Session { cfg: self, counters, scope: None }
    }
}

pub struct Session {
    cfg: SessionConfig,
    counters: Box<dyn CounterSource>,
    scope: Option<Scope>,
}

impl Session {
    pub fn new() -> Self { SessionConfig::new().build() }

    pub fn config(&self) -> &SessionConfig { &self.cfg }

    pub fn scope(&self) -> Result<&Scope> {
        self.scope.as_ref().ok_or(Error::ScopeNotConnected)
    }

    pub fn scope_mut(&mut self) -> Result<&mut Scope> {
        self.scope.as_mut().ok_or(Error::ScopeNotConnected)
    }

    /// Create the scope. `scope_cpu` is the core that drives collection
    /// during a capture, and can't be the core being measured.
    pub fn create_scope(&mut self, target_cpu: usize, scope_cpu: usize) -> Result<()> {
        if self.scope.is_some() {
            log::info!("scope already created");
            return Err(Error::ScopeAlreadyExists);
        }
        if target_cpu == scope_cpu {
            return Err(Error::BadArgument("target and scope cpus must differ"));
        }

        let xcall: Box<dyn CrossCall> = match self.cfg.xcall {
            CrossCallMode::Inline => Box::new(Inline::new()),
            CrossCallMode::Pinned => Box::new(PinnedWorker::spawn(target_cpu)?),
        };
        let trigger = if self.cfg.shared_trigger {
            TriggerLine::shared_or_anonymous()?
        } else {
            TriggerLine::anonymous()?
        };
        self.scope = Some(Scope::from_parts(target_cpu, scope_cpu, xcall,
            trigger, ProbeSet::new()));
        log::info!("created scope (target cpu {}, scope cpu {})", target_cpu, scope_cpu);
        Ok(())
    }

    /// Destroy the scope (if there is one), releasing every probe.
    pub fn destroy_scope(&mut self) {
        if let Some(mut scope) = self.scope.take() {
            scope.teardown();
            log::info!("destroyed scope");
        }
    }

    pub fn get_scope_config(&self) -> ScopeConfig {
        match self.scope.as_ref() {
            Some(scope) => scope.get_config(),
            None => ScopeConfig::default(),
        }
    }

    pub fn attach_probe(&mut self, kind: ProbeKind, shape: CacheShape) -> Result<()> {
        let scope = self.scope.as_mut().ok_or(Error::ScopeNotConnected)?;
        scope.attach(kind, shape, self.counters.as_mut())
    }

    pub fn detach_probe(&mut self, kind: ProbeKind) -> Result<()> {
        self.scope_mut()?.detach(kind);
        Ok(())
    }

    pub fn configure_probe(&mut self, kind: ProbeKind, cfg: Option<ProbeConfig>) -> Result<()> {
        self.scope_mut()?.configure(kind, cfg)
    }

    pub fn get_probe_config(&self, kind: ProbeKind) -> Result<ProbeInfo> {
        self.scope()?.get_probe_config(kind)
    }

    pub fn activate(&mut self) -> Result<()> { self.scope_mut()?.activate() }

    pub fn deactivate(&mut self) -> Result<()> {
        self.scope_mut()?.deactivate();
        Ok(())
    }

    pub fn prepare(&mut self, max_samples: usize) -> Result<usize> {
        Ok(self.scope_mut()?.prepare(max_samples))
    }

    pub fn collect(&mut self, delay: u64, timeout: usize) -> Result<usize> {
        self.scope_mut()?.collect(delay, timeout)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scope_mut()?.flush();
        Ok(())
    }

    pub fn retrieve(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.scope_mut()?.retrieve(buf))
    }

    pub fn sample_desc(&self) -> Result<SampleDescription> {
        Ok(self.scope()?.describe())
    }

    pub fn sample_count(&self) -> Result<usize> {
        Ok(self.scope()?.sample_count())
    }

    /// Run one capture pass with the scope.
    pub fn capture(&mut self, cfg: &CaptureConfig) -> Result<CaptureOutput> {
        capture::run(self.scope_mut()?, cfg)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy_scope();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pmu::fake::FakeCounterSource;

    fn fake_session() -> (Session, FakeCounterSource) {
        let src = FakeCounterSource::default();
        let session = SessionConfig::new()
            .xcall(CrossCallMode::Inline)
            .shared_trigger(false)
            .build_with(Box::new(src.clone()));
        (session, src)
    }

    #[test]
    fn no_scope() {
        let (mut s, _) = fake_session();
        assert_eq!(s.get_scope_config(), ScopeConfig::default());
        assert!(!s.get_scope_config().created);
        assert_eq!(s.prepare(1), Err(Error::ScopeNotConnected));
        assert_eq!(s.flush(), Err(Error::ScopeNotConnected));
        assert_eq!(s.attach_probe(ProbeKind::L1d, CacheShape::new(64, 4, 64)),
            Err(Error::ScopeNotConnected));
        assert_eq!(s.sample_count(), Err(Error::ScopeNotConnected));
        s.destroy_scope();
    }

    #[test]
    fn create_once() {
        let (mut s, _) = fake_session();
        assert_eq!(s.create_scope(1, 1), Err(Error::BadArgument("target and scope cpus must differ")));
        s.create_scope(1, 0).unwrap();
        assert_eq!(s.create_scope(2, 0), Err(Error::ScopeAlreadyExists));
        let cfg = s.get_scope_config();
        assert_eq!(cfg.target_cpu, Some(1));
        assert_eq!(cfg.scope_cpu, Some(0));
        s.destroy_scope();
        s.create_scope(2, 0).unwrap();
    }

    #[test]
    fn destroy_releases_probes() {
        let (mut s, src) = fake_session();
        s.create_scope(1, 0).unwrap();
        s.attach_probe(ProbeKind::L1d, CacheShape::new(64, 8, 64)).unwrap();
        s.activate().unwrap();
        assert_eq!(src.live(), 1);
        assert_eq!(s.prepare(4), Ok(4));
        s.destroy_scope();
        assert_eq!(src.live(), 0);
        assert_eq!(s.sample_count(), Err(Error::ScopeNotConnected));
    }

    #[test]
    fn sample_desc_follows_config() {
        let (mut s, _) = fake_session();
        s.create_scope(1, 0).unwrap();
        s.attach_probe(ProbeKind::L1d, CacheShape::new(64, 8, 64)).unwrap();
        s.configure_probe(ProbeKind::L1d, Some(ProbeConfig::new(60, 4))).unwrap();
        let desc = s.sample_desc().unwrap();
        assert_eq!(desc.total_size, 8);
        assert_eq!(desc.l1d.size, 8);
        assert_eq!(s.get_probe_config(ProbeKind::L1i), Err(Error::ProbeNotAttached));
    }

    #[test]
    fn inline_sessions_cannot_capture() {
        let (mut s, _) = fake_session();
        s.create_scope(1, 0).unwrap();
        s.attach_probe(ProbeKind::L1d, CacheShape::new(64, 8, 64)).unwrap();
        let cfg = CaptureConfig::new("true", 4);
        assert_eq!(s.capture(&cfg).map(|o| o.result), Err(Error::BadArgument(
            "capture needs a cross-call worker pinned to the target cpu"
        )));
        assert_eq!(s.sample_count(), Ok(0));
    }
}
