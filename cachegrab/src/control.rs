//! The command set exposed to a control transport.
//!
//! Each logical action on a [`Session`] has a numeric command ID. A
//! transport decodes a [`Request`], hands it to [`Session::dispatch`], and
//! sends back the resulting [`Status`] and [`Reply`].

use num_enum::{ IntoPrimitive, TryFromPrimitive };

use crate::probe::{ ProbeInfo, ProbeKind };
use crate::scope::{ SampleDescription, ScopeConfig };
use crate::session::Session;
use crate::shape::{ CacheShape, ProbeConfig };
use crate::status::{ Error, Result, Status };

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(IntoPrimitive, TryFromPrimitive)]
pub enum CommandId {
    ProbeAttach       = 0x00,
    ProbeDetach       = 0x01,
    ProbeGetConfig    = 0x02,
    ProbeConfigure    = 0x03,
    ScopeGetConfig    = 0x10,
    ScopeCreate       = 0x11,
    ScopeDestroy      = 0x12,
    ScopeActivate     = 0x13,
    ScopeDeactivate   = 0x14,
    ScopePrepare      = 0x15,
    ScopeCollect      = 0x16,
    ScopeFlush        = 0x17,
    ScopeRetrieve     = 0x18,
    ScopeSampleDesc   = 0x19,
    ScopeSampleCount  = 0x1a,
}
impl CommandId {
    pub fn from_raw(id: u32) -> Result<Self> {
        Self::try_from(id).map_err(|_| Error::UnknownCommand(id))
    }
}

/// A command and its arguments.
///
/// Probe kinds are carried as raw numbers so that the transport doesn't
/// need to validate them.
#[derive(Debug)]
pub enum Request<'a> {
    ProbeAttach { kind: u32, shape: CacheShape },
    ProbeDetach { kind: u32 },
    ProbeGetConfig { kind: u32 },
    ProbeConfigure { kind: u32, config: ProbeConfig },
    ScopeGetConfig,
    ScopeCreate { target_cpu: usize, scope_cpu: usize },
    ScopeDestroy,
    ScopeActivate,
    ScopeDeactivate,
    ScopePrepare { max_samples: u64 },
    ScopeCollect { delay: u64, timeout: u64 },
    ScopeFlush,
    /// `len` is the buffer length claimed by the client; it must not be
    /// larger than `buf`.
    ScopeRetrieve { buf: &'a mut [u8], len: usize },
    ScopeSampleDesc,
    ScopeSampleCount,
}
impl Request<'_> {
    pub fn id(&self) -> CommandId {
        match self {
            Self::ProbeAttach { .. } => CommandId::ProbeAttach,
            Self::ProbeDetach { .. } => CommandId::ProbeDetach,
            Self::ProbeGetConfig { .. } => CommandId::ProbeGetConfig,
            Self::ProbeConfigure { .. } => CommandId::ProbeConfigure,
            Self::ScopeGetConfig => CommandId::ScopeGetConfig,
            Self::ScopeCreate { .. } => CommandId::ScopeCreate,
            Self::ScopeDestroy => CommandId::ScopeDestroy,
            Self::ScopeActivate => CommandId::ScopeActivate,
            Self::ScopeDeactivate => CommandId::ScopeDeactivate,
            Self::ScopePrepare { .. } => CommandId::ScopePrepare,
            Self::ScopeCollect { .. } => CommandId::ScopeCollect,
            Self::ScopeFlush => CommandId::ScopeFlush,
            Self::ScopeRetrieve { .. } => CommandId::ScopeRetrieve,
            Self::ScopeSampleDesc => CommandId::ScopeSampleDesc,
            Self::ScopeSampleCount => CommandId::ScopeSampleCount,
        }
    }
}

/// The data returned with a status code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    None,
    ProbeConfig(ProbeInfo),
    ScopeConfig(ScopeConfig),
    /// Samples prepared, collected, or waiting to be retrieved.
    Count(usize),
    /// Bytes written by a retrieve.
    Retrieved(usize),
    SampleDesc(SampleDescription),
}

/// Largest number of samples a single prepare request may ask for.
pub const MAX_PREPARE: u64 = i32::MAX as u64;

fn probe_kind(raw: u32) -> Result<ProbeKind> {
    ProbeKind::try_from(raw).map_err(|_| Error::BadArgument("unknown probe type"))
}

impl Session {
    /// Carry out a request.
    pub fn dispatch(&mut self, req: Request<'_>) -> (Status, Reply) {
        let id = req.id();
        match self.handle(req) {
            Ok(reply) => (Status::Ok, reply),
            Err(e) => {
                log::debug!("{:?} failed: {}", id, e);
                (e.status(), Reply::None)
            },
        }
    }

    /// Carry out a request that arrived with a numeric command ID.
    pub fn dispatch_raw(&mut self, id: u32, req: Request<'_>) -> (Status, Reply) {
        match CommandId::from_raw(id) {
            Ok(id) if id == req.id() => self.dispatch(req),
            Ok(_) => (Status::BadArgument, Reply::None),
            Err(e) => (e.status(), Reply::None),
        }
    }

    fn handle(&mut self, req: Request<'_>) -> Result<Reply> {
        let reply = match req {
            Request::ProbeAttach { kind, shape } => {
                self.attach_probe(probe_kind(kind)?, shape)?;
                Reply::None
            },
            Request::ProbeDetach { kind } => {
                self.detach_probe(probe_kind(kind)?)?;
                Reply::None
            },
            Request::ProbeGetConfig { kind } => {
                Reply::ProbeConfig(self.get_probe_config(probe_kind(kind)?)?)
            },
            Request::ProbeConfigure { kind, config } => {
                self.configure_probe(probe_kind(kind)?, Some(config))?;
                Reply::None
            },
            Request::ScopeGetConfig => Reply::ScopeConfig(self.get_scope_config()),
            Request::ScopeCreate { target_cpu, scope_cpu } => {
                self.create_scope(target_cpu, scope_cpu)?;
                Reply::None
            },
            Request::ScopeDestroy => {
                self.destroy_scope();
                Reply::None
            },
            Request::ScopeActivate => {
                self.activate()?;
                Reply::None
            },
            Request::ScopeDeactivate => {
                self.deactivate()?;
                Reply::None
            },
            Request::ScopePrepare { max_samples } => {
                let n = max_samples.min(MAX_PREPARE) as usize;
                Reply::Count(self.prepare(n)?)
            },
            Request::ScopeCollect { delay, timeout } => {
                let timeout = usize::try_from(timeout).unwrap_or(usize::MAX);
                Reply::Count(self.collect(delay, timeout)?)
            },
            Request::ScopeFlush => {
                self.flush()?;
                Reply::None
            },
            Request::ScopeRetrieve { buf, len } => {
                let buf = buf.get_mut(..len)
                    .ok_or(Error::PermissionOrCopyFailure("retrieve buffer is too small"))?;
                Reply::Retrieved(self.retrieve(buf)?)
            },
            Request::ScopeSampleDesc => Reply::SampleDesc(self.sample_desc()?),
            Request::ScopeSampleCount => Reply::Count(self.sample_count()?),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pmu::fake::FakeCounterSource;
    use crate::session::{ CrossCallMode, SessionConfig };

    fn session() -> Session {
        SessionConfig::new()
            .xcall(CrossCallMode::Inline)
            .shared_trigger(false)
            .build_with(Box::new(FakeCounterSource::default()))
    }

    #[test]
    fn command_numbers() {
        assert_eq!(u32::from(CommandId::ProbeConfigure), 0x03);
        assert_eq!(u32::from(CommandId::ScopeGetConfig), 0x10);
        assert_eq!(u32::from(CommandId::ScopeSampleCount), 0x1a);
        assert_eq!(CommandId::from_raw(0x04), Err(Error::UnknownCommand(0x04)));
        assert_eq!(CommandId::from_raw(0x18), Ok(CommandId::ScopeRetrieve));
    }

    #[test]
    fn unknown_command() {
        let mut s = session();
        let (status, reply) = s.dispatch_raw(0x42, Request::ScopeFlush);
        assert_eq!(status, Status::UnknownCommand);
        assert_eq!(reply, Reply::None);
        let (status, _) = s.dispatch_raw(0x16, Request::ScopeFlush);
        assert_eq!(status, Status::BadArgument);
    }

    #[test]
    fn scope_commands_need_a_scope() {
        let mut s = session();
        for req in [
            Request::ScopeActivate,
            Request::ScopeDeactivate,
            Request::ScopeFlush,
            Request::ScopeSampleDesc,
            Request::ScopeSampleCount,
            Request::ScopePrepare { max_samples: 1 },
            Request::ScopeCollect { delay: 0, timeout: 1 },
            Request::ProbeDetach { kind: 1 },
        ] {
            assert_eq!(s.dispatch(req).0, Status::ScopeNotConnected);
        }
        let (status, reply) = s.dispatch(Request::ScopeGetConfig);
        assert_eq!(status, Status::Ok);
        assert_eq!(reply, Reply::ScopeConfig(ScopeConfig::default()));
    }

    #[test]
    fn create_twice() {
        let mut s = session();
        let create = || Request::ScopeCreate { target_cpu: 1, scope_cpu: 0 };
        assert_eq!(s.dispatch(create()).0, Status::Ok);
        assert_eq!(s.dispatch(create()).0, Status::ScopeAlreadyExists);
        assert_eq!(s.dispatch(Request::ScopeDestroy).0, Status::Ok);
        assert_eq!(s.dispatch(create()).0, Status::Ok);

        let same = Request::ScopeCreate { target_cpu: 2, scope_cpu: 2 };
        s.dispatch(Request::ScopeDestroy);
        assert_eq!(s.dispatch(same).0, Status::BadArgument);
    }

    #[test]
    fn probe_commands() {
        let mut s = session();
        s.dispatch(Request::ScopeCreate { target_cpu: 1, scope_cpu: 0 });

        let shape = CacheShape::new(64, 4, 64);
        let bad = Request::ProbeAttach { kind: 7, shape };
        assert_eq!(s.dispatch(bad).0, Status::BadArgument);
        let (status, _) = s.dispatch(Request::ProbeGetConfig { kind: 1 });
        assert_eq!(status, Status::ProbeNotAttached);

        assert_eq!(s.dispatch(Request::ProbeAttach { kind: 1, shape }).0, Status::Ok);
        assert_eq!(s.dispatch(Request::ProbeAttach { kind: 1, shape }).0,
            Status::ProbeAlreadyAttached);

        let config = ProbeConfig::new(4, 12);
        assert_eq!(s.dispatch(Request::ProbeConfigure { kind: 1, config }).0, Status::Ok);
        let (status, reply) = s.dispatch(Request::ProbeGetConfig { kind: 1 });
        assert_eq!(status, Status::Ok);
        assert_eq!(reply, Reply::ProbeConfig(ProbeInfo {
            kind: ProbeKind::L1d, shape, config
        }));

        let config = ProbeConfig::new(4, 4);
        assert_eq!(s.dispatch(Request::ProbeConfigure { kind: 1, config }).0,
            Status::BadArgument);

        let (_, reply) = s.dispatch(Request::ScopeSampleDesc);
        match reply {
            Reply::SampleDesc(desc) => assert_eq!(desc.total_size, 8),
            r => panic!("unexpected reply {:?}", r),
        }

        assert_eq!(s.dispatch(Request::ProbeDetach { kind: 1 }).0, Status::Ok);
        let (_, reply) = s.dispatch(Request::ScopeGetConfig);
        match reply {
            Reply::ScopeConfig(cfg) => assert!(cfg.created && !cfg.l1d_attached),
            r => panic!("unexpected reply {:?}", r),
        }
    }

    #[test]
    fn oversized_shape_is_rejected() {
        let mut s = session();
        s.dispatch(Request::ScopeCreate { target_cpu: 1, scope_cpu: 0 });
        let shape = CacheShape::new(1 << 33, 1 << 31, 64);
        for kind in [1, 2, 3] {
            let (status, reply) = s.dispatch(Request::ProbeAttach { kind, shape });
            assert_eq!((status, reply), (Status::BadArgument, Reply::None));
        }
        let (_, reply) = s.dispatch(Request::ScopeGetConfig);
        match reply {
            Reply::ScopeConfig(cfg) => {
                assert!(!cfg.l1d_attached && !cfg.l1i_attached && !cfg.btb_attached)
            },
            r => panic!("unexpected reply {:?}", r),
        }
    }

    #[test]
    fn prepare_collect_retrieve() {
        let mut s = session();
        s.dispatch(Request::ScopeCreate { target_cpu: 1, scope_cpu: 0 });
        let shape = CacheShape::new(16, 2, 64);
        s.dispatch(Request::ProbeAttach { kind: 1, shape });

        let (status, reply) = s.dispatch(Request::ScopePrepare { max_samples: 3 });
        assert_eq!((status, reply), (Status::Ok, Reply::Count(3)));

        // Not activated, so the trigger is low and nothing is collected.
        let (status, reply) = s.dispatch(Request::ScopeCollect { delay: 0, timeout: 2 });
        assert_eq!((status, reply), (Status::Ok, Reply::Count(0)));
        assert_eq!(s.dispatch(Request::ScopeSampleCount).1, Reply::Count(0));

        let mut buf = vec![0u8; 16];
        let req = Request::ScopeRetrieve { buf: &mut buf, len: 32 };
        assert_eq!(s.dispatch(req).0, Status::PermissionOrCopyFailure);
        let req = Request::ScopeRetrieve { buf: &mut buf, len: 16 };
        assert_eq!(s.dispatch(req), (Status::Ok, Reply::Retrieved(0)));

        assert_eq!(s.dispatch(Request::ScopeFlush).0, Status::Ok);
    }
}
