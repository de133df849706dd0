//! Prime+Probe measurements of the L1 data cache, L1 instruction cache and
//! branch target buffer on ARMv8 cores.
//!
//! A [`Session`] owns a [`Scope`] bound to a target core. Probes attached
//! to the scope read PMU refill/mispredict counters directly from EL0 while
//! walking each cache set, and a [`collector`] folds those readings into
//! one byte of hit counts per set. [`capture::run`] drives a victim process
//! on the target core and gathers samples while it runs.

pub mod status;
pub mod shape;
pub mod arch;
pub mod asm;
pub mod util;
pub mod pmu;
pub mod probe;
pub mod trigger;
pub mod xcall;
pub mod collector;
pub mod scope;
pub mod session;
pub mod control;
pub mod capture;

pub use dynasmrt::{
    dynasm,
    DynasmApi,
    VecAssembler,
    aarch64::Aarch64Relocation,
};

pub use crate::status::{ Error, Result, Status, status_of };
pub use crate::shape::{ CacheShape, ProbeConfig };
pub use crate::probe::{ Probe, ProbeInfo, ProbeKind, ProbeSet };
pub use crate::scope::{ Sample, SampleDescription, Scope, ScopeConfig };
pub use crate::session::{ CrossCallMode, Session, SessionConfig };
pub use crate::control::{ CommandId, Reply, Request };
pub use crate::capture::{ CaptureConfig, CaptureData, CaptureOutput, TriggerMode };
pub use crate::util::GrabEnv;
