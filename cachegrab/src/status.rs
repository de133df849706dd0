//! Status codes and errors.
//!
//! Every fallible operation in this crate reports one of the [`Status`]
//! codes. The numeric values are what a control transport puts on the wire,
//! so the order here matters.

use num_enum::{ IntoPrimitive, TryFromPrimitive };

/// Flat status taxonomy shared by every layer.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(IntoPrimitive, TryFromPrimitive)]
pub enum Status {
    Ok = 0,
    BadArgument,
    PermissionOrCopyFailure,
    ScopeAlreadyExists,
    ScopeNotConnected,
    ProbeAlreadyAttached,
    ProbeNotAttached,
    OutOfMemory,
    UnknownCommand,
    InternalError,
    CaptureSetupError,
}
impl Status {
    pub fn is_ok(&self) -> bool { matches!(self, Self::Ok) }
}
impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::BadArgument => "bad argument",
            Self::PermissionOrCopyFailure => "permission or copy failure",
            Self::ScopeAlreadyExists => "scope already exists",
            Self::ScopeNotConnected => "scope not connected",
            Self::ProbeAlreadyAttached => "probe already attached",
            Self::ProbeNotAttached => "probe not attached",
            Self::OutOfMemory => "out of memory",
            Self::UnknownCommand => "unknown command",
            Self::InternalError => "internal error",
            Self::CaptureSetupError => "capture setup error",
        };
        write!(f, "{}", s)
    }
}

/// An error carrying one of the non-OK [`Status`] codes along with a short
/// description of what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    #[error("permission or copy failure: {0}")]
    PermissionOrCopyFailure(&'static str),

    #[error("a scope already exists")]
    ScopeAlreadyExists,

    #[error("no scope has been created")]
    ScopeNotConnected,

    #[error("probe is already attached")]
    ProbeAlreadyAttached,

    #[error("probe is not attached")]
    ProbeNotAttached,

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("unknown command {0:#04x}")]
    UnknownCommand(u32),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("capture setup failed: {0}")]
    CaptureSetup(String),
}

impl Error {
    /// The status code reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::BadArgument(_) => Status::BadArgument,
            Self::PermissionOrCopyFailure(_) => Status::PermissionOrCopyFailure,
            Self::ScopeAlreadyExists => Status::ScopeAlreadyExists,
            Self::ScopeNotConnected => Status::ScopeNotConnected,
            Self::ProbeAlreadyAttached => Status::ProbeAlreadyAttached,
            Self::ProbeNotAttached => Status::ProbeNotAttached,
            Self::OutOfMemory(_) => Status::OutOfMemory,
            Self::UnknownCommand(_) => Status::UnknownCommand,
            Self::Internal(_) => Status::InternalError,
            Self::CaptureSetup(_) => Status::CaptureSetupError,
        }
    }

    pub(crate) fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        match e {
            nix::errno::Errno::ENOMEM => Self::OutOfMemory("kernel refused allocation"),
            nix::errno::Errno::EPERM |
            nix::errno::Errno::EACCES => {
                Self::PermissionOrCopyFailure("operation not permitted")
            },
            e => Self::Internal(format!("{} ({})", e.desc(), e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collapse a [`Result`] into the status code reported to a caller.
pub fn status_of<T>(res: &Result<T>) -> Status {
    match res {
        Ok(_) => Status::Ok,
        Err(e) => e.status(),
    }
}
