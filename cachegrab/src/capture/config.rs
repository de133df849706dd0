//! Capture configuration.

use std::path::PathBuf;

use crate::status::{ Error, Result };

/// Who moves the trigger line during a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum TriggerMode {
    /// A shim inside the victim raises and lowers the line.
    Shim,
    /// The line is raised for the whole lifetime of the victim process.
    Process,
}

/// Configuration passed to [`crate::capture::run`].
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Number of samples to prepare.
    pub max_samples: usize,

    /// Number of iterations a stall thread spins before giving up on the
    /// victim.
    pub stall_cutoff: u64,

    /// Delay (in nanoseconds) between collections.
    pub time_delta: u64,

    /// Number of attempts at collecting the first sample.
    pub timeout: usize,

    /// Command line for the victim, run with `shell -c`.
    pub command: String,

    /// Exported to the victim as `CACHEGRAB_NAME`.
    pub name: String,

    /// Exported to the victim as `CACHEGRAB_COMMAND_BUF`.
    pub command_buf: Vec<u8>,

    /// Exported to the victim as `CACHEGRAB_DEBUG`.
    pub debug: bool,

    pub shell: PathBuf,

    /// Additional environment variables for the victim.
    pub env: Vec<(String, String)>,

    pub trigger: TriggerMode,
}

impl CaptureConfig {
    pub const DEFAULT_STALL_CUTOFF: u64 = 1_000_000_000;
    pub const DEFAULT_TIME_DELTA: u64 = 1_000;
    pub const DEFAULT_TIMEOUT: usize = 100_000;
    pub const DEFAULT_SHELL: &'static str = "/bin/sh";

    pub fn new(command: impl Into<String>, max_samples: usize) -> Self {
        Self {
            max_samples,
            stall_cutoff: Self::DEFAULT_STALL_CUTOFF,
            time_delta: Self::DEFAULT_TIME_DELTA,
            timeout: Self::DEFAULT_TIMEOUT,
            command: command.into(),
            name: String::new(),
            command_buf: Vec::new(),
            debug: false,
            shell: PathBuf::from(Self::DEFAULT_SHELL),
            env: Vec::new(),
            trigger: TriggerMode::Shim,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(Error::BadArgument("max_samples must be positive"));
        }
        if self.command.trim().is_empty() {
            return Err(Error::BadArgument("empty command"));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn max_samples(mut self, x: usize) -> Self {
        self.max_samples = x;
        self
    }

    pub fn stall_cutoff(mut self, x: u64) -> Self {
        self.stall_cutoff = x;
        self
    }

    pub fn time_delta(mut self, x: u64) -> Self {
        self.time_delta = x;
        self
    }

    pub fn timeout(mut self, x: usize) -> Self {
        self.timeout = x;
        self
    }

    pub fn name(mut self, x: impl Into<String>) -> Self {
        self.name = x.into();
        self
    }

    pub fn command_buf(mut self, x: impl Into<Vec<u8>>) -> Self {
        self.command_buf = x.into();
        self
    }

    pub fn debug(mut self, x: bool) -> Self {
        self.debug = x;
        self
    }

    pub fn shell(mut self, x: impl Into<PathBuf>) -> Self {
        self.shell = x.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }

    pub fn trigger(mut self, x: TriggerMode) -> Self {
        self.trigger = x;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CaptureConfig::new("true", 10);
        assert_eq!(cfg.stall_cutoff, 1_000_000_000);
        assert_eq!(cfg.time_delta, 1_000);
        assert_eq!(cfg.timeout, 100_000);
        assert_eq!(cfg.shell, PathBuf::from("/bin/sh"));
        assert_eq!(cfg.trigger, TriggerMode::Shim);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation() {
        let cfg = CaptureConfig::new("true", 0);
        assert_eq!(cfg.validate(), Err(Error::BadArgument("max_samples must be positive")));
        let cfg = CaptureConfig::new("  ", 1);
        assert_eq!(cfg.validate(), Err(Error::BadArgument("empty command")));
    }
}
