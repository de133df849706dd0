//! The target thread: runs the victim on the core being measured.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::process::CommandExt;
use std::process::{ Command, Stdio };

use crate::capture::config::{ CaptureConfig, TriggerMode };
use crate::capture::shared::SharedState;
use crate::status::Status;
use crate::trigger::{ TriggerLine, TRIGGER_ENV };
use crate::util::GrabEnv;
use crate::xcall::VICTIM_PRIORITY;

pub const ENV_NAME: &str = "CACHEGRAB_NAME";
pub const ENV_COMMAND_BUF: &str = "CACHEGRAB_COMMAND_BUF";
pub const ENV_DEBUG: &str = "CACHEGRAB_DEBUG";

/// What happened to the victim.
#[derive(Clone, Debug, Default)]
pub struct TargetReport {
    /// Exit code of the victim (`None` if it didn't run, or was killed by
    /// a signal).
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Build the victim command.
pub fn victim_command(cfg: &CaptureConfig, trigger: &TriggerLine) -> Command {
    let mut cmd = Command::new(&cfg.shell);
    cmd.arg("-c").arg(&cfg.command)
        .env(ENV_NAME, &cfg.name)
        .env(ENV_COMMAND_BUF, OsString::from_vec(cfg.command_buf.clone()))
        .env(ENV_DEBUG, if cfg.debug { "y" } else { "n" })
        .envs(cfg.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(path) = trigger.path() {
        cmd.env(TRIGGER_ENV, path);
    }

    // Ask for a real-time policy below the cross-call worker; unprivileged
    // victims keep the default.
    unsafe {
        cmd.pre_exec(|| {
            let param = nix::libc::sched_param { sched_priority: VICTIM_PRIORITY };
            nix::libc::sched_setscheduler(0, nix::libc::SCHED_FIFO, &param);
            Ok(())
        });
    }
    cmd
}

/// Body of the target thread.
pub fn run(cpu: usize,
    cfg: &CaptureConfig,
    trigger: &TriggerLine,
    shared: &SharedState,
) -> TargetReport
{
    let mut report = TargetReport::default();
    if let Err(e) = GrabEnv::pin_to_core(cpu) {
        log::warn!("target thread couldn't pin to cpu {}: {}", cpu, e);
        shared.set_status(Status::CaptureSetupError);
    }
    let mut cmd = victim_command(cfg, trigger);

    shared.signal_ready();
    if shared.is_ok() {
        if cfg.trigger == TriggerMode::Process {
            trigger.raise();
        }
        let res = cmd.spawn().and_then(|child| child.wait_with_output());
        if cfg.trigger == TriggerMode::Process {
            trigger.lower();
        }
        match res {
            Ok(out) => {
                log::debug!("victim exited: {}", out.status);
                report.exit_code = out.status.code();
                report.stdout = out.stdout;
                report.stderr = out.stderr;
            },
            Err(e) => {
                log::warn!("couldn't run victim {:?}: {}", cfg.command, e);
                shared.set_status(Status::CaptureSetupError);
            },
        }
    }
    shared.finish_target();
    report
}
