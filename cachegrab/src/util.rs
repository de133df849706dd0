pub mod pagemap;

use std::io::Read;
use std::time::{ Duration, Instant };
use nix::sched::{ CpuSet, sched_getaffinity, sched_setaffinity };
use nix::unistd::{ Pid, SysconfVar, sysconf };

use crate::status::{ Error, Result };

/// Utilities for controlling (and describing) the state of the current
/// process and the machine it runs on.
pub struct GrabEnv;
impl GrabEnv {
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const NOHZ_PATH: &'static str =
        "/sys/devices/system/cpu/nohz_full";
    const SMT_PATH: &'static str =
        "/sys/devices/system/cpu/smt/control";
    const PERF_USER_ACCESS_PATH: &'static str =
        "/proc/sys/kernel/perf_user_access";
    const PERF_PARANOID_PATH: &'static str =
        "/proc/sys/kernel/perf_event_paranoid";
    const PMU_NAME_PATH: &'static str =
        "/sys/bus/event_source/devices/armv8_pmuv3_0/type";

    fn read_trimmed(path: &str) -> std::result::Result<String, std::io::ErrorKind> {
        let mut f = std::fs::File::open(path).map_err(|e| e.kind())?;
        let mut res = String::new();
        f.read_to_string(&mut res).map_err(|e| e.kind())?;
        Ok(res.trim().to_string())
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> String {
        match Self::read_trimmed(Self::ISOLATED_PATH) {
            Ok(s) if s.is_empty() => "disabled".to_string(),
            Ok(s) => s,
            Err(e) => format!("<{:?}>", e),
        }
    }

    /// Return a string describing the set of 'nohz_full' cores.
    pub fn sysfs_nohz() -> String {
        match Self::read_trimmed(Self::NOHZ_PATH) {
            Ok(s) if s.is_empty() => "disabled".to_string(),
            Ok(s) => s,
            Err(e) => format!("<{:?}>", e),
        }
    }

    /// Returns true if SMT is enabled.
    pub fn sysfs_smt_enabled() -> std::result::Result<bool, std::io::ErrorKind> {
        match Self::read_trimmed(Self::SMT_PATH)?.as_str() {
            "on" | "forceon" => Ok(true),
            _ => Ok(false),
        }
    }

    /// Returns true if userspace may read PMU counters directly
    /// (`kernel.perf_user_access`).
    pub fn procfs_perf_user_access() -> std::result::Result<bool, std::io::ErrorKind> {
        Ok(Self::read_trimmed(Self::PERF_USER_ACCESS_PATH)? == "1")
    }

    /// Return the value of `kernel.perf_event_paranoid`.
    pub fn procfs_perf_paranoid() -> std::result::Result<i32, std::io::ErrorKind> {
        Self::read_trimmed(Self::PERF_PARANOID_PATH)?
            .parse()
            .map_err(|_| std::io::ErrorKind::InvalidData)
    }

    /// Returns true if an ARMv8 PMUv3 is exposed to 'perf'.
    pub fn sysfs_armv8_pmu_present() -> bool {
        std::path::Path::new(Self::PMU_NAME_PATH).exists()
    }
}

impl GrabEnv {
    /// Size of a page (in bytes).
    pub fn page_size() -> usize {
        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(sz)) if sz > 0 => sz as usize,
            _ => 0x1000,
        }
    }

    /// Number of online cores.
    pub fn online_cores() -> usize {
        match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
            Ok(Some(n)) if n > 0 => n as usize,
            _ => 1,
        }
    }

    /// The cores the current process is allowed to run on.
    pub fn allowed_cores() -> Result<Vec<usize>> {
        let set = sched_getaffinity(Pid::from_raw(0))?;
        let res = (0..CpuSet::count())
            .filter(|cpu| set.is_set(*cpu).unwrap_or(false))
            .collect();
        Ok(res)
    }

    /// The core the calling thread is currently running on.
    pub fn current_cpu() -> Result<usize> {
        Ok(nix::sched::sched_getcpu()?)
    }

    /// Kernel thread ID of the calling thread.
    pub fn gettid() -> i32 {
        nix::unistd::gettid().as_raw()
    }

    /// Pin the calling thread to a particular core.
    pub fn pin_to_core(core: usize) -> Result<()> {
        let this_pid = Pid::from_raw(0);
        let mut cpuset = CpuSet::new();
        cpuset.set(core).map_err(|_| Error::BadArgument("core out of range"))?;
        sched_setaffinity(this_pid, &cpuset).map_err(|errno| {
            log::warn!("Couldn't pin to CPU core {}: {}", core, errno.desc());
            Error::from(errno)
        })
    }

    /// Try to raise the scheduling priority of the calling thread.
    ///
    /// Failure is not an error: unprivileged callers keep their priority.
    pub fn raise_priority() -> bool {
        use nix::libc;
        let tid = Self::gettid() as libc::id_t;
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, -20) };
        if rc != 0 {
            log::debug!("setpriority failed for tid {}: {}", tid,
                nix::errno::Errno::last());
        }
        rc == 0
    }

    /// Try to move the calling thread to `SCHED_FIFO` at `prio`.
    ///
    /// Returns false (leaving the policy alone) when not permitted.
    pub fn set_fifo_priority(prio: i32) -> bool {
        use nix::libc;
        let param = libc::sched_param { sched_priority: prio };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            log::debug!("SCHED_FIFO({}) refused for tid {}: {}", prio,
                Self::gettid(), nix::errno::Errno::last());
        }
        rc == 0
    }
}

/// Busy-wait for `ns` nanoseconds.
#[inline(always)]
pub fn spin_ns(ns: u64) {
    if ns == 0 {
        return;
    }
    let deadline = Duration::from_nanos(ns);
    let start = Instant::now();
    while start.elapsed() < deadline {
        std::hint::spin_loop();
    }
}
