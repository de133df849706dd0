//! Binding ARMv8 PMU events to hardware counters.
//!
//! Probes never talk to 'perf' directly. They ask a [`CounterSource`] for a
//! [`PmuCounter`] bound to the target core, then read the underlying
//! hardware counter from generated code with `PMSELR_EL0`/`PMXEVCNTR_EL0`.
//!
//! Userspace access to the counters needs `kernel.perf_user_access = 1`,
//! and the kernel only grants it to events that are bound to a single task.
//! Counters are therefore bound to the thread that runs collections (see
//! [`crate::xcall`]).

use std::os::fd::{ AsRawFd, FromRawFd, OwnedFd };
use num_enum::{ IntoPrimitive, TryFromPrimitive };
use perf_event::hooks::sys::bindings::{ perf_event_attr, perf_event_mmap_page };

use crate::status::{ Error, Result };

/// Raw ARMv8 PMU events used by the probes.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(IntoPrimitive, TryFromPrimitive)]
pub enum PmuEvent {
    /// `L1I_CACHE_REFILL`
    L1iRefill = 0x01,
    /// `L1D_CACHE_REFILL`
    L1dRefill = 0x03,
    /// `BR_MIS_PRED`
    BranchMispredict = 0x10,
}

/// Where a counter should count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterTarget {
    /// The core being measured.
    pub cpu: usize,
    /// Kernel thread ID of the thread that reads the counter.
    pub tid: i32,
}

/// A single PMU counter, created disabled.
pub trait PmuCounter: Send {
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self) -> Result<()>;
    fn reset(&mut self) -> Result<()>;

    /// Read the accumulated count through the kernel.
    fn read(&mut self) -> Result<u64>;

    /// The value to write into `PMSELR_EL0` to address this counter, or
    /// `None` if the counter isn't currently scheduled on a hardware PMC.
    ///
    /// Only meaningful when called from the thread the counter is bound to.
    fn hw_index(&self) -> Option<u32>;
}

/// Something that can hand out [`PmuCounter`]s.
pub trait CounterSource: Send {
    fn bind(&mut self, event: PmuEvent, target: CounterTarget)
        -> Result<Box<dyn PmuCounter>>;
}

// PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_RESET
nix::ioctl_none!(perf_ioc_enable, b'$', 0);
nix::ioctl_none!(perf_ioc_disable, b'$', 1);
nix::ioctl_none!(perf_ioc_reset, b'$', 3);

/// [`CounterSource`] backed by `perf_event_open()`.
pub struct PerfCounterSource;
impl PerfCounterSource {
    const PERF_TYPE_RAW: u32 = 4;
    const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

    /// `config1` bit requesting userspace access (the "rdpmc" format
    /// attribute of the ARMv8 PMU driver).
    const CONFIG1_USER_ACCESS: u64 = 1 << 1;

    pub fn new() -> Self { Self }

    fn make_attr(event: PmuEvent) -> perf_event_attr {
        let mut attr = perf_event_attr::default();
        attr.type_ = Self::PERF_TYPE_RAW;
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr.config = u64::from(event);
        attr.__bindgen_anon_3.config1 = Self::CONFIG1_USER_ACCESS;
        attr.set_disabled(1);
        attr.set_pinned(1);
        attr.set_exclude_hv(1);
        attr
    }
}

impl CounterSource for PerfCounterSource {
    fn bind(&mut self, event: PmuEvent, target: CounterTarget)
        -> Result<Box<dyn PmuCounter>>
    {
        use nix::libc;
        let attr = Self::make_attr(event);
        let fd = unsafe {
            libc::syscall(libc::SYS_perf_event_open,
                &attr as *const perf_event_attr,
                target.tid as libc::pid_t,
                target.cpu as libc::c_int,
                -1 as libc::c_int,
                Self::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
            )
        };
        if fd < 0 {
            let errno = nix::errno::Errno::last();
            log::warn!("perf_event_open({:?}, tid={}, cpu={}) failed: {}",
                event, target.tid, target.cpu, errno.desc());
            return Err(Error::internal(format!(
                "unable to capture performance counter: {}", errno.desc()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as i32) };
        let ctr = PerfCounter::new(fd, event)?;
        Ok(Box::new(ctr))
    }
}

/// A counter opened with [`PerfCounterSource`].
pub struct PerfCounter {
    fd: OwnedFd,
    event: PmuEvent,
    /// The first page of the perf mapping for this counter.
    page: memmap2::Mmap,
}
impl PerfCounter {
    fn new(fd: OwnedFd, event: PmuEvent) -> Result<Self> {
        let page = unsafe {
            memmap2::MmapOptions::new()
                .len(std::mem::size_of::<perf_event_mmap_page>())
                .map(fd.as_raw_fd())
                .map_err(|e| Error::internal(
                    format!("couldn't map perf user page: {}", e)
                ))?
        };
        Ok(Self { fd, event, page })
    }

    fn user_page(&self) -> *const perf_event_mmap_page {
        self.page.as_ptr() as *const perf_event_mmap_page
    }

    pub fn event(&self) -> PmuEvent { self.event }
}

impl PmuCounter for PerfCounter {
    fn enable(&mut self) -> Result<()> {
        unsafe { perf_ioc_enable(self.fd.as_raw_fd())?; }
        Ok(())
    }
    fn disable(&mut self) -> Result<()> {
        unsafe { perf_ioc_disable(self.fd.as_raw_fd())?; }
        Ok(())
    }
    fn reset(&mut self) -> Result<()> {
        unsafe { perf_ioc_reset(self.fd.as_raw_fd())?; }
        Ok(())
    }

    fn read(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(self.fd.as_raw_fd(), &mut buf)?;
        if n != buf.len() {
            return Err(Error::internal("short read from perf counter"));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    fn hw_index(&self) -> Option<u32> {
        // The kernel updates the user page under a sequence lock.
        let page = self.user_page();
        let index = loop {
            unsafe {
                let seq = std::ptr::read_volatile(&(*page).lock);
                std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
                let index = std::ptr::read_volatile(&(*page).index);
                std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
                if seq == std::ptr::read_volatile(&(*page).lock) {
                    break index;
                }
            }
        };
        // NOTE: An index of zero means the event isn't running on a PMC;
        // otherwise the counter number is offset by one.
        index.checked_sub(1)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_event_numbers() {
        assert_eq!(u64::from(PmuEvent::L1iRefill), 0x01);
        assert_eq!(u64::from(PmuEvent::L1dRefill), 0x03);
        assert_eq!(u64::from(PmuEvent::BranchMispredict), 0x10);
    }

    #[test]
    fn perf_attr() {
        let attr = PerfCounterSource::make_attr(PmuEvent::L1dRefill);
        assert_eq!(attr.type_, 4);
        assert_eq!(attr.config, 0x03);
        assert_eq!(unsafe { attr.__bindgen_anon_3.config1 }, 0b10);
        assert_eq!(attr.disabled(), 1);
    }
}
