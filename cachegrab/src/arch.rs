//! AArch64 primitives used on the measurement path.
//!
//! Every function here has a portable fallback so the rest of the crate can
//! be built (and its bookkeeping tested) on other hosts. The fallbacks never
//! enter generated code and report a counter value of zero.

/// Signature of a generated measure/refill routine.
///
/// On entry, `x0` holds the output pointer. The routine post-increments it
/// once for every line it measures, and clobbers `x1` and the flags.
pub type RoutineFn = unsafe extern "C" fn(out: *mut u64);

#[cfg(target_arch = "aarch64")]
mod imp {
    use super::RoutineFn;
    use core::arch::asm;

    /// Select the event counter addressed by `PMXEVCNTR_EL0`.
    #[inline(always)]
    pub fn select_counter(idx: u32) {
        unsafe {
            asm!(
                "msr pmselr_el0, {0}",
                "isb",
                in(reg) idx as u64,
                options(nostack, preserves_flags),
            );
        }
    }

    /// Read the currently-selected event counter.
    #[inline(always)]
    pub fn read_counter() -> u64 {
        let val: u64;
        unsafe {
            asm!(
                "mrs {0}, pmxevcntr_el0",
                out(reg) val,
                options(nostack, preserves_flags),
            );
        }
        val
    }

    /// Load from `ptr`, wait for the load to complete and then read the
    /// currently-selected event counter.
    #[inline(always)]
    pub fn touch_and_read(ptr: *const u8) -> u64 {
        let val: u64;
        unsafe {
            asm!(
                "ldrb wzr, [{ptr}]",
                "dsb sy",
                "isb",
                "mrs {val}, pmxevcntr_el0",
                ptr = in(reg) ptr,
                val = out(reg) val,
                options(nostack, preserves_flags),
            );
        }
        val
    }

    /// Load from `ptr`.
    #[inline(always)]
    pub fn touch(ptr: *const u8) {
        unsafe { let _ = core::ptr::read_volatile(ptr); }
    }

    #[inline(always)]
    pub unsafe fn call_routine(f: RoutineFn, out: *mut u64) {
        f(out)
    }

    fn ctr_el0() -> u64 {
        let ctr: u64;
        unsafe {
            asm!("mrs {0}, ctr_el0", out(reg) ctr,
                options(nomem, nostack, preserves_flags));
        }
        ctr
    }

    /// Make freshly-written instructions in `[start, start + len)` visible
    /// to instruction fetch.
    pub fn sync_icache(start: usize, len: usize) {
        let ctr = ctr_el0();
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            unsafe { asm!("dc cvau, {0}", in(reg) addr, options(nostack)); }
            addr += dline;
        }
        unsafe { asm!("dsb ish", options(nostack, preserves_flags)); }

        let mut addr = start & !(iline - 1);
        while addr < end {
            unsafe { asm!("ic ivau, {0}", in(reg) addr, options(nostack)); }
            addr += iline;
        }
        unsafe {
            asm!("dsb ish", "isb", options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod imp {
    use super::RoutineFn;

    pub fn select_counter(_idx: u32) {}

    pub fn read_counter() -> u64 { 0 }

    #[inline(always)]
    pub fn touch_and_read(ptr: *const u8) -> u64 {
        unsafe { let _ = core::ptr::read_volatile(ptr); }
        0
    }

    #[inline(always)]
    pub fn touch(ptr: *const u8) {
        unsafe { let _ = core::ptr::read_volatile(ptr); }
    }

    /// Generated code is A64; there is nothing to call here.
    pub unsafe fn call_routine(_f: RoutineFn, _out: *mut u64) {}

    pub fn sync_icache(_start: usize, _len: usize) {}
}

pub use imp::*;

/// Returns true if generated routines can actually be executed here.
pub const fn can_execute_routines() -> bool {
    cfg!(target_arch = "aarch64")
}
