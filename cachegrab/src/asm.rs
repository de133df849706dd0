//! A64 instruction words and the memory that generated code lives in.

use dynasmrt::{ dynasm, DynasmApi, VecAssembler };
use dynasmrt::aarch64::Aarch64Relocation;
use nix::sys::mman::{ ProtFlags, MapFlags, mmap, munmap };

use crate::arch::{ self, RoutineFn };
use crate::shape::INS_SIZE;
use crate::status::{ Error, Result };
use crate::util::GrabEnv;

/// `mrs x1, pmxevcntr_el0`
pub const READ_EVCNTR: u32 = 0xd53b_9d41;
/// `str x1, [x0], #8`
pub const STORE_VALUE: u32 = 0xf800_8401;
/// `nop`
pub const NOP: u32 = 0xd503_201f;
/// `ret`
pub const RET: u32 = 0xd65f_03c0;
/// `cmp w1, w1`
pub const CMP_TRUE: u32 = 0x6b01_003f;
/// `b.eq #4` (always taken after [`CMP_TRUE`], lands on the next word)
pub const BEQ_4: u32 = 0x5400_0020;

/// Assembler used for generated A64 code. Code is emitted into a vector
/// and copied into an [`Arena`] afterwards.
pub type A64Assembler = VecAssembler<Aarch64Relocation>;

/// Helpers for emitting into an [`A64Assembler`].
pub trait A64Emitter {
    fn emit_word(&mut self, word: u32);
    fn emit_words(&mut self, words: &[u32]) {
        for w in words { self.emit_word(*w); }
    }
    fn emit_nops(&mut self, count: usize);
    fn emit_ret(&mut self);
}
impl A64Emitter for A64Assembler {
    fn emit_word(&mut self, word: u32) {
        self.push_u32(word);
    }
    fn emit_nops(&mut self, count: usize) {
        for _ in 0..count {
            dynasm!(self ; .arch aarch64 ; nop);
        }
    }
    fn emit_ret(&mut self) {
        dynasm!(self ; .arch aarch64 ; ret);
    }
}

/// Split a block of emitted code back into instruction words.
pub fn code_words(code: &[u8]) -> Vec<u32> {
    code.chunks_exact(INS_SIZE)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Protection requested for an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaKind {
    /// Readable/writable data.
    Data,
    /// Readable/writable/executable code.
    Code,
}

/// An anonymous, page-aligned mapping owned by a probe.
///
/// The mapping is released when the arena is dropped.
pub struct Arena {
    /// Pointer to backing allocation
    ptr: *mut u8,
    /// Size of backing allocation (rounded up to whole pages)
    len: usize,
    /// Size requested by the caller
    req_len: usize,
    kind: ArenaKind,
}

// The arena is only ever touched through `&mut self` or by the thread
// currently running a collection.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(req_len: usize, kind: ArenaKind) -> Result<Self> {
        let page = GrabEnv::page_size();
        let len = req_len.max(1).div_ceil(page) * page;
        let nz_len = std::num::NonZeroUsize::new(len)
            .ok_or(Error::BadArgument("zero-length arena"))?;
        let prot = match kind {
            ArenaKind::Data => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            ArenaKind::Code => ProtFlags::PROT_READ
                | ProtFlags::PROT_WRITE
                | ProtFlags::PROT_EXEC,
        };
        let flag = MapFlags::MAP_ANONYMOUS
                 | MapFlags::MAP_PRIVATE
                 | MapFlags::MAP_POPULATE;
        let ptr = unsafe {
            mmap(None, nz_len, prot, flag, -1, 0).map_err(|e| match e {
                nix::errno::Errno::ENOMEM => {
                    Error::OutOfMemory("couldn't map probe arena")
                },
                e => Error::from(e),
            })?
        };
        // NOTE: Anonymous mappings are zero-filled, and MAP_POPULATE has
        // already faulted every page in.
        Ok(Self { ptr: ptr as *mut u8, len, req_len, kind })
    }

    /// Return the base address of the arena.
    pub fn base_addr(&self) -> usize { self.ptr as usize }

    /// Size requested when the arena was created.
    pub fn len(&self) -> usize { self.req_len }

    pub fn is_empty(&self) -> bool { self.req_len == 0 }

    pub fn kind(&self) -> ArenaKind { self.kind }

    pub fn as_ptr(&self) -> *const u8 { self.ptr }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.req_len) }
    }

    /// Copy `code` into the arena at `offset` and make it visible to
    /// instruction fetch. Returns the address of the first copied byte.
    pub fn commit(&mut self, offset: usize, code: &[u8]) -> Result<usize> {
        if self.kind != ArenaKind::Code {
            return Err(Error::internal("commit into a data arena"));
        }
        if offset + code.len() > self.req_len {
            return Err(Error::internal(format!(
                "code ({:#x} bytes at {:#x}) overflows arena of {:#x} bytes",
                code.len(), offset, self.req_len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                code.as_ptr(), self.ptr.add(offset), code.len()
            );
        }
        let addr = self.base_addr() + offset;
        arch::sync_icache(addr, code.len());
        Ok(addr)
    }

    /// Return a function pointer to code previously committed at `offset`.
    ///
    /// # Safety
    /// The caller must have committed a complete routine at `offset`.
    pub unsafe fn routine_at(&self, offset: usize) -> RoutineFn {
        std::mem::transmute::<*mut u8, RoutineFn>(self.ptr.add(offset))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let res = unsafe {
            munmap(self.ptr as *mut std::ffi::c_void, self.len)
        };
        if let Err(e) = res {
            log::warn!("munmap of probe arena at {:016x} failed: {}",
                self.base_addr(), e);
        }
    }
}
