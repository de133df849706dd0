//! Module for translating addresses with `/proc/self/pagemap`.

use std::io::{ Read, Seek, SeekFrom };
use crate::status::{ Error, Result };
use crate::util::GrabEnv;

/// An entry in '/proc/self/pagemap'.
#[derive(Clone, Copy, Debug)]
pub struct PageMapEntry(pub u64);
impl PageMapEntry {
    const NUM_BYTES: usize = 8;
    pub fn present(&self) -> bool { (self.0 & (1 << 63)) != 0 }
    pub fn swapped(&self) -> bool { (self.0 & (1 << 62)) != 0 }
    pub fn pfn(&self) -> usize {
        self.0 as usize & ((1 << 55) - 1)
    }
}

/// Wrapper for interacting with '/proc/self/pagemap'.
pub struct PageMap;
impl PageMap {
    /// Read the pagemap entry for the page containing `vaddr`.
    pub fn entry(vaddr: usize) -> Result<PageMapEntry> {
        let page = GrabEnv::page_size();
        let mut f = std::fs::File::open("/proc/self/pagemap").map_err(|_| {
            Error::PermissionOrCopyFailure("couldn't open /proc/self/pagemap")
        })?;

        let mut buf = [0u8; PageMapEntry::NUM_BYTES];
        let foff = ((vaddr / page) * PageMapEntry::NUM_BYTES) as u64;
        f.seek(SeekFrom::Start(foff)).map_err(Error::internal)?;
        f.read_exact(&mut buf).map_err(Error::internal)?;
        Ok(PageMapEntry(u64::from_le_bytes(buf)))
    }

    /// Resolve the given virtual address into a physical address.
    pub fn resolve_paddr(vaddr: usize) -> Result<usize> {
        let page = GrabEnv::page_size();
        let entry = Self::entry(vaddr)?;
        if !entry.present() {
            return Err(Error::internal(
                format!("page for {:016x} is not present", vaddr)
            ));
        }
        // NOTE: Unprivileged readers get a zeroed PFN.
        if entry.pfn() == 0 {
            return Err(Error::PermissionOrCopyFailure(
                "pagemap reported PFN 0 (missing CAP_SYS_ADMIN?)"
            ));
        }
        Ok((entry.pfn() * page) | (vaddr & (page - 1)))
    }
}
