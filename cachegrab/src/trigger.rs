//! The trigger line gating sample collection.
//!
//! Samples are only collected while the line is raised. The line lives in a
//! small memory mapping so that it can be shared with another process: a
//! victim-side shim opens the file named by [`TRIGGER_ENV`] and raises the
//! line around the code of interest.

use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::sync::atomic::{ AtomicU32, Ordering };
use memmap2::{ MmapMut, MmapOptions };

use crate::status::{ Error, Result };

/// Environment variable carrying the path of a shared trigger page.
pub const TRIGGER_ENV: &str = "CACHEGRAB_TRIGGER";

const PAGE_LEN: usize = 0x1000;

struct TriggerPage {
    map: MmapMut,
    /// Backing file, removed on drop if we created it.
    path: Option<PathBuf>,
    owned: bool,
}
impl TriggerPage {
    fn flag(&self) -> &AtomicU32 {
        unsafe { &*(self.map.as_ptr() as *const AtomicU32) }
    }
}
impl Drop for TriggerPage {
    fn drop(&mut self) {
        if let (Some(path), true) = (&self.path, self.owned) {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("couldn't remove trigger file {}: {}", path.display(), e);
            }
        }
    }
}

/// A shared activation flag. Clones refer to the same line.
#[derive(Clone)]
pub struct TriggerLine {
    page: Arc<TriggerPage>,
}

impl TriggerLine {
    /// A trigger line private to this process.
    pub fn anonymous() -> Result<Self> {
        let map = MmapOptions::new().len(PAGE_LEN).map_anon()
            .map_err(|_| Error::OutOfMemory("trigger page"))?;
        Ok(Self::from_page(TriggerPage { map, path: None, owned: false }))
    }

    /// Create a trigger line backed by a new file at `path`.
    /// The file is removed when the last clone is dropped.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true).write(true).create_new(true)
            .open(&path)
            .map_err(|_| Error::PermissionOrCopyFailure("couldn't create trigger file"))?;
        file.set_len(PAGE_LEN as u64)
            .map_err(|_| Error::PermissionOrCopyFailure("couldn't size trigger file"))?;
        let map = unsafe { MmapOptions::new().len(PAGE_LEN).map_mut(&file) };
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(Error::internal(format!("couldn't map trigger file: {}", e)));
            },
        };
        Ok(Self::from_page(TriggerPage { map, path: Some(path), owned: true }))
    }

    /// Open an existing trigger line created by [`TriggerLine::create`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true).write(true)
            .open(&path)
            .map_err(|_| Error::PermissionOrCopyFailure("couldn't open trigger file"))?;
        let map = unsafe { MmapOptions::new().len(PAGE_LEN).map_mut(&file) }
            .map_err(|e| Error::internal(format!("couldn't map trigger file: {}", e)))?;
        Ok(Self::from_page(TriggerPage { map, path: Some(path), owned: false }))
    }

    /// Create a shared trigger line in `/dev/shm` (falling back to a
    /// private one if that isn't possible).
    pub fn shared_or_anonymous() -> Result<Self> {
        let path = PathBuf::from(format!("/dev/shm/cachegrab-trigger-{}-{}",
            std::process::id(), crate::util::GrabEnv::gettid()));
        match Self::create(&path) {
            Ok(line) => Ok(line),
            Err(e) => {
                log::debug!("shared trigger unavailable ({}), using a private one", e);
                Self::anonymous()
            },
        }
    }

    // NOTE: New pages (anonymous or freshly sized files) read as zero,
    // which is the lowered state.
    fn from_page(page: TriggerPage) -> Self {
        Self { page: Arc::new(page) }
    }

    /// Path of the backing file, if the line can be shared.
    pub fn path(&self) -> Option<&Path> { self.page.path.as_deref() }

    pub fn raise(&self) { self.page.flag().store(1, Ordering::Release); }
    pub fn lower(&self) { self.page.flag().store(0, Ordering::Release); }

    #[inline(always)]
    pub fn is_raised(&self) -> bool {
        self.page.flag().load(Ordering::Acquire) != 0
    }
}

impl std::fmt::Debug for TriggerLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLine")
         .field("path", &self.page.path)
         .field("raised", &self.is_raised())
         .finish()
    }
}
