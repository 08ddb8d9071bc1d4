#![forbid(unsafe_code)]

//! Tablespace registry: the aligned-block file layer the buffer pool reads
//! and writes through.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{BrasaError, Result};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PageId, PageNo, SpaceId};

/// Pluggable page transform: encryption or compression applied to the
/// payload region just before a write and undone just after a read. The
/// header and trailer stay in the clear; checksums are recomputed over the
/// transformed image, so a raw page validates before the transform is
/// undone.
pub trait PageTransform: Send + Sync + 'static {
    /// Transforms the payload of `src` into `dst` (same frame length).
    fn before_write(&self, id: PageId, src: &[u8], dst: &mut [u8]) -> Result<()>;
    /// Undoes the transform in place. Errors surface as `DecryptionFailed`.
    fn after_read(&self, id: PageId, frame: &mut [u8]) -> Result<()>;
    /// Compresses a frame into the space's compressed page size. Required
    /// for compressed tablespaces only.
    fn compress(&self, _id: PageId, _src: &[u8], _dst: &mut [u8]) -> Result<()> {
        Err(BrasaError::Corruption("compression codec missing"))
    }
    /// Expands a compressed image back into a full frame.
    fn decompress(&self, _id: PageId, _src: &[u8], _dst: &mut [u8]) -> Result<()> {
        Err(BrasaError::Corruption("compression codec missing"))
    }
}

pub struct Tablespace {
    id: SpaceId,
    file: Arc<dyn FileIo>,
    page_size: usize,
    zip_size: usize,
    deleted: AtomicBool,
    version: AtomicU64,
    transform: Option<Arc<dyn PageTransform>>,
}

impl Tablespace {
    /// Physical size of one page on disk: the compressed size for
    /// compressed tablespaces, the frame size otherwise.
    pub fn physical_page_size(&self) -> usize {
        if self.zip_size != 0 {
            self.zip_size
        } else {
            self.page_size
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn zip_size(&self) -> usize {
        self.zip_size
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn transform(&self) -> Option<&Arc<dyn PageTransform>> {
        self.transform.as_ref()
    }

    fn offset_of(&self, page_no: PageNo) -> u64 {
        page_no as u64 * self.physical_page_size() as u64
    }

    pub fn read_page(&self, page_no: PageNo, dst: &mut [u8]) -> Result<()> {
        if self.is_deleted() {
            return Err(BrasaError::TablespaceDeleted(self.id));
        }
        debug_assert_eq!(dst.len(), self.physical_page_size());
        let off = self.offset_of(page_no);
        // Short files read back as never-written pages.
        if off + dst.len() as u64 > self.file.len()? {
            dst.fill(0);
            return Ok(());
        }
        self.file.read_at(off, dst)
    }

    pub fn write_page(&self, page_no: PageNo, src: &[u8]) -> Result<()> {
        if self.is_deleted() {
            return Err(BrasaError::TablespaceDeleted(self.id));
        }
        debug_assert_eq!(src.len(), self.physical_page_size());
        self.file.write_at(self.offset_of(page_no), src)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    /// Undoes the space's transform on a freshly read frame.
    pub fn decrypt(&self, id: PageId, frame: &mut [u8]) -> Result<()> {
        match &self.transform {
            Some(t) => t
                .after_read(id, frame)
                .map_err(|_| BrasaError::DecryptionFailed(id)),
            None => Ok(()),
        }
    }
}

/// Registry of open tablespaces, shared by all buffer pool instances.
pub struct TablespaceManager {
    spaces: RwLock<HashMap<SpaceId, Arc<Tablespace>>>,
    page_size: usize,
}

impl TablespaceManager {
    pub fn new(page_size: usize) -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Opens (or creates) the backing file for a tablespace.
    pub fn create(
        &self,
        id: SpaceId,
        path: impl AsRef<Path>,
        zip_size: usize,
        transform: Option<Arc<dyn PageTransform>>,
    ) -> Result<Arc<Tablespace>> {
        let file = StdFileIo::open(path)?;
        self.register(id, Arc::new(file), zip_size, transform)
    }

    /// Registers a tablespace over any `FileIo`, for in-memory backends and
    /// fault injection.
    pub fn register(
        &self,
        id: SpaceId,
        file: Arc<dyn FileIo>,
        zip_size: usize,
        transform: Option<Arc<dyn PageTransform>>,
    ) -> Result<Arc<Tablespace>> {
        if zip_size != 0 && (!zip_size.is_power_of_two() || zip_size > self.page_size) {
            return Err(BrasaError::Config(format!(
                "invalid compressed page size {zip_size} for space {id}"
            )));
        }
        let space = Arc::new(Tablespace {
            id,
            file,
            page_size: self.page_size,
            zip_size,
            deleted: AtomicBool::new(false),
            version: AtomicU64::new(1),
            transform,
        });
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return Err(BrasaError::Config(format!("space {id} already registered")));
        }
        spaces.insert(id, Arc::clone(&space));
        debug!(space = id, zip_size, "tablespace registered");
        Ok(space)
    }

    pub fn get(&self, id: SpaceId) -> Result<Arc<Tablespace>> {
        match self.spaces.read().get(&id) {
            Some(space) if !space.is_deleted() => Ok(Arc::clone(space)),
            _ => Err(BrasaError::TablespaceDeleted(id)),
        }
    }

    pub fn lookup(&self, id: SpaceId) -> Option<Arc<Tablespace>> {
        self.spaces.read().get(&id).cloned()
    }

    /// A missing space counts as deleted.
    pub fn is_deleted(&self, id: SpaceId) -> bool {
        match self.spaces.read().get(&id) {
            Some(space) => space.is_deleted(),
            None => true,
        }
    }

    pub fn version(&self, id: SpaceId) -> Option<u64> {
        self.spaces.read().get(&id).map(|s| s.version())
    }

    /// Marks a space deleted. The entry stays so version queries still
    /// answer; the buffer pool discards its pages lazily.
    pub fn drop_space(&self, id: SpaceId) {
        if let Some(space) = self.spaces.read().get(&id) {
            space.deleted.store(true, Ordering::Release);
            space.version.fetch_add(1, Ordering::AcqRel);
            debug!(space = id, "tablespace dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::MIN_PAGE_SIZE;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, TablespaceManager) {
        (tempdir().unwrap(), TablespaceManager::new(MIN_PAGE_SIZE))
    }

    #[test]
    fn page_roundtrip() {
        let (dir, mgr) = manager();
        let space = mgr.create(3, dir.path().join("s3.ibd"), 0, None).unwrap();

        let mut frame = vec![0u8; MIN_PAGE_SIZE];
        frame[0] = 0xAB;
        space.write_page(5, &frame).unwrap();

        let mut back = vec![0xFFu8; MIN_PAGE_SIZE];
        space.read_page(5, &mut back).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn short_read_returns_zero_page() {
        let (dir, mgr) = manager();
        let space = mgr.create(3, dir.path().join("s3.ibd"), 0, None).unwrap();
        let mut frame = vec![0xFFu8; MIN_PAGE_SIZE];
        space.read_page(9, &mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn dropped_space_rejects_io_and_reads_deleted() {
        let (dir, mgr) = manager();
        let space = mgr.create(7, dir.path().join("s7.ibd"), 0, None).unwrap();
        assert!(!mgr.is_deleted(7));
        let v1 = mgr.version(7).unwrap();

        mgr.drop_space(7);
        assert!(mgr.is_deleted(7));
        assert!(mgr.version(7).unwrap() > v1);
        assert!(matches!(
            mgr.get(7),
            Err(BrasaError::TablespaceDeleted(7))
        ));
        let mut frame = vec![0u8; MIN_PAGE_SIZE];
        assert!(space.read_page(0, &mut frame).is_err());
    }

    #[test]
    fn unknown_space_is_deleted() {
        let (_dir, mgr) = manager();
        assert!(mgr.is_deleted(99));
        assert!(mgr.version(99).is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (dir, mgr) = manager();
        mgr.create(1, dir.path().join("a.ibd"), 0, None).unwrap();
        assert!(mgr.create(1, dir.path().join("b.ibd"), 0, None).is_err());
    }

    #[test]
    fn zip_size_must_be_power_of_two() {
        let (dir, mgr) = manager();
        assert!(mgr.create(2, dir.path().join("z.ibd"), 300, None).is_err());
        let space = mgr.create(2, dir.path().join("z.ibd"), 256, None).unwrap();
        assert_eq!(space.physical_page_size(), 256);
    }
}
