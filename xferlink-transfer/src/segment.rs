//! Test-harness memory segments: one buffer per segment, filled with a
//! known byte pattern and addressed through backend descriptors.

use crate::{
    descriptor::{BlobDesc, MdRef, MemoryKind, MetaDesc},
    error::{Result, TransferError},
};

pub trait MemorySegment: Send {
    fn kind(&self) -> MemoryKind;
    fn dev_id(&self) -> u64;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&mut self, len: usize) -> Result<()>;
    fn deallocate(&mut self);

    /// Writes `base + i` (wrapping) to byte `i`.
    fn set(&mut self, base: u8) -> Result<()>;

    /// `Ok(false)` at the first byte that differs from `base + i`.
    fn check(&self, base: u8) -> Result<bool>;

    fn reset(&mut self);

    /// Registration descriptor for the whole segment. `index` names the
    /// segment among its siblings. Host memory in the descriptor is not
    /// lent; the owner of the segment decides that.
    fn blob_desc(&self, index: usize) -> BlobDesc;

    /// Transfer descriptor for entry `entry_index` of `entry_size` bytes.
    fn meta_desc(&self, entry_index: usize, entry_size: usize) -> Result<MetaDesc>;

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn attach_md(&mut self, md: MdRef) -> Result<()>;
    fn detach_md(&mut self) -> Option<MdRef>;
    fn md(&self) -> Option<MdRef>;
}

/// Creates the handler for `kind`.
///
/// # Panics
///
/// For memory kinds that have no segment handler.
pub fn new_segment(kind: MemoryKind, dev_id: u64) -> Box<dyn MemorySegment> {
    match kind {
        MemoryKind::Dram => Box::new(DramSegment::new(dev_id)),
        MemoryKind::Object => Box::new(ObjectSegment::new(dev_id)),
        other => panic!("no memory segment handler for {other}"),
    }
}

fn entry_range(len: usize, entry_index: usize, entry_size: usize) -> Result<usize> {
    let offset = entry_index
        .checked_mul(entry_size)
        .filter(|offset| entry_size > 0 && offset.saturating_add(entry_size) <= len)
        .ok_or_else(|| {
            TransferError::invalid(format!(
                "entry {entry_index} of {entry_size} bytes is outside a {len}-byte segment"
            ))
        })?;
    Ok(offset)
}

fn attach(slot: &mut Option<MdRef>, md: MdRef) -> Result<()> {
    if slot.is_some() {
        return Err(TransferError::invalid("segment already has metadata attached"));
    }
    *slot = Some(md);
    Ok(())
}

pub struct DramSegment {
    dev_id: u64,
    buf: Box<[u8]>,
    md: Option<MdRef>,
}

impl DramSegment {
    pub fn new(dev_id: u64) -> Self {
        Self {
            dev_id,
            buf: Box::default(),
            md: None,
        }
    }

    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }
}

impl MemorySegment for DramSegment {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Dram
    }

    fn dev_id(&self) -> u64 {
        self.dev_id
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn allocate(&mut self, len: usize) -> Result<()> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| TransferError::backend(format!("allocate {len} bytes: {e}")))?;
        buf.resize(len, 0);
        self.buf = buf.into_boxed_slice();
        Ok(())
    }

    fn deallocate(&mut self) {
        self.buf = Box::default();
    }

    fn set(&mut self, base: u8) -> Result<()> {
        for (i, byte) in self.buf.iter_mut().enumerate() {
            *byte = base.wrapping_add(i as u8);
        }
        Ok(())
    }

    fn check(&self, base: u8) -> Result<bool> {
        for (i, byte) in self.buf.iter().enumerate() {
            let expected = base.wrapping_add(i as u8);
            if *byte != expected {
                log::error!("segment mismatch at byte {i}: expected {expected:#04x}, got {byte:#04x}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn reset(&mut self) {
        self.buf.fill(0);
    }

    fn blob_desc(&self, _index: usize) -> BlobDesc {
        BlobDesc::new(self.addr(), self.buf.len() as u64, self.dev_id)
    }

    fn meta_desc(&self, entry_index: usize, entry_size: usize) -> Result<MetaDesc> {
        let offset = entry_range(self.buf.len(), entry_index, entry_size)?;
        let desc = MetaDesc::new(self.addr() + offset as u64, entry_size as u64, self.dev_id);
        Ok(match self.md {
            Some(md) => desc.with_md(md),
            None => desc,
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.buf.to_vec())
    }

    fn attach_md(&mut self, md: MdRef) -> Result<()> {
        attach(&mut self.md, md)
    }

    fn detach_md(&mut self) -> Option<MdRef> {
        self.md.take()
    }

    fn md(&self) -> Option<MdRef> {
        self.md
    }
}

/// Object-store segment. Holds no bytes; the key is derived from the
/// segment index.
pub struct ObjectSegment {
    dev_id: u64,
    len: usize,
    md: Option<MdRef>,
}

impl ObjectSegment {
    pub fn new(dev_id: u64) -> Self {
        Self {
            dev_id,
            len: 0,
            md: None,
        }
    }

    pub fn key(index: usize) -> String {
        format!("test-obj-key-{index}")
    }
}

impl MemorySegment for ObjectSegment {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Object
    }

    fn dev_id(&self) -> u64 {
        self.dev_id
    }

    fn len(&self) -> usize {
        self.len
    }

    fn allocate(&mut self, len: usize) -> Result<()> {
        self.len = len;
        Ok(())
    }

    fn deallocate(&mut self) {
        self.len = 0;
    }

    fn set(&mut self, _base: u8) -> Result<()> {
        Err(TransferError::UnsupportedOperation("set on object segment"))
    }

    fn check(&self, _base: u8) -> Result<bool> {
        Err(TransferError::UnsupportedOperation("check on object segment"))
    }

    fn reset(&mut self) {}

    fn blob_desc(&self, index: usize) -> BlobDesc {
        BlobDesc::new(0, self.len as u64, self.dev_id).with_meta_info(Self::key(index))
    }

    fn meta_desc(&self, entry_index: usize, entry_size: usize) -> Result<MetaDesc> {
        entry_range(self.len, entry_index, entry_size)?;
        let desc = MetaDesc::new(0, entry_size as u64, self.dev_id);
        Ok(match self.md {
            Some(md) => desc.with_md(md),
            None => desc,
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Err(TransferError::UnsupportedOperation("snapshot of object segment"))
    }

    fn attach_md(&mut self, md: MdRef) -> Result<()> {
        attach(&mut self.md, md)
    }

    fn detach_md(&mut self) -> Option<MdRef> {
        self.md.take()
    }

    fn md(&self) -> Option<MdRef> {
        self.md
    }
}

#[cfg(test)]
mod tests {
    use super::{DramSegment, MemorySegment, ObjectSegment, new_segment};
    use crate::{
        descriptor::{MdRef, MemoryKind},
        error::{Status, TransferError},
    };

    #[test]
    fn dram_pattern_roundtrip() {
        let mut seg = DramSegment::new(0);
        seg.allocate(64).expect("allocate");
        assert!(!seg.check(0x11).expect("check"));
        seg.set(0x11).expect("set");
        assert!(seg.check(0x11).expect("check"));
        assert!(!seg.check(0x22).expect("check"));
        assert_eq!(seg.snapshot().expect("snapshot")[3], 0x14);
        seg.reset();
        assert!(seg.snapshot().expect("snapshot").iter().all(|b| *b == 0));
    }

    #[test]
    fn set_wraps_past_255() {
        let mut seg = DramSegment::new(0);
        seg.allocate(300).expect("allocate");
        seg.set(0xf0).expect("set");
        let bytes = seg.snapshot().expect("snapshot");
        assert_eq!(bytes[0x0f], 0xff);
        assert_eq!(bytes[0x10], 0x00);
        assert!(seg.check(0xf0).expect("check"));
    }

    #[test]
    fn dram_descriptors() {
        let mut seg = DramSegment::new(2);
        seg.allocate(64).expect("allocate");
        let blob = seg.blob_desc(0);
        assert_eq!(blob.len, 64);
        assert_eq!(blob.dev_id, 2);
        assert!(!blob.is_lent());

        let entry = seg.meta_desc(3, 16).expect("entry");
        assert_eq!(entry.addr, blob.addr + 48);
        assert_eq!(entry.len, 16);
        assert!(entry.md.is_none());

        let err = seg.meta_desc(4, 16).expect_err("out of range");
        assert_eq!(err.status(), Status::InvalidParam);
    }

    #[test]
    fn md_attaches_once() {
        let mut seg = DramSegment::new(0);
        seg.allocate(16).expect("allocate");
        seg.attach_md(MdRef(5)).expect("attach");
        assert!(matches!(
            seg.attach_md(MdRef(6)),
            Err(TransferError::InvalidArgument(_))
        ));
        assert_eq!(seg.meta_desc(0, 16).expect("entry").md, Some(MdRef(5)));
        assert_eq!(seg.detach_md(), Some(MdRef(5)));
        assert_eq!(seg.md(), None);
    }

    #[test]
    fn object_segment_descriptors() {
        let mut seg = ObjectSegment::new(1);
        seg.allocate(64).expect("allocate");
        let blob = seg.blob_desc(2);
        assert_eq!(blob.addr, 0);
        assert_eq!(blob.meta_info, "test-obj-key-2");

        let entry = seg.meta_desc(1, 16).expect("entry");
        assert_eq!((entry.addr, entry.len, entry.dev_id), (0, 16, 1));
        assert!(matches!(seg.set(0), Err(TransferError::UnsupportedOperation(_))));
        assert!(seg.check(0).is_err());
        assert!(seg.snapshot().is_err());
    }

    #[test]
    fn factory_dispatches_by_kind() {
        assert_eq!(new_segment(MemoryKind::Dram, 0).kind(), MemoryKind::Dram);
        assert_eq!(new_segment(MemoryKind::Object, 0).kind(), MemoryKind::Object);
    }

    #[test]
    #[should_panic(expected = "no memory segment handler")]
    fn factory_panics_for_unimplemented_kind() {
        let _ = new_segment(MemoryKind::Vram, 0);
    }
}
