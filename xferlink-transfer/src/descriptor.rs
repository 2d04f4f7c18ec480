use std::fmt;

use crate::error::{Result, TransferError};

/// Memory kinds a backend may declare. Only `Dram` and `Object` have segment
/// handlers in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Dram,
    Vram,
    Block,
    Object,
    File,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryKind::Dram => "DRAM",
            MemoryKind::Vram => "VRAM",
            MemoryKind::Block => "BLK",
            MemoryKind::Object => "OBJ",
            MemoryKind::File => "FILE",
        };
        f.write_str(name)
    }
}

/// Reference to backend-private metadata, carried by transfer descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MdRef(pub(crate) u64);

impl MdRef {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Registration-time descriptor.
///
/// Host memory is only accepted for registration when the descriptor was
/// built through [`BlobDesc::host`] or [`BlobDesc::lent`]. Descriptors from
/// [`BlobDesc::new`] carry a range and a device id but grant no access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobDesc {
    pub addr: u64,
    pub len: u64,
    pub dev_id: u64,
    pub meta_info: String,
    lent: bool,
}

impl BlobDesc {
    pub fn new(addr: u64, len: u64, dev_id: u64) -> Self {
        Self {
            addr,
            len,
            dev_id,
            meta_info: String::new(),
            lent: false,
        }
    }

    /// Describes `len` bytes of host memory at `ptr`, lent to whichever
    /// engine registers it.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must be valid for reads and writes, and must stay
    /// allocated and otherwise unaccessed while any transfer may touch it,
    /// until every registration made from this descriptor has been
    /// deregistered or its engine dropped.
    pub unsafe fn host(ptr: *mut u8, len: usize, dev_id: u64) -> Self {
        // SAFETY: forwarded to the caller.
        unsafe { Self::new(ptr as u64, len as u64, dev_id).lent() }
    }

    /// Marks the range described by `self` as lent host memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlobDesc::host`] for `[addr, addr + len)`.
    pub unsafe fn lent(mut self) -> Self {
        self.lent = true;
        self
    }

    pub fn is_lent(&self) -> bool {
        self.lent
    }

    pub fn with_meta_info(mut self, meta_info: impl Into<String>) -> Self {
        self.meta_info = meta_info.into();
        self
    }

    /// Validates a host range for registration.
    pub(crate) fn check_host_region(&self) -> Result<()> {
        if !self.lent {
            return Err(TransferError::backend(format!(
                "host region {:#x}+{} was not lent for registration",
                self.addr, self.len
            )));
        }
        if self.addr == 0 || self.len == 0 || self.addr.checked_add(self.len).is_none() {
            return Err(TransferError::backend(format!(
                "invalid host region: addr={:#x}, len={}",
                self.addr, self.len
            )));
        }
        Ok(())
    }
}

/// Transfer-time descriptor addressing a sub-region of a registered segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDesc {
    pub addr: u64,
    pub len: u64,
    pub dev_id: u64,
    pub md: Option<MdRef>,
}

impl MetaDesc {
    pub fn new(addr: u64, len: u64, dev_id: u64) -> Self {
        Self {
            addr,
            len,
            dev_id,
            md: None,
        }
    }

    pub fn with_md(mut self, md: MdRef) -> Self {
        self.md = Some(md);
        self
    }

    pub(crate) fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.len)
    }
}

/// Ordered descriptors of one memory kind. Entry `i` of the local list pairs
/// with entry `i` of the remote list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescList {
    kind: MemoryKind,
    descs: Vec<MetaDesc>,
}

impl DescList {
    pub fn new(kind: MemoryKind) -> Self {
        Self {
            kind,
            descs: Vec::new(),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn push(&mut self, desc: MetaDesc) {
        self.descs.push(desc);
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MetaDesc> {
        self.descs.iter()
    }

    pub fn total_len(&self) -> u64 {
        self.descs.iter().map(|desc| desc.len).sum()
    }

    /// Shape checks shared by every backend's `prep_xfer`.
    pub(crate) fn check_pairing(local: &DescList, remote: &DescList) -> Result<()> {
        if local.is_empty() {
            return Err(TransferError::invalid("descriptor list is empty"));
        }
        if local.len() != remote.len() {
            return Err(TransferError::DescCountMismatch {
                local: local.len(),
                remote: remote.len(),
            });
        }
        for (index, (l, r)) in local.iter().zip(remote.iter()).enumerate() {
            if l.len != r.len {
                return Err(TransferError::DescLenMismatch {
                    index,
                    local: l.len,
                    remote: r.len,
                });
            }
            if l.len == 0 {
                return Err(TransferError::invalid(format!(
                    "descriptor {index} has zero length"
                )));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a DescList {
    type Item = &'a MetaDesc;
    type IntoIter = std::slice::Iter<'a, MetaDesc>;

    fn into_iter(self) -> Self::IntoIter {
        self.descs.iter()
    }
}
