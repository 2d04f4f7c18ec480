//! End-to-end transfer fixture: a set of local buffers paired with a set of
//! transfer-side buffers, registered and loaded on the engines, ready to be
//! moved in either direction and verified.

use std::sync::Arc;

use crate::{
    api::{XferOp, XferOptArgs},
    backend::BackendEngine,
    descriptor::{BlobDesc, DescList, MemoryKind},
    error::{Result, TransferError},
    guard::{LoadedMdGuard, RegistrationGuard, Teardown},
    orchestrator::{PollPolicy, TransferOrchestrator},
    segment::{MemorySegment, new_segment},
};

pub const MAX_NUM_BUFS: usize = 3;
pub const BUF_SIZE: usize = 64;
pub const NUM_ENTRIES: usize = 4;
pub const ENTRY_SIZE: usize = BUF_SIZE / NUM_ENTRIES;
pub const LOCAL_BUF_BYTE: u8 = 0x11;
pub const XFER_BUF_BYTE: u8 = 0x22;
pub const NOTIF_MSG: &str = "Test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub local_kind: MemoryKind,
    pub xfer_kind: MemoryKind,
    pub num_bufs: usize,
    pub split_buf: bool,
    pub policy: PollPolicy,
}

impl SessionConfig {
    pub fn new(local_kind: MemoryKind, xfer_kind: MemoryKind) -> Self {
        Self {
            local_kind,
            xfer_kind,
            num_bufs: 1,
            split_buf: false,
            policy: PollPolicy::default(),
        }
    }

    pub fn with_num_bufs(mut self, num_bufs: usize) -> Self {
        self.num_bufs = num_bufs;
        self
    }

    pub fn with_split_buf(mut self, split_buf: bool) -> Self {
        self.split_buf = split_buf;
        self
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn entries(&self) -> (usize, usize) {
        if self.split_buf {
            (NUM_ENTRIES, ENTRY_SIZE)
        } else {
            (1, BUF_SIZE)
        }
    }
}

fn registration_desc(segment: &dyn MemorySegment, index: usize) -> BlobDesc {
    let desc = segment.blob_desc(index);
    match segment.kind() {
        // SAFETY: segments are private to the session, which releases every
        // registration before a segment is deallocated or dropped, and only
        // touches segment memory through `&mut self` while no transfer runs.
        MemoryKind::Dram => unsafe { desc.lent() },
        _ => desc,
    }
}

// Field order is drop order: loaded metadata, then the connection, then
// registrations, and the buffers last.
pub struct TransferSession {
    loaded: Vec<LoadedMdGuard>,
    orchestrator: TransferOrchestrator,
    local_regs: Vec<RegistrationGuard>,
    xfer_regs: Vec<RegistrationGuard>,
    local_mem: Vec<Box<dyn MemorySegment>>,
    xfer_mem: Vec<Box<dyn MemorySegment>>,
    local_descs: DescList,
    xfer_descs: DescList,
    opt_args: XferOptArgs,
}

impl TransferSession {
    /// Sets up a local session when both engines are the same object,
    /// a remote one otherwise.
    pub fn new(
        local_engine: Arc<dyn BackendEngine>,
        xfer_engine: Arc<dyn BackendEngine>,
        config: SessionConfig,
    ) -> Result<Self> {
        if config.num_bufs == 0 || config.num_bufs > MAX_NUM_BUFS {
            return Err(TransferError::invalid(format!(
                "num_bufs must be 1..={MAX_NUM_BUFS}, got {}",
                config.num_bufs
            )));
        }

        let remote = !std::ptr::addr_eq(Arc::as_ptr(&local_engine), Arc::as_ptr(&xfer_engine));
        let orchestrator = if remote {
            TransferOrchestrator::remote(Arc::clone(&local_engine), Arc::clone(&xfer_engine))?
        } else {
            TransferOrchestrator::local(Arc::clone(&local_engine))?
        }
        .with_policy(config.policy);
        orchestrator.check_kinds(config.local_kind, config.xfer_kind)?;

        let local_dev_id = 0_u64;
        let xfer_dev_id = if remote { 1_u64 } else { local_dev_id };

        let mut local_mem = Vec::with_capacity(config.num_bufs);
        let mut xfer_mem = Vec::with_capacity(config.num_bufs);
        for i in 0..config.num_bufs {
            let mut local = new_segment(config.local_kind, local_dev_id + i as u64);
            local.allocate(BUF_SIZE)?;
            local_mem.push(local);
            let mut xfer = new_segment(config.xfer_kind, xfer_dev_id + i as u64);
            xfer.allocate(BUF_SIZE)?;
            xfer_mem.push(xfer);
        }

        let mut local_regs = Vec::with_capacity(config.num_bufs);
        let mut xfer_regs = Vec::with_capacity(config.num_bufs);
        for i in 0..config.num_bufs {
            let reg = RegistrationGuard::register(
                &local_engine,
                &registration_desc(local_mem[i].as_ref(), i),
                config.local_kind,
            )?;
            local_mem[i].attach_md(reg.md_ref())?;
            local_regs.push(reg);

            let reg = RegistrationGuard::register(
                &xfer_engine,
                &registration_desc(xfer_mem[i].as_ref(), i),
                config.xfer_kind,
            )?;
            xfer_mem[i].attach_md(reg.md_ref())?;
            xfer_regs.push(reg);
        }

        let mut loaded = Vec::with_capacity(config.num_bufs);
        for (i, reg) in xfer_regs.iter().enumerate() {
            let guard = if remote {
                let public = xfer_engine.get_public_data(reg.md())?;
                if public.is_empty() {
                    return Err(TransferError::backend(format!(
                        "empty public data for buffer {i}"
                    )));
                }
                let desc = xfer_mem[i].blob_desc(i).with_meta_info(public);
                LoadedMdGuard::load_remote(
                    &local_engine,
                    &desc,
                    config.xfer_kind,
                    orchestrator.peer(),
                )?
            } else {
                LoadedMdGuard::load_local(&local_engine, reg.md())?
            };
            loaded.push(guard);
        }

        let (num_entries, entry_size) = config.entries();
        let mut local_descs = DescList::new(config.local_kind);
        let mut xfer_descs = DescList::new(config.xfer_kind);
        for i in 0..config.num_bufs {
            for j in 0..num_entries {
                local_descs.push(local_mem[i].meta_desc(j, entry_size)?);
                xfer_descs.push(
                    xfer_mem[i]
                        .meta_desc(j, entry_size)?
                        .with_md(loaded[i].md_ref()),
                );
            }
        }

        let opt_args = if xfer_engine.supports_notif() {
            XferOptArgs::with_notif(NOTIF_MSG)
        } else {
            XferOptArgs::default()
        };

        log::info!(
            "transfer session ready: {} {} -> {}, bufs={}, entries={}, remote={}",
            local_engine.backend_type(),
            config.local_kind,
            config.xfer_kind,
            config.num_bufs,
            local_descs.len(),
            remote
        );

        Ok(Self {
            loaded,
            orchestrator,
            local_regs,
            xfer_regs,
            local_mem,
            xfer_mem,
            local_descs,
            xfer_descs,
            opt_args,
        })
    }

    pub fn orchestrator(&self) -> &TransferOrchestrator {
        &self.orchestrator
    }

    pub fn local_descs(&self) -> &DescList {
        &self.local_descs
    }

    pub fn xfer_descs(&self) -> &DescList {
        &self.xfer_descs
    }

    pub fn set_local_mem(&mut self) -> Result<()> {
        for (i, seg) in self.local_mem.iter_mut().enumerate() {
            seg.set(LOCAL_BUF_BYTE.wrapping_add(i as u8))?;
        }
        Ok(())
    }

    pub fn set_xfer_mem(&mut self) -> Result<()> {
        for (i, seg) in self.xfer_mem.iter_mut().enumerate() {
            seg.set(XFER_BUF_BYTE.wrapping_add(i as u8))?;
        }
        Ok(())
    }

    pub fn reset_local_mem(&mut self) {
        for seg in &mut self.local_mem {
            seg.reset();
        }
    }

    /// True when every local buffer holds the local pattern.
    pub fn check_local_mem(&self) -> Result<bool> {
        Self::check_all(&self.local_mem, LOCAL_BUF_BYTE)
    }

    /// True when every transfer-side buffer holds the local pattern, i.e. a
    /// WRITE landed.
    pub fn check_xfer_mem(&self) -> Result<bool> {
        Self::check_all(&self.xfer_mem, LOCAL_BUF_BYTE)
    }

    fn check_all(segments: &[Box<dyn MemorySegment>], base: u8) -> Result<bool> {
        for (i, seg) in segments.iter().enumerate() {
            if !seg.check(base.wrapping_add(i as u8))? {
                log::error!("buffer {i} does not hold pattern {:#04x}", base.wrapping_add(i as u8));
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn local_snapshot(&self) -> Result<Vec<Vec<u8>>> {
        self.local_mem.iter().map(|seg| seg.snapshot()).collect()
    }

    pub fn xfer_snapshot(&self) -> Result<Vec<Vec<u8>>> {
        self.xfer_mem.iter().map(|seg| seg.snapshot()).collect()
    }

    /// Moves every descriptor once and, when notifications are on, checks
    /// that exactly one arrived.
    pub fn transfer(&self, op: XferOp) -> Result<u64> {
        let moved = self.orchestrator.transfer(
            op,
            &self.local_descs,
            &self.xfer_descs,
            &self.opt_args,
        )?;
        if self.opt_args.has_notif {
            self.verify_notif()?;
        }
        Ok(moved)
    }

    pub fn verify_notif(&self) -> Result<()> {
        let notifs = self.orchestrator.wait_notifs(1)?;
        if notifs.len() != 1 {
            return Err(TransferError::backend(format!(
                "expected 1 notification, got {}",
                notifs.len()
            )));
        }
        let notif = &notifs[0];
        let sender = self.orchestrator.initiator().local_agent();
        if notif.sender != sender {
            return Err(TransferError::backend(format!(
                "expected notification from {sender}, got {}",
                notif.sender
            )));
        }
        if notif.message != self.opt_args.notif_msg {
            return Err(TransferError::backend(format!(
                "expected notification message {:?}, got {:?}",
                self.opt_args.notif_msg, notif.message
            )));
        }
        log::debug!("notification `{}` from {}", notif.message, notif.sender);
        Ok(())
    }

    /// Releases everything in reverse setup order, collecting every failure.
    pub fn close(self) -> Result<()> {
        let Self {
            loaded,
            orchestrator,
            local_regs,
            xfer_regs,
            mut local_mem,
            mut xfer_mem,
            ..
        } = self;

        let mut teardown = Teardown::new();
        for guard in loaded {
            teardown.record("unload_md", guard.release());
        }
        teardown.record("disconnect", orchestrator.close());
        for (guard, seg) in local_regs.into_iter().zip(local_mem.iter_mut()) {
            teardown.record("deregister local", guard.release());
            seg.detach_md();
        }
        for (guard, seg) in xfer_regs.into_iter().zip(xfer_mem.iter_mut()) {
            teardown.record("deregister xfer", guard.release());
            seg.detach_md();
        }
        for seg in local_mem.iter_mut().chain(xfer_mem.iter_mut()) {
            seg.deallocate();
        }
        teardown.finish()
    }
}
