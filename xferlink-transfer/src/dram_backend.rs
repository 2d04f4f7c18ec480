use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    api::{BackendInitParams, XferOp, XferOptArgs, XferStatus},
    backend::{BackendEngine, LoadedMd, RegisteredMd, XferHandle, ensure_owner, next_engine_id},
    control_protocol::{ControlMessage, RegionToken, from_wire_string, to_wire_string},
    descriptor::{BlobDesc, DescList, MdRef, MemoryKind, MetaDesc},
    endpoint::EndpointAddress,
    error::{Result, TransferError},
    fabric::{Fabric, FabricEndpoint, PublishedRegions},
    notif::Notification,
};

#[derive(Clone, Copy, Debug)]
struct LocalRegion {
    base: u64,
    len: u64,
    dev_id: u64,
}

impl LocalRegion {
    fn covers(&self, addr: u64, len: u64) -> bool {
        match (addr.checked_add(len), self.base.checked_add(self.len)) {
            (Some(end), Some(region_end)) => addr >= self.base && end <= region_end,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
enum LoadedRegion {
    Local { md_id: u64 },
    Remote { peer: String, token: RegionToken },
}

/// Where an extent's backing registration lives; re-validated at execution.
#[derive(Clone, Copy, Debug)]
enum RegionCheck {
    Local { md_id: u64 },
    Remote { endpoint_id: u64, region_key: u64 },
}

#[derive(Clone, Copy, Debug)]
struct Extent {
    addr: u64,
    check: RegionCheck,
}

#[derive(Clone, Copy, Debug)]
struct CopyOp {
    local: Extent,
    remote: Extent,
    len: u64,
}

struct PendingNotif {
    endpoint_id: u64,
    notif: Notification,
}

enum RequestPhase {
    Prepared,
    Queued,
    Done,
    Failed(TransferError),
}

struct XferRequest {
    op: XferOp,
    phase: RequestPhase,
    copies: Vec<CopyOp>,
    notif: Option<PendingNotif>,
}

#[derive(Default)]
struct DramState {
    registered: HashMap<u64, LocalRegion>,
    loaded: HashMap<u64, LoadedRegion>,
    peers: HashMap<String, EndpointAddress>,
    requests: HashMap<u64, XferRequest>,
    work: VecDeque<u64>,
}

/// Host-memory copy engine. Remote peers are other `DramEngine`s in the same
/// process, reached through the loopback fabric.
pub struct DramEngine {
    engine_id: u64,
    local_agent: String,
    enable_prog_th: bool,
    next_id: AtomicU64,
    endpoint: Arc<FabricEndpoint>,
    state: Arc<Mutex<DramState>>,
}

impl DramEngine {
    pub const TYPE: &'static str = "DRAM";

    pub fn new(params: &BackendInitParams) -> Result<Self> {
        if params.local_agent.trim().is_empty() {
            return Err(TransferError::invalid("local_agent is empty"));
        }
        let endpoint = Fabric::global().attach(&params.local_agent)?;
        let state = Arc::new(Mutex::new(DramState::default()));
        if params.enable_prog_th {
            Self::spawn_progress_loop(Arc::downgrade(&state), params.prog_th_delay);
        }
        log::info!(
            "DRAM backend initialized: agent={}, endpoint={}, progress_thread={}, sync_mode={:?}",
            params.local_agent,
            endpoint.addr(),
            params.enable_prog_th,
            params.sync_mode
        );
        Ok(Self {
            engine_id: next_engine_id(),
            local_agent: params.local_agent.clone(),
            enable_prog_th: params.enable_prog_th,
            next_id: AtomicU64::new(1),
            endpoint,
            state,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_progress_loop(state: Weak<Mutex<DramState>>, delay: Duration) {
        let spawned = thread::Builder::new()
            .name("xferlink-dram-progress".to_string())
            .spawn(move || {
                loop {
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    let completed = Self::run_queued(&state);
                    drop(state);
                    if completed == 0 {
                        thread::sleep(delay);
                    }
                }
                log::debug!("DRAM progress thread exiting");
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn DRAM progress thread: {err}");
        }
    }

    fn peer_endpoint_id(&self, state: &DramState, peer: &str) -> Result<u64> {
        if peer == self.local_agent {
            return Ok(self.endpoint.addr().endpoint_id());
        }
        state
            .peers
            .get(peer)
            .map(EndpointAddress::endpoint_id)
            .ok_or_else(|| TransferError::UnknownPeer(peer.to_string()))
    }

    fn resolve_local(state: &DramState, desc: &MetaDesc) -> Result<Extent> {
        let not_registered = || TransferError::MemoryNotRegistered {
            addr: desc.addr,
            len: desc.len,
        };
        let md_id = match desc.md {
            Some(md) => {
                let region = state.registered.get(&md.raw()).ok_or_else(not_registered)?;
                if !region.covers(desc.addr, desc.len) {
                    return Err(not_registered());
                }
                md.raw()
            }
            None => state
                .registered
                .iter()
                .find(|(_, region)| region.covers(desc.addr, desc.len))
                .map(|(id, _)| *id)
                .ok_or_else(not_registered)?,
        };
        Ok(Extent {
            addr: desc.addr,
            check: RegionCheck::Local { md_id },
        })
    }

    fn resolve_remote(&self, state: &DramState, desc: &MetaDesc, peer: &str) -> Result<Extent> {
        let is_self = peer == self.local_agent;
        let Some(md) = desc.md else {
            if is_self {
                return Self::resolve_local(state, desc);
            }
            return Err(TransferError::MemoryNotRegistered {
                addr: desc.addr,
                len: desc.len,
            });
        };

        match state.loaded.get(&md.raw()) {
            Some(LoadedRegion::Local { md_id }) => {
                if !is_self {
                    return Err(TransferError::invalid(format!(
                        "locally loaded metadata used for peer {peer}"
                    )));
                }
                let desc = MetaDesc::new(desc.addr, desc.len, desc.dev_id).with_md(MdRef(*md_id));
                Self::resolve_local(state, &desc)
            }
            Some(LoadedRegion::Remote { peer: owner, token }) => {
                if owner != peer {
                    return Err(TransferError::invalid(format!(
                        "metadata loaded from {owner} used for peer {peer}"
                    )));
                }
                let region = LocalRegion {
                    base: token.base,
                    len: token.len,
                    dev_id: token.dev_id,
                };
                if !region.covers(desc.addr, desc.len) {
                    return Err(TransferError::MemoryNotRegistered {
                        addr: desc.addr,
                        len: desc.len,
                    });
                }
                Ok(Extent {
                    addr: desc.addr,
                    check: RegionCheck::Remote {
                        endpoint_id: token.endpoint_id,
                        region_key: token.region_key,
                    },
                })
            }
            None if is_self && state.registered.contains_key(&md.raw()) => {
                Self::resolve_local(state, desc)
            }
            None => Err(TransferError::UnknownMetadata(md.raw())),
        }
    }

    fn validate_extent(
        registered: &HashMap<u64, LocalRegion>,
        published: Option<&PublishedRegions>,
        extent: &Extent,
        len: u64,
    ) -> Result<()> {
        let valid = match extent.check {
            RegionCheck::Local { md_id } => registered
                .get(&md_id)
                .is_some_and(|region| region.covers(extent.addr, len)),
            RegionCheck::Remote { region_key, .. } => {
                published.is_some_and(|regions| regions.covers(region_key, extent.addr, len))
            }
        };
        if valid {
            Ok(())
        } else {
            Err(TransferError::MemoryNotRegistered {
                addr: extent.addr,
                len,
            })
        }
    }

    /// The single peer endpoint a request copies to or from, if any.
    fn target_endpoint(copies: &[CopyOp]) -> Result<Option<Arc<FabricEndpoint>>> {
        let mut target = None;
        for copy in copies {
            let RegionCheck::Remote { endpoint_id, .. } = copy.remote.check else {
                continue;
            };
            match target {
                None => target = Some(endpoint_id),
                Some(id) if id == endpoint_id => {}
                Some(id) => {
                    return Err(TransferError::backend(format!(
                        "transfer spans endpoints {id} and {endpoint_id}"
                    )));
                }
            }
        }
        target
            .map(|id| {
                Fabric::global()
                    .lookup(id)
                    .ok_or_else(|| TransferError::UnknownPeer(format!("endpoint {id}")))
            })
            .transpose()
    }

    fn copy_all(
        registered: &HashMap<u64, LocalRegion>,
        published: Option<&PublishedRegions>,
        request: &XferRequest,
    ) -> Result<()> {
        for copy in &request.copies {
            Self::validate_extent(registered, published, &copy.local, copy.len)?;
            Self::validate_extent(registered, published, &copy.remote, copy.len)?;
        }
        for copy in &request.copies {
            let (src, dst) = match request.op {
                XferOp::Write => (copy.local.addr, copy.remote.addr),
                XferOp::Read => (copy.remote.addr, copy.local.addr),
            };
            // SAFETY: both extents lie in lent host regions that are still
            // registered. Local regions cannot be deregistered while the
            // engine state is locked, and the peer's table stays locked for
            // the whole copy. `copy` tolerates overlap for self-transfers.
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, copy.len as usize);
            }
        }
        Ok(())
    }

    fn execute(registered: &HashMap<u64, LocalRegion>, request: &XferRequest) -> Result<()> {
        match Self::target_endpoint(&request.copies)? {
            Some(endpoint) => endpoint
                .with_regions(|published| Self::copy_all(registered, Some(published), request))?,
            None => Self::copy_all(registered, None, request)?,
        }
        if let Some(pending) = &request.notif {
            let endpoint = Fabric::global()
                .lookup(pending.endpoint_id)
                .ok_or_else(|| TransferError::UnknownPeer(format!("endpoint {}", pending.endpoint_id)))?;
            endpoint.inbox().push(pending.notif.clone());
        }
        Ok(())
    }

    /// Executes every queued request. Returns how many were processed.
    fn run_queued(state: &Mutex<DramState>) -> usize {
        let mut guard = state.lock();
        let DramState {
            registered,
            requests,
            work,
            ..
        } = &mut *guard;

        let mut processed = 0;
        while let Some(request_id) = work.pop_front() {
            let Some(request) = requests.get_mut(&request_id) else {
                continue;
            };
            if !matches!(request.phase, RequestPhase::Queued) {
                continue;
            }
            request.phase = match Self::execute(registered, request) {
                Ok(()) => RequestPhase::Done,
                Err(error) => {
                    log::warn!("DRAM transfer {request_id} failed: {error}");
                    RequestPhase::Failed(error)
                }
            };
            processed += 1;
        }
        processed
    }
}

impl Drop for DramEngine {
    fn drop(&mut self) {
        // Taking the lock waits out a progress pass that is still copying.
        let mut state = self.state.lock();
        state.registered.clear();
        state.requests.clear();
        state.work.clear();
        drop(state);
        self.endpoint.retract_all();
        Fabric::global().detach(self.endpoint.addr().endpoint_id());
    }
}

impl BackendEngine for DramEngine {
    fn backend_type(&self) -> &str {
        Self::TYPE
    }

    fn local_agent(&self) -> &str {
        &self.local_agent
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_notif(&self) -> bool {
        true
    }

    fn supports_prog_th(&self) -> bool {
        self.enable_prog_th
    }

    fn supported_mems(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::Dram]
    }

    fn register_mem(&self, desc: &BlobDesc, kind: MemoryKind) -> Result<RegisteredMd> {
        if kind != MemoryKind::Dram {
            return Err(TransferError::invalid(format!(
                "DRAM backend cannot register {kind} memory"
            )));
        }
        desc.check_host_region()?;

        let id = self.next_id();
        self.state.lock().registered.insert(
            id,
            LocalRegion {
                base: desc.addr,
                len: desc.len,
                dev_id: desc.dev_id,
            },
        );
        self.endpoint.publish(id, desc.addr, desc.len);
        log::debug!(
            "registered DRAM region: md={id}, addr={:#x}, len={}, dev_id={}",
            desc.addr,
            desc.len,
            desc.dev_id
        );
        Ok(RegisteredMd::new(self.engine_id, id, kind, desc.dev_id))
    }

    fn deregister_mem(&self, md: RegisteredMd) -> Result<()> {
        ensure_owner(self.engine_id, md.engine_id(), "registered metadata")?;
        let id = md.md_ref().raw();
        if self.state.lock().registered.remove(&id).is_none() {
            return Err(TransferError::UnknownMetadata(id));
        }
        self.endpoint.retract(id);
        Ok(())
    }

    fn get_public_data(&self, md: &RegisteredMd) -> Result<String> {
        ensure_owner(self.engine_id, md.engine_id(), "registered metadata")?;
        let id = md.md_ref().raw();
        let state = self.state.lock();
        let region = state
            .registered
            .get(&id)
            .ok_or(TransferError::UnknownMetadata(id))?;
        Ok(to_wire_string(&ControlMessage::RegionToken(RegionToken {
            endpoint_id: self.endpoint.addr().endpoint_id(),
            region_key: id,
            base: region.base,
            len: region.len,
            dev_id: region.dev_id,
        })))
    }

    fn get_conn_info(&self) -> Result<String> {
        Ok(to_wire_string(&ControlMessage::ConnInfo(
            self.endpoint.addr().clone(),
        )))
    }

    fn load_remote_conn_info(&self, peer: &str, conn_info: &str) -> Result<()> {
        let addr = match from_wire_string(conn_info) {
            Some(ControlMessage::ConnInfo(addr)) => addr,
            Some(other) => {
                return Err(TransferError::MalformedMetadata(format!(
                    "expected conn_info, got {}",
                    other.kind()
                )));
            }
            None => {
                return Err(TransferError::MalformedMetadata(
                    "undecodable connection info".to_string(),
                ));
            }
        };
        if addr.agent() != peer {
            return Err(TransferError::invalid(format!(
                "connection info belongs to {}, not {peer}",
                addr.agent()
            )));
        }
        if Fabric::global().lookup(addr.endpoint_id()).is_none() {
            return Err(TransferError::UnknownPeer(peer.to_string()));
        }

        let mut state = self.state.lock();
        if state.peers.contains_key(peer) {
            return Err(TransferError::invalid(format!("already connected to {peer}")));
        }
        log::info!("{} connected to {}", self.local_agent, addr);
        state.peers.insert(peer.to_string(), addr);
        Ok(())
    }

    fn disconnect(&self, peer: &str) -> Result<()> {
        let removed = self.state.lock().peers.remove(peer);
        match removed {
            Some(addr) => {
                log::info!("{} disconnected from {}", self.local_agent, addr);
                Ok(())
            }
            None => Err(TransferError::UnknownPeer(peer.to_string())),
        }
    }

    fn load_local_md(&self, md: &RegisteredMd) -> Result<LoadedMd> {
        ensure_owner(self.engine_id, md.engine_id(), "registered metadata")?;
        let md_id = md.md_ref().raw();
        let mut state = self.state.lock();
        if !state.registered.contains_key(&md_id) {
            return Err(TransferError::UnknownMetadata(md_id));
        }
        let id = self.next_id();
        state.loaded.insert(id, LoadedRegion::Local { md_id });
        Ok(LoadedMd::new(self.engine_id, id, md.kind()))
    }

    fn load_remote_md(&self, desc: &BlobDesc, kind: MemoryKind, peer: &str) -> Result<LoadedMd> {
        if kind != MemoryKind::Dram {
            return Err(TransferError::invalid(format!(
                "DRAM backend cannot load {kind} metadata"
            )));
        }
        let token = match from_wire_string(&desc.meta_info) {
            Some(ControlMessage::RegionToken(token)) => token,
            _ => {
                return Err(TransferError::MalformedMetadata(format!(
                    "invalid region token from {peer}"
                )));
            }
        };

        let mut state = self.state.lock();
        let peer_endpoint = state
            .peers
            .get(peer)
            .map(EndpointAddress::endpoint_id)
            .ok_or_else(|| TransferError::UnknownPeer(peer.to_string()))?;
        if token.endpoint_id != peer_endpoint {
            return Err(TransferError::MalformedMetadata(format!(
                "region token was issued by endpoint {}, not {peer}",
                token.endpoint_id
            )));
        }
        let id = self.next_id();
        state.loaded.insert(
            id,
            LoadedRegion::Remote {
                peer: peer.to_string(),
                token,
            },
        );
        Ok(LoadedMd::new(self.engine_id, id, kind))
    }

    fn unload_md(&self, md: LoadedMd) -> Result<()> {
        ensure_owner(self.engine_id, md.engine_id(), "loaded metadata")?;
        let id = md.md_ref().raw();
        match self.state.lock().loaded.remove(&id) {
            Some(_) => Ok(()),
            None => Err(TransferError::UnknownMetadata(id)),
        }
    }

    fn prep_xfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        peer: &str,
        _opt_args: &XferOptArgs,
    ) -> Result<XferHandle> {
        if local.kind() != MemoryKind::Dram || remote.kind() != MemoryKind::Dram {
            return Err(TransferError::UnsupportedPairing {
                local: local.kind().to_string(),
                remote: remote.kind().to_string(),
            });
        }
        DescList::check_pairing(local, remote)?;

        let mut state = self.state.lock();
        self.peer_endpoint_id(&state, peer)?;
        let id = self.next_id();
        state.requests.insert(
            id,
            XferRequest {
                op,
                phase: RequestPhase::Prepared,
                copies: Vec::new(),
                notif: None,
            },
        );
        Ok(XferHandle::new(self.engine_id, id))
    }

    fn post_xfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        peer: &str,
        handle: &XferHandle,
        opt_args: &XferOptArgs,
    ) -> Result<XferStatus> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        let mut state = self.state.lock();
        match state.requests.get(&handle.id()) {
            Some(XferRequest {
                phase: RequestPhase::Prepared,
                op: prepared,
                ..
            }) => {
                if *prepared != op {
                    return Err(TransferError::invalid(format!(
                        "handle was prepared for {prepared}, posted as {op}"
                    )));
                }
            }
            Some(_) => return Err(TransferError::invalid("transfer handle already posted")),
            None => return Err(TransferError::invalid("unknown transfer handle")),
        }

        let resolved = (|| -> Result<(Vec<CopyOp>, Option<PendingNotif>)> {
            DescList::check_pairing(local, remote)?;
            let mut copies = Vec::with_capacity(local.len());
            for (l, r) in local.iter().zip(remote.iter()) {
                copies.push(CopyOp {
                    local: Self::resolve_local(&state, l)?,
                    remote: self.resolve_remote(&state, r, peer)?,
                    len: l.len,
                });
            }
            let notif = if opt_args.has_notif {
                Some(PendingNotif {
                    endpoint_id: self.peer_endpoint_id(&state, peer)?,
                    notif: Notification::new(&self.local_agent, &opt_args.notif_msg),
                })
            } else {
                None
            };
            Ok((copies, notif))
        })();

        let Some(request) = state.requests.get_mut(&handle.id()) else {
            return Err(TransferError::invalid("unknown transfer handle"));
        };
        match resolved {
            Ok((copies, notif)) => {
                request.copies = copies;
                request.notif = notif;
                request.phase = RequestPhase::Queued;
                state.work.push_back(handle.id());
                log::debug!(
                    "posted DRAM {op}: handle={}, entries={}, bytes={}, peer={peer}",
                    handle.id(),
                    local.len(),
                    local.total_len()
                );
                Ok(XferStatus::InProgress)
            }
            Err(error) => {
                request.phase = RequestPhase::Failed(error.clone());
                Err(error)
            }
        }
    }

    fn check_xfer(&self, handle: &XferHandle) -> Result<XferStatus> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        let state = self.state.lock();
        match state.requests.get(&handle.id()).map(|request| &request.phase) {
            Some(RequestPhase::Done) => Ok(XferStatus::Done),
            Some(RequestPhase::Queued) => Ok(XferStatus::InProgress),
            Some(RequestPhase::Failed(error)) => Err(error.clone()),
            Some(RequestPhase::Prepared) => Err(TransferError::invalid("transfer not posted")),
            None => Err(TransferError::invalid("unknown transfer handle")),
        }
    }

    fn release_req_h(&self, handle: XferHandle) -> Result<()> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        let mut state = self.state.lock();
        let Some(request) = state.requests.remove(&handle.id()) else {
            return Err(TransferError::invalid("unknown transfer handle"));
        };
        if matches!(request.phase, RequestPhase::Queued) {
            log::debug!("abandoning in-flight DRAM transfer {}", handle.id());
            state.work.retain(|id| *id != handle.id());
        }
        Ok(())
    }

    fn progress(&self) -> Result<()> {
        Self::run_queued(&self.state);
        Ok(())
    }

    fn gen_notif(&self, peer: &str, msg: &str) -> Result<()> {
        let endpoint_id = self.peer_endpoint_id(&self.state.lock(), peer)?;
        let endpoint = Fabric::global()
            .lookup(endpoint_id)
            .ok_or_else(|| TransferError::UnknownPeer(peer.to_string()))?;
        endpoint
            .inbox()
            .push(Notification::new(&self.local_agent, msg));
        Ok(())
    }

    fn get_notifs(&self) -> Result<Vec<Notification>> {
        Ok(self.endpoint.inbox().drain())
    }
}
