use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    api::{BackendInitParams, XferOp, XferOptArgs, XferStatus},
    backend::{
        BackendEngine, LoadedMd, QueryResp, RegisteredMd, XferHandle, ensure_owner,
        next_engine_id,
    },
    config::ObjConfig,
    descriptor::{BlobDesc, DescList, MemoryKind, MetaDesc},
    error::{Result, TransferError},
    obj_client::{InMemoryObjectStore, ObjectClient},
};

#[derive(Clone, Copy, Debug)]
struct HostRegion {
    base: u64,
    len: u64,
}

impl HostRegion {
    fn covers(&self, desc: &MetaDesc) -> bool {
        match (desc.end(), self.base.checked_add(self.len)) {
            (Some(end), Some(region_end)) => desc.addr >= self.base && end <= region_end,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
enum Registration {
    Host(HostRegion),
    Object { dev_id: u64, key: String },
}

enum Outcome {
    Put(bool),
    Get(Option<Bytes>),
}

type Slot = Arc<Mutex<Option<Outcome>>>;

struct PendingOp {
    key: String,
    local_addr: u64,
    len: u64,
    slot: Slot,
}

enum RequestPhase {
    Prepared,
    Posted(Vec<PendingOp>),
    Done,
    Failed(TransferError),
}

struct ObjRequest {
    op: XferOp,
    phase: RequestPhase,
}

#[derive(Default)]
struct ObjState {
    registered: HashMap<u64, Registration>,
    keys: HashMap<u64, String>,
    loaded: HashMap<u64, u64>,
    requests: HashMap<u64, ObjRequest>,
}

impl ObjState {
    fn host_region(&self, md_id: u64) -> Option<HostRegion> {
        let md_id = self.loaded.get(&md_id).copied().unwrap_or(md_id);
        match self.registered.get(&md_id) {
            Some(Registration::Host(region)) => Some(*region),
            _ => None,
        }
    }

    fn check_host(&self, desc: &MetaDesc) -> Result<()> {
        let covered = match desc.md {
            Some(md) => self
                .host_region(md.raw())
                .is_some_and(|region| region.covers(desc)),
            None => self.registered.values().any(|registration| {
                matches!(registration, Registration::Host(region) if region.covers(desc))
            }),
        };
        if covered {
            Ok(())
        } else {
            Err(TransferError::MemoryNotRegistered {
                addr: desc.addr,
                len: desc.len,
            })
        }
    }

    fn key_for(&self, dev_id: u64) -> Result<&str> {
        self.keys
            .get(&dev_id)
            .map(String::as_str)
            .ok_or_else(|| TransferError::backend(format!("no object key registered for dev_id {dev_id}")))
    }
}

/// Local-only engine that moves host buffers to and from an object store.
pub struct ObjEngine {
    engine_id: u64,
    local_agent: String,
    config: ObjConfig,
    client: Arc<dyn ObjectClient>,
    next_id: AtomicU64,
    state: Mutex<ObjState>,
}

impl ObjEngine {
    pub const TYPE: &'static str = "OBJ";

    pub fn new(params: &BackendInitParams) -> Result<Self> {
        let config = ObjConfig::from_params(params)?;
        let client = Arc::new(InMemoryObjectStore::new(config.num_threads)?);
        Self::build(params, config, client)
    }

    /// Builds the engine on top of a caller-supplied client.
    pub fn with_client(params: &BackendInitParams, client: Arc<dyn ObjectClient>) -> Result<Self> {
        let config = ObjConfig::from_params(params)?;
        Self::build(params, config, client)
    }

    fn build(
        params: &BackendInitParams,
        config: ObjConfig,
        client: Arc<dyn ObjectClient>,
    ) -> Result<Self> {
        if params.local_agent.trim().is_empty() {
            return Err(TransferError::invalid("local_agent is empty"));
        }
        log::info!(
            "OBJ backend initialized: agent={}, bucket={}, endpoint={:?}, scheme={:?}, threads={}",
            params.local_agent,
            config.bucket,
            config.endpoint_override,
            config.scheme,
            config.num_threads
        );
        Ok(Self {
            engine_id: next_engine_id(),
            local_agent: params.local_agent.clone(),
            config,
            client,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ObjState::default()),
        })
    }

    pub fn config(&self) -> &ObjConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn object_key(desc: &BlobDesc) -> String {
        if desc.meta_info.is_empty() {
            desc.dev_id.to_string()
        } else {
            desc.meta_info.clone()
        }
    }

    fn submit(&self, op: XferOp, key: &str, local: &MetaDesc, offset: u64) -> PendingOp {
        let slot: Slot = Arc::new(Mutex::new(None));
        let done = Arc::clone(&slot);
        match op {
            XferOp::Write => {
                // SAFETY: the local extent lies in a lent host region checked
                // under the state lock, which the caller still holds.
                let data = unsafe {
                    Bytes::copy_from_slice(std::slice::from_raw_parts(
                        local.addr as *const u8,
                        local.len as usize,
                    ))
                };
                self.client.put_object(
                    key,
                    data,
                    offset,
                    Box::new(move |ok| *done.lock() = Some(Outcome::Put(ok))),
                );
            }
            XferOp::Read => {
                self.client.get_object(
                    key,
                    offset,
                    local.len,
                    Box::new(move |data| *done.lock() = Some(Outcome::Get(data))),
                );
            }
        }
        PendingOp {
            key: key.to_string(),
            local_addr: local.addr,
            len: local.len,
            slot,
        }
    }

    /// Applies finished outcomes. Reads land in host memory only here, on the
    /// caller's thread.
    fn complete(state: &ObjState, pending: &[PendingOp]) -> Result<()> {
        for op in pending {
            let mut outcome = op.slot.lock();
            match outcome.take() {
                Some(Outcome::Put(true)) => {}
                Some(Outcome::Put(false)) => {
                    return Err(TransferError::backend(format!("put of `{}` failed", op.key)));
                }
                Some(Outcome::Get(None)) => {
                    return Err(TransferError::backend(format!("get of `{}` failed", op.key)));
                }
                Some(Outcome::Get(Some(data))) => {
                    if data.len() as u64 != op.len {
                        return Err(TransferError::backend(format!(
                            "short read of `{}`: {} of {} bytes",
                            op.key,
                            data.len(),
                            op.len
                        )));
                    }
                    state.check_host(&MetaDesc::new(op.local_addr, op.len, 0))?;
                    // SAFETY: the destination lies in a lent host region that
                    // is still registered, and `data` is exactly `op.len` bytes.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            data.as_ptr(),
                            op.local_addr as *mut u8,
                            data.len(),
                        );
                    }
                }
                None => {
                    return Err(TransferError::backend(format!(
                        "request for `{}` has not completed",
                        op.key
                    )));
                }
            }
        }
        Ok(())
    }
}

impl BackendEngine for ObjEngine {
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
        false
    }

    fn supports_notif(&self) -> bool {
        false
    }

    fn supports_prog_th(&self) -> bool {
        false
    }

    fn supported_mems(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::Object, MemoryKind::Dram]
    }

    fn register_mem(&self, desc: &BlobDesc, kind: MemoryKind) -> Result<RegisteredMd> {
        let registration = match kind {
            MemoryKind::Dram => {
                desc.check_host_region()?;
                Registration::Host(HostRegion {
                    base: desc.addr,
                    len: desc.len,
                })
            }
            MemoryKind::Object => Registration::Object {
                dev_id: desc.dev_id,
                key: Self::object_key(desc),
            },
            other => {
                return Err(TransferError::invalid(format!(
                    "OBJ backend cannot register {other} memory"
                )));
            }
        };

        let id = self.next_id();
        let mut state = self.state.lock();
        if let Registration::Object { dev_id, key } = &registration {
            log::debug!("bound dev_id {dev_id} to object key `{key}`");
            if let Some(previous) = state.keys.insert(*dev_id, key.clone()) {
                log::debug!("dev_id {dev_id} rebound, previous key `{previous}`");
            }
        }
        state.registered.insert(id, registration);
        Ok(RegisteredMd::new(self.engine_id, id, kind, desc.dev_id))
    }

    fn deregister_mem(&self, md: RegisteredMd) -> Result<()> {
        ensure_owner(self.engine_id, md.engine_id(), "registered metadata")?;
        let id = md.md_ref().raw();
        let mut state = self.state.lock();
        match state.registered.remove(&id) {
            Some(Registration::Object { dev_id, key }) => {
                // The newest surviving registration for this dev_id owns it.
                let survivor = state
                    .registered
                    .iter()
                    .filter_map(|(id, registration)| match registration {
                        Registration::Object {
                            dev_id: other,
                            key: other_key,
                        } if *other == dev_id => Some((*id, other_key.clone())),
                        _ => None,
                    })
                    .max_by_key(|(id, _)| *id);
                match survivor {
                    Some((_, surviving_key)) => {
                        if surviving_key != key {
                            log::debug!("dev_id {dev_id} rebound from `{key}` to `{surviving_key}`");
                        }
                        state.keys.insert(dev_id, surviving_key);
                    }
                    None => {
                        state.keys.remove(&dev_id);
                    }
                }
                Ok(())
            }
            Some(Registration::Host(_)) => Ok(()),
            None => Err(TransferError::UnknownMetadata(id)),
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
        state.loaded.insert(id, md_id);
        Ok(LoadedMd::new(self.engine_id, id, md.kind()))
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
        if local.kind() != MemoryKind::Dram || remote.kind() != MemoryKind::Object {
            return Err(TransferError::UnsupportedPairing {
                local: local.kind().to_string(),
                remote: remote.kind().to_string(),
            });
        }
        if peer != self.local_agent {
            return Err(TransferError::invalid(format!(
                "OBJ backend is local-only: peer {peer} is not {}",
                self.local_agent
            )));
        }
        DescList::check_pairing(local, remote)?;

        let id = self.next_id();
        self.state.lock().requests.insert(
            id,
            ObjRequest {
                op,
                phase: RequestPhase::Prepared,
            },
        );
        Ok(XferHandle::new(self.engine_id, id))
    }

    fn post_xfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        _peer: &str,
        handle: &XferHandle,
        _opt_args: &XferOptArgs,
    ) -> Result<XferStatus> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        let mut state = self.state.lock();
        match state.requests.get(&handle.id()) {
            Some(ObjRequest {
                phase: RequestPhase::Prepared,
                op: prepared,
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

        let resolved = (|| -> Result<Vec<(String, MetaDesc, u64)>> {
            DescList::check_pairing(local, remote)?;
            local
                .iter()
                .zip(remote.iter())
                .map(|(l, r)| {
                    state.check_host(l)?;
                    Ok((state.key_for(r.dev_id)?.to_string(), *l, r.addr))
                })
                .collect()
        })();

        let plan = match resolved {
            Ok(plan) => plan,
            Err(error) => {
                if let Some(request) = state.requests.get_mut(&handle.id()) {
                    request.phase = RequestPhase::Failed(error.clone());
                }
                return Err(error);
            }
        };

        let pending: Vec<PendingOp> = plan
            .iter()
            .map(|(key, local, offset)| self.submit(op, key, local, *offset))
            .collect();
        if let Some(request) = state.requests.get_mut(&handle.id()) {
            request.phase = RequestPhase::Posted(pending);
        }
        log::debug!(
            "posted OBJ {op}: handle={}, objects={}, bytes={}",
            handle.id(),
            local.len(),
            local.total_len()
        );
        Ok(XferStatus::InProgress)
    }

    fn check_xfer(&self, handle: &XferHandle) -> Result<XferStatus> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        let mut state = self.state.lock();
        let Some(mut request) = state.requests.remove(&handle.id()) else {
            return Err(TransferError::invalid("unknown transfer handle"));
        };
        let (phase, result) = match request.phase {
            RequestPhase::Done => (RequestPhase::Done, Ok(XferStatus::Done)),
            RequestPhase::Failed(error) => (RequestPhase::Failed(error.clone()), Err(error)),
            RequestPhase::Prepared => (
                RequestPhase::Prepared,
                Err(TransferError::invalid("transfer not posted")),
            ),
            RequestPhase::Posted(pending) => {
                if pending.iter().any(|op| op.slot.lock().is_none()) {
                    (RequestPhase::Posted(pending), Ok(XferStatus::InProgress))
                } else {
                    match Self::complete(&state, &pending) {
                        Ok(()) => (RequestPhase::Done, Ok(XferStatus::Done)),
                        Err(error) => {
                            log::warn!("OBJ {} {} failed: {error}", request.op, handle.id());
                            (RequestPhase::Failed(error.clone()), Err(error))
                        }
                    }
                }
            }
        };
        request.phase = phase;
        state.requests.insert(handle.id(), request);
        result
    }

    fn release_req_h(&self, handle: XferHandle) -> Result<()> {
        ensure_owner(self.engine_id, handle.engine_id(), "transfer handle")?;
        match self.state.lock().requests.remove(&handle.id()) {
            Some(ObjRequest {
                phase: RequestPhase::Posted(_),
                ..
            }) => {
                log::debug!("abandoning in-flight OBJ transfer {}", handle.id());
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(TransferError::invalid("unknown transfer handle")),
        }
    }

    fn query_mem(&self, descs: &[BlobDesc]) -> Result<Vec<QueryResp>> {
        descs
            .iter()
            .map(|desc| {
                let key = Self::object_key(desc);
                let exists = self.client.object_exists(&key)?;
                Ok(exists.then(|| HashMap::from([("key".to_string(), key)])))
            })
            .collect()
    }
}
