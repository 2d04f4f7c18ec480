use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    api::{BackendInitParams, XferOp, XferOptArgs, XferStatus},
    descriptor::{BlobDesc, DescList, MdRef, MemoryKind},
    dram_backend::DramEngine,
    error::{Result, TransferError},
    notif::Notification,
    obj_backend::ObjEngine,
};

/// Per-descriptor answer of `query_mem`: `None` when nothing backs the key.
pub type QueryResp = Option<HashMap<String, String>>;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_engine_id() -> u64 {
    NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Metadata owned by the engine that registered the region. Only
/// `deregister_mem` on that engine consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct RegisteredMd {
    engine_id: u64,
    md: MdRef,
    kind: MemoryKind,
    dev_id: u64,
}

impl RegisteredMd {
    pub(crate) fn new(engine_id: u64, id: u64, kind: MemoryKind, dev_id: u64) -> Self {
        Self {
            engine_id,
            md: MdRef(id),
            kind,
            dev_id,
        }
    }

    pub fn md_ref(&self) -> MdRef {
        self.md
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn dev_id(&self) -> u64 {
        self.dev_id
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }
}

/// Read-only projection of local or remote metadata, released by `unload_md`.
#[derive(Debug, PartialEq, Eq)]
pub struct LoadedMd {
    engine_id: u64,
    md: MdRef,
    kind: MemoryKind,
}

impl LoadedMd {
    pub(crate) fn new(engine_id: u64, id: u64, kind: MemoryKind) -> Self {
        Self {
            engine_id,
            md: MdRef(id),
            kind,
        }
    }

    pub fn md_ref(&self) -> MdRef {
        self.md
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }
}

/// Per-operation request state. Not reusable: `release_req_h` consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct XferHandle {
    engine_id: u64,
    id: u64,
}

impl XferHandle {
    pub(crate) fn new(engine_id: u64, id: u64) -> Self {
        Self { engine_id, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }
}

pub(crate) fn ensure_owner(engine_id: u64, owner: u64, what: &str) -> Result<()> {
    if engine_id != owner {
        return Err(TransferError::invalid(format!(
            "{what} belongs to engine {owner}, not {engine_id}"
        )));
    }
    Ok(())
}

/// Contract every backend implements. Callers hold engines as
/// `Arc<dyn BackendEngine>` and query capabilities before using the
/// corresponding operations.
pub trait BackendEngine: Send + Sync {
    fn backend_type(&self) -> &str;
    fn local_agent(&self) -> &str;

    fn supports_local(&self) -> bool;
    fn supports_remote(&self) -> bool;
    fn supports_notif(&self) -> bool;
    fn supports_prog_th(&self) -> bool;
    fn supported_mems(&self) -> Vec<MemoryKind>;

    fn register_mem(&self, desc: &BlobDesc, kind: MemoryKind) -> Result<RegisteredMd>;
    fn deregister_mem(&self, md: RegisteredMd) -> Result<()>;

    /// Serialized form of whatever a peer needs to address the region.
    fn get_public_data(&self, _md: &RegisteredMd) -> Result<String> {
        Err(TransferError::Unimplemented("get_public_data"))
    }

    fn get_conn_info(&self) -> Result<String> {
        Err(TransferError::Unimplemented("get_conn_info"))
    }

    fn load_remote_conn_info(&self, _peer: &str, _conn_info: &str) -> Result<()> {
        Err(TransferError::Unimplemented("load_remote_conn_info"))
    }

    fn disconnect(&self, _peer: &str) -> Result<()> {
        Err(TransferError::Unimplemented("disconnect"))
    }

    fn load_local_md(&self, md: &RegisteredMd) -> Result<LoadedMd>;

    fn load_remote_md(&self, _desc: &BlobDesc, _kind: MemoryKind, _peer: &str) -> Result<LoadedMd> {
        Err(TransferError::Unimplemented("load_remote_md"))
    }

    fn unload_md(&self, md: LoadedMd) -> Result<()>;

    fn prep_xfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        peer: &str,
        opt_args: &XferOptArgs,
    ) -> Result<XferHandle>;

    fn post_xfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        peer: &str,
        handle: &XferHandle,
        opt_args: &XferOptArgs,
    ) -> Result<XferStatus>;

    fn check_xfer(&self, handle: &XferHandle) -> Result<XferStatus>;
    fn release_req_h(&self, handle: XferHandle) -> Result<()>;

    /// One cooperative step for engines without a progress thread.
    fn progress(&self) -> Result<()> {
        Ok(())
    }

    fn gen_notif(&self, _peer: &str, _msg: &str) -> Result<()> {
        Err(TransferError::Unimplemented("gen_notif"))
    }

    fn get_notifs(&self) -> Result<Vec<Notification>> {
        Err(TransferError::Unimplemented("get_notifs"))
    }

    fn query_mem(&self, _descs: &[BlobDesc]) -> Result<Vec<QueryResp>> {
        Err(TransferError::Unimplemented("query_mem"))
    }
}

/// Instantiates the backend named by `params.backend_type`.
pub fn create_backend(params: &BackendInitParams) -> Result<Arc<dyn BackendEngine>> {
    match params.backend_type.to_ascii_uppercase().as_str() {
        DramEngine::TYPE => Ok(Arc::new(DramEngine::new(params)?)),
        ObjEngine::TYPE => Ok(Arc::new(ObjEngine::new(params)?)),
        other => Err(TransferError::UnsupportedBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{XferHandle, create_backend, ensure_owner, next_engine_id};
    use crate::{api::BackendInitParams, error::TransferError};

    #[test]
    fn engine_ids_are_unique() {
        let a = next_engine_id();
        let b = next_engine_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ownership_check() {
        let handle = XferHandle::new(4, 1);
        ensure_owner(4, handle.engine_id(), "handle").expect("same engine");
        let err = ensure_owner(5, handle.engine_id(), "handle").expect_err("must fail");
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[test]
    fn factory_creates_known_backends() {
        let dram = create_backend(&BackendInitParams::new("Agent1", "DRAM")).expect("dram");
        assert_eq!(dram.backend_type(), "DRAM");
        assert_eq!(dram.local_agent(), "Agent1");

        let obj = create_backend(
            &BackendInitParams::new("Agent1", "obj").with_param("bucket", "factory-bucket"),
        )
        .expect("obj");
        assert_eq!(obj.backend_type(), "OBJ");
    }

    #[test]
    fn factory_rejects_unknown_backend() {
        let err = create_backend(&BackendInitParams::new("Agent1", "UCX"))
            .err()
            .expect("must fail");
        assert_eq!(err, TransferError::UnsupportedBackend("UCX".to_string()));
    }
}
