//! In-process loopback transport used by the DRAM backend to reach peers.
//!
//! Every engine attaches one endpoint. An endpoint owns a notification inbox
//! and the table of regions its engine has published for remote access.
//! Initiators check and copy remote regions while holding that table's lock,
//! and retraction takes the same lock, so a region deregistered after
//! `load_remote_md` fails the transfer instead of touching freed memory.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    endpoint::EndpointAddress,
    error::{Result, TransferError},
    notif::NotifQueue,
};

static GLOBAL_FABRIC: OnceLock<Fabric> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PublishedRegion {
    base: u64,
    len: u64,
}

#[derive(Default)]
pub(crate) struct PublishedRegions(HashMap<u64, PublishedRegion>);

impl PublishedRegions {
    /// True when `[addr, addr + len)` lies inside the published region.
    pub(crate) fn covers(&self, region_key: u64, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.0.get(&region_key).is_some_and(|region| {
            region
                .base
                .checked_add(region.len)
                .is_some_and(|region_end| addr >= region.base && end <= region_end)
        })
    }
}

pub(crate) struct FabricEndpoint {
    addr: EndpointAddress,
    inbox: NotifQueue,
    regions: Mutex<PublishedRegions>,
}

impl FabricEndpoint {
    pub(crate) fn addr(&self) -> &EndpointAddress {
        &self.addr
    }

    pub(crate) fn inbox(&self) -> &NotifQueue {
        &self.inbox
    }

    pub(crate) fn publish(&self, region_key: u64, base: u64, len: u64) {
        self.regions
            .lock()
            .0
            .insert(region_key, PublishedRegion { base, len });
    }

    pub(crate) fn retract(&self, region_key: u64) {
        self.regions.lock().0.remove(&region_key);
    }

    pub(crate) fn retract_all(&self) {
        self.regions.lock().0.clear();
    }

    /// Runs `f` with the region table locked. Nothing can be retracted until
    /// `f` returns. The table lock is a leaf: `f` must not call back into an
    /// engine.
    pub(crate) fn with_regions<R>(&self, f: impl FnOnce(&PublishedRegions) -> R) -> R {
        f(&self.regions.lock())
    }
}

#[derive(Default)]
pub(crate) struct Fabric {
    next_endpoint_id: AtomicU64,
    endpoints: Mutex<HashMap<u64, Arc<FabricEndpoint>>>,
}

impl Fabric {
    pub(crate) fn global() -> &'static Fabric {
        GLOBAL_FABRIC.get_or_init(Fabric::default)
    }

    pub(crate) fn attach(&self, agent: &str) -> Result<Arc<FabricEndpoint>> {
        let endpoint_id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed) + 1;
        let addr = EndpointAddress::from_parts(endpoint_id, agent).ok_or_else(|| {
            TransferError::invalid(format!(
                "agent name must be 1..={} bytes",
                EndpointAddress::MAX_AGENT_BYTES
            ))
        })?;
        let endpoint = Arc::new(FabricEndpoint {
            addr,
            inbox: NotifQueue::new(),
            regions: Mutex::new(PublishedRegions::default()),
        });
        self.endpoints
            .lock()
            .insert(endpoint_id, Arc::clone(&endpoint));
        log::debug!("fabric endpoint attached: {}", endpoint.addr);
        Ok(endpoint)
    }

    pub(crate) fn detach(&self, endpoint_id: u64) {
        if let Some(endpoint) = self.endpoints.lock().remove(&endpoint_id) {
            log::debug!("fabric endpoint detached: {}", endpoint.addr);
        }
    }

    pub(crate) fn lookup(&self, endpoint_id: u64) -> Option<Arc<FabricEndpoint>> {
        self.endpoints.lock().get(&endpoint_id).cloned()
    }
}
