//! Scoped ownership of backend resources. Each guard releases its resource
//! exactly once: explicitly through `release`, or on drop with the failure
//! logged.

use std::sync::Arc;

use crate::{
    backend::{BackendEngine, LoadedMd, RegisteredMd},
    descriptor::{BlobDesc, MdRef, MemoryKind},
    error::{Result, TeardownErrors, TransferError},
};

pub struct RegistrationGuard {
    engine: Arc<dyn BackendEngine>,
    md: Option<RegisteredMd>,
}

impl RegistrationGuard {
    pub fn register(
        engine: &Arc<dyn BackendEngine>,
        desc: &BlobDesc,
        kind: MemoryKind,
    ) -> Result<Self> {
        let md = engine.register_mem(desc, kind)?;
        Ok(Self {
            engine: Arc::clone(engine),
            md: Some(md),
        })
    }

    pub fn md(&self) -> &RegisteredMd {
        self.md.as_ref().expect("present until released")
    }

    pub fn md_ref(&self) -> MdRef {
        self.md().md_ref()
    }

    pub fn release(mut self) -> Result<()> {
        match self.md.take() {
            Some(md) => self.engine.deregister_mem(md),
            None => Ok(()),
        }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if let Some(md) = self.md.take() {
            if let Err(err) = self.engine.deregister_mem(md) {
                log::warn!("deregister on {} failed: {err}", self.engine.backend_type());
            }
        }
    }
}

pub struct LoadedMdGuard {
    engine: Arc<dyn BackendEngine>,
    md: Option<LoadedMd>,
}

impl LoadedMdGuard {
    pub fn load_local(engine: &Arc<dyn BackendEngine>, md: &RegisteredMd) -> Result<Self> {
        let md = engine.load_local_md(md)?;
        Ok(Self {
            engine: Arc::clone(engine),
            md: Some(md),
        })
    }

    pub fn load_remote(
        engine: &Arc<dyn BackendEngine>,
        desc: &BlobDesc,
        kind: MemoryKind,
        peer: &str,
    ) -> Result<Self> {
        let md = engine.load_remote_md(desc, kind, peer)?;
        Ok(Self {
            engine: Arc::clone(engine),
            md: Some(md),
        })
    }

    pub fn md_ref(&self) -> MdRef {
        self.md.as_ref().expect("present until released").md_ref()
    }

    pub fn release(mut self) -> Result<()> {
        match self.md.take() {
            Some(md) => self.engine.unload_md(md),
            None => Ok(()),
        }
    }
}

impl Drop for LoadedMdGuard {
    fn drop(&mut self) {
        if let Some(md) = self.md.take() {
            if let Err(err) = self.engine.unload_md(md) {
                log::warn!("unload_md on {} failed: {err}", self.engine.backend_type());
            }
        }
    }
}

/// Loaded remote connection info; disconnects from the peer when released.
pub struct ConnectionGuard {
    engine: Arc<dyn BackendEngine>,
    peer: Option<String>,
}

impl ConnectionGuard {
    pub fn connect(engine: &Arc<dyn BackendEngine>, peer: &str, conn_info: &str) -> Result<Self> {
        engine.load_remote_conn_info(peer, conn_info)?;
        Ok(Self {
            engine: Arc::clone(engine),
            peer: Some(peer.to_string()),
        })
    }

    pub fn peer(&self) -> &str {
        self.peer.as_deref().unwrap_or_default()
    }

    pub fn release(mut self) -> Result<()> {
        match self.peer.take() {
            Some(peer) => self.engine.disconnect(&peer),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(err) = self.engine.disconnect(&peer) {
                log::warn!("disconnect from {peer} failed: {err}");
            }
        }
    }
}

/// Runs every release step and reports all failures together.
#[derive(Default)]
pub struct Teardown {
    errors: Vec<TransferError>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(err) = result {
            log::warn!("teardown step `{step}` failed: {err}");
            self.errors.push(err);
        }
    }

    pub fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(TransferError::Teardown(TeardownErrors(self.errors)))
        }
    }
}
