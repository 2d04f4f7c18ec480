//! Shared fixtures for the backend integration tests.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use rand::Rng;
use xferlink_transfer::{BackendEngine, BackendInitParams, BlobDesc, create_backend};

pub const LOCAL_AGENT: &str = "Agent1";
pub const REMOTE_AGENT: &str = "Agent2";
pub const TEST_BUCKET: &str = "xferlink-test-bucket";

pub fn init() {
    xferlink_transfer::init_logging();
}

pub fn dram_engine(agent: &str) -> Arc<dyn BackendEngine> {
    create_backend(&BackendInitParams::new(agent, "DRAM")).expect("DRAM engine")
}

pub fn dram_engine_with_progress_thread(agent: &str) -> Arc<dyn BackendEngine> {
    let params =
        BackendInitParams::new(agent, "DRAM").with_progress_thread(Duration::from_micros(100));
    create_backend(&params).expect("DRAM engine")
}

pub fn obj_params(agent: &str) -> BackendInitParams {
    BackendInitParams::new(agent, "OBJ")
        .with_param("bucket", TEST_BUCKET)
        .with_param("num_threads", "2")
}

pub fn obj_engine(agent: &str) -> Arc<dyn BackendEngine> {
    create_backend(&obj_params(agent)).expect("OBJ engine")
}

/// Lends `buf` for registration. Callers keep `buf` alive and untouched
/// until its registrations are gone.
pub fn lend(buf: &mut [u8], dev_id: u64) -> BlobDesc {
    // SAFETY: see above; every test upholds it.
    unsafe { BlobDesc::host(buf.as_mut_ptr(), buf.len(), dev_id) }
}

/// Random payload for data-integrity checks.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut payload = vec![0_u8; len];
    rng.fill(&mut payload[..]);
    payload
}
