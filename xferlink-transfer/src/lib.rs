mod api;
mod backend;
mod config;
mod control_protocol;
mod descriptor;
mod dram_backend;
mod endpoint;
mod error;
mod fabric;
mod guard;
mod logging;
mod notif;
mod obj_backend;
mod obj_client;
mod orchestrator;
mod segment;
mod session;

pub use api::{BackendInitParams, ThreadSync, XferOp, XferOptArgs, XferStatus};
pub use backend::{BackendEngine, LoadedMd, QueryResp, RegisteredMd, XferHandle, create_backend};
pub use config::{BUCKET_ENV, Credentials, ObjConfig, Scheme};
pub use descriptor::{BlobDesc, DescList, MdRef, MemoryKind, MetaDesc};
pub use dram_backend::DramEngine;
pub use endpoint::EndpointAddress;
pub use error::{Result, Status, TeardownErrors, TransferError};
pub use guard::{ConnectionGuard, LoadedMdGuard, RegistrationGuard, Teardown};
pub use notif::{NotifQueue, Notification};
pub use obj_backend::ObjEngine;
pub use obj_client::{GetCallback, InMemoryObjectStore, ObjectClient, PutCallback};
pub use orchestrator::{PollPolicy, TransferOrchestrator};
pub use segment::{DramSegment, MemorySegment, ObjectSegment, new_segment};
pub use session::{
    BUF_SIZE, ENTRY_SIZE, LOCAL_BUF_BYTE, MAX_NUM_BUFS, NOTIF_MSG, NUM_ENTRIES, SessionConfig,
    TransferSession, XFER_BUF_BYTE,
};

pub fn init_logging() {
    logging::ensure_initialized();
}
