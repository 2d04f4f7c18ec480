use std::{collections::HashMap, fmt, time::Duration};

use crate::error::Status;

const DEFAULT_PROG_TH_DELAY: Duration = Duration::from_micros(100);

/// Locking discipline requested by the caller. Backends guard their state
/// with a mutex in every mode; the value is carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSync {
    None,
    #[default]
    ReadWrite,
    Strict,
}

/// Parameters handed to a backend at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInitParams {
    pub local_agent: String,
    pub backend_type: String,
    pub custom_params: HashMap<String, String>,
    pub enable_prog_th: bool,
    pub prog_th_delay: Duration,
    pub sync_mode: ThreadSync,
}

impl BackendInitParams {
    pub fn new(local_agent: impl Into<String>, backend_type: impl Into<String>) -> Self {
        Self {
            local_agent: local_agent.into(),
            backend_type: backend_type.into(),
            custom_params: HashMap::new(),
            enable_prog_th: false,
            prog_th_delay: DEFAULT_PROG_TH_DELAY,
            sync_mode: ThreadSync::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_params.insert(key.into(), value.into());
        self
    }

    pub fn with_progress_thread(mut self, delay: Duration) -> Self {
        self.enable_prog_th = true;
        self.prog_th_delay = delay;
        self
    }

    pub(crate) fn param(&self, key: &str) -> Option<&str> {
        self.custom_params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XferOp {
    Read,
    Write,
}

impl fmt::Display for XferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferOp::Read => f.write_str("READ"),
            XferOp::Write => f.write_str("WRITE"),
        }
    }
}

/// Optional per-transfer arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferOptArgs {
    pub has_notif: bool,
    pub notif_msg: String,
}

impl XferOptArgs {
    pub fn with_notif(msg: impl Into<String>) -> Self {
        Self {
            has_notif: true,
            notif_msg: msg.into(),
        }
    }
}

/// Non-error outcome of `post_xfer` / `check_xfer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    Done,
    InProgress,
}

impl XferStatus {
    pub fn status(self) -> Status {
        match self {
            XferStatus::Done => Status::Success,
            XferStatus::InProgress => Status::InProgress,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackendInitParams, ThreadSync, XferOptArgs, XferStatus};
    use crate::error::Status;

    #[test]
    fn init_params_defaults() {
        let params = BackendInitParams::new("Agent1", "DRAM");
        assert_eq!(params.local_agent, "Agent1");
        assert_eq!(params.backend_type, "DRAM");
        assert!(!params.enable_prog_th);
        assert_eq!(params.sync_mode, ThreadSync::ReadWrite);
        assert!(params.custom_params.is_empty());
    }

    #[test]
    fn init_params_builders() {
        let params = BackendInitParams::new("Agent1", "OBJ")
            .with_param("bucket", "b1")
            .with_progress_thread(Duration::from_millis(1));
        assert_eq!(params.param("bucket"), Some("b1"));
        assert_eq!(params.param("region"), None);
        assert!(params.enable_prog_th);
        assert_eq!(params.prog_th_delay, Duration::from_millis(1));
    }

    #[test]
    fn notif_args_and_status() {
        let args = XferOptArgs::with_notif("Test");
        assert!(args.has_notif);
        assert_eq!(args.notif_msg, "Test");
        assert!(!XferOptArgs::default().has_notif);
        assert_eq!(XferStatus::Done.status(), Status::Success);
        assert_eq!(XferStatus::InProgress.status(), Status::InProgress);
    }
}
