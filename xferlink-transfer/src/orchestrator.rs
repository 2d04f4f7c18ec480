use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    api::{XferOp, XferOptArgs, XferStatus},
    backend::{BackendEngine, XferHandle},
    descriptor::{DescList, MemoryKind},
    error::{Result, TransferError},
    guard::ConnectionGuard,
    notif::Notification,
};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(3);
const DEFAULT_BACKOFF: Duration = Duration::from_micros(50);

/// Bounds every polling loop the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub deadline: Duration,
    pub backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Drives transfers from an initiator engine to a target, which is the same
/// engine for local transfers.
pub struct TransferOrchestrator {
    initiator: Arc<dyn BackendEngine>,
    target: Arc<dyn BackendEngine>,
    peer: String,
    connection: Option<ConnectionGuard>,
    policy: PollPolicy,
}

impl TransferOrchestrator {
    pub fn local(engine: Arc<dyn BackendEngine>) -> Result<Self> {
        if !engine.supports_local() {
            return Err(TransferError::UnsupportedOperation("local transfers"));
        }
        Ok(Self {
            peer: engine.local_agent().to_string(),
            target: Arc::clone(&engine),
            initiator: engine,
            connection: None,
            policy: PollPolicy::default(),
        })
    }

    /// Exchanges connection info so `initiator` can reach `target`.
    pub fn remote(
        initiator: Arc<dyn BackendEngine>,
        target: Arc<dyn BackendEngine>,
    ) -> Result<Self> {
        if !initiator.supports_remote() {
            return Err(TransferError::UnsupportedOperation("remote transfers"));
        }
        let conn_info = target.get_conn_info()?;
        let peer = target.local_agent().to_string();
        let connection = ConnectionGuard::connect(&initiator, &peer, &conn_info)?;
        log::info!(
            "{} connected to {peer} over {}",
            initiator.local_agent(),
            initiator.backend_type()
        );
        Ok(Self {
            initiator,
            target,
            peer,
            connection: Some(connection),
            policy: PollPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn initiator(&self) -> &Arc<dyn BackendEngine> {
        &self.initiator
    }

    pub fn target(&self) -> &Arc<dyn BackendEngine> {
        &self.target
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_remote(&self) -> bool {
        self.connection.is_some()
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn check_kinds(&self, local: MemoryKind, remote: MemoryKind) -> Result<()> {
        let initiator_mems = self.initiator.supported_mems();
        let target_mems = self.target.supported_mems();
        if !initiator_mems.contains(&local)
            || !initiator_mems.contains(&remote)
            || !target_mems.contains(&remote)
        {
            return Err(TransferError::UnsupportedPairing {
                local: local.to_string(),
                remote: remote.to_string(),
            });
        }
        Ok(())
    }

    /// Runs one prep, post, poll, release cycle. Returns bytes moved.
    pub fn transfer(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        opt_args: &XferOptArgs,
    ) -> Result<u64> {
        self.check_kinds(local.kind(), remote.kind())?;
        if opt_args.has_notif && !self.initiator.supports_notif() {
            return Err(TransferError::UnsupportedOperation("notifications"));
        }

        let started_at = Instant::now();
        let handle = self
            .initiator
            .prep_xfer(op, local, remote, &self.peer, opt_args)?;
        let outcome = self.drive(op, local, remote, &handle, opt_args);
        let released = self.initiator.release_req_h(handle);

        match (outcome, released) {
            (Err(err), Err(release_err)) => {
                log::warn!("release after failed {op} also failed: {release_err}");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(release_err)) => Err(release_err),
            (Ok(()), Ok(())) => {
                let transferred = local.total_len();
                let elapsed_secs = started_at.elapsed().as_secs_f64();
                if elapsed_secs > 0.0 {
                    let gbps = (transferred as f64 * 8.0) / elapsed_secs / 1e9;
                    let gib_per_sec =
                        (transferred as f64) / elapsed_secs / (1024.0 * 1024.0 * 1024.0);
                    log::debug!(
                        "{op} e2e bandwidth: backend={}, bytes={}, entries={}, elapsed_ms={:.3}, bw_gbps={:.3}, bw_gibps={:.3}",
                        self.initiator.backend_type(),
                        transferred,
                        local.len(),
                        elapsed_secs * 1000.0,
                        gbps,
                        gib_per_sec
                    );
                }
                Ok(transferred)
            }
        }
    }

    fn drive(
        &self,
        op: XferOp,
        local: &DescList,
        remote: &DescList,
        handle: &XferHandle,
        opt_args: &XferOptArgs,
    ) -> Result<()> {
        let mut status =
            self.initiator
                .post_xfer(op, local, remote, &self.peer, handle, opt_args)?;
        let deadline = Instant::now() + self.policy.deadline;
        while status == XferStatus::InProgress {
            if Instant::now() >= deadline {
                log::error!(
                    "{op} handle {} still in progress after {:?}",
                    handle.id(),
                    self.policy.deadline
                );
                return Err(TransferError::Timeout(self.policy.deadline));
            }
            self.pump()?;
            status = self.initiator.check_xfer(handle)?;
            if status == XferStatus::InProgress && !self.policy.backoff.is_zero() {
                thread::sleep(self.policy.backoff);
            }
        }
        Ok(())
    }

    /// One cooperative step on every participant without a progress thread.
    fn pump(&self) -> Result<()> {
        if !self.initiator.supports_prog_th() {
            self.initiator.progress()?;
        }
        if self.is_remote() && !self.target.supports_prog_th() {
            self.target.progress()?;
        }
        Ok(())
    }

    pub fn gen_notif(&self, msg: &str) -> Result<()> {
        if !self.initiator.supports_notif() {
            return Err(TransferError::UnsupportedOperation("notifications"));
        }
        self.initiator.gen_notif(&self.peer, msg)
    }

    /// Collects target-side notifications until `expected` have arrived or
    /// the deadline passes. Returns whatever arrived.
    pub fn wait_notifs(&self, expected: usize) -> Result<Vec<Notification>> {
        if !self.target.supports_notif() {
            return Err(TransferError::UnsupportedOperation("notifications"));
        }
        let deadline = Instant::now() + self.policy.deadline;
        let mut received = Vec::new();
        loop {
            received.extend(self.target.get_notifs()?);
            if received.len() >= expected || Instant::now() >= deadline {
                return Ok(received);
            }
            self.pump()?;
            if !self.policy.backoff.is_zero() {
                thread::sleep(self.policy.backoff);
            }
        }
    }

    pub fn close(mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => connection.release(),
            None => Ok(()),
        }
    }
}
