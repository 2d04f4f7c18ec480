//! DRAM backend through the session fixture and the raw engine contract:
//! - local and remote round trips, with and without a progress thread
//! - split-buffer transfers
//! - notification delivery, piggybacked and explicit
//! - error classification of invalid pairs and unregistered memory

mod common;

use std::sync::Arc;

use xferlink_transfer::{
    BackendEngine, BlobDesc, DescList, MemoryKind, MetaDesc, SessionConfig, Status,
    TransferOrchestrator, TransferSession, XferOp, XferOptArgs, XferStatus,
};

use common::{
    LOCAL_AGENT, REMOTE_AGENT, dram_engine, dram_engine_with_progress_thread, init, lend,
};

fn dram_config(num_bufs: usize) -> SessionConfig {
    SessionConfig::new(MemoryKind::Dram, MemoryKind::Dram).with_num_bufs(num_bufs)
}

fn write_then_read(session: &mut TransferSession) {
    session.set_local_mem().expect("set local");
    session.transfer(XferOp::Write).expect("write");
    assert!(session.check_xfer_mem().expect("check xfer"));

    session.reset_local_mem();
    assert!(!session.check_local_mem().expect("check reset"));
    session.transfer(XferOp::Read).expect("read");
    assert!(session.check_local_mem().expect("check local"));
}

#[test]
fn local_round_trip() {
    init();
    for num_bufs in [1, 3] {
        let engine = dram_engine(LOCAL_AGENT);
        let mut session =
            TransferSession::new(engine.clone(), engine, dram_config(num_bufs)).expect("session");
        assert!(!session.orchestrator().is_remote());
        write_then_read(&mut session);
        session.close().expect("close");
    }
}

#[test]
fn remote_round_trip() {
    init();
    for num_bufs in [1, 3] {
        let local = dram_engine(LOCAL_AGENT);
        let remote = dram_engine(REMOTE_AGENT);
        let mut session =
            TransferSession::new(local, remote, dram_config(num_bufs)).expect("session");
        assert!(session.orchestrator().is_remote());
        write_then_read(&mut session);
        session.close().expect("close");
    }
}

#[test]
fn remote_round_trip_with_progress_threads() {
    init();
    let local = dram_engine_with_progress_thread(LOCAL_AGENT);
    let remote = dram_engine_with_progress_thread(REMOTE_AGENT);
    assert!(local.supports_prog_th());
    let mut session = TransferSession::new(local, remote, dram_config(3)).expect("session");
    write_then_read(&mut session);
    session.close().expect("close");
}

#[test]
fn remote_read_pulls_peer_pattern() {
    init();
    let mut session = TransferSession::new(
        dram_engine(LOCAL_AGENT),
        dram_engine(REMOTE_AGENT),
        dram_config(2),
    )
    .expect("session");
    session.set_xfer_mem().expect("set xfer");
    session.reset_local_mem();
    session.transfer(XferOp::Read).expect("read");
    assert_eq!(
        session.local_snapshot().expect("local"),
        session.xfer_snapshot().expect("xfer")
    );
    session.close().expect("close");
}

#[test]
fn split_buffer_matches_whole_buffer() {
    init();
    let mut snapshots = Vec::new();
    for split_buf in [false, true] {
        let mut session = TransferSession::new(
            dram_engine(LOCAL_AGENT),
            dram_engine(REMOTE_AGENT),
            dram_config(3).with_split_buf(split_buf),
        )
        .expect("session");
        let expected_entries = if split_buf { 12 } else { 3 };
        assert_eq!(session.local_descs().len(), expected_entries);
        session.set_local_mem().expect("set local");
        session.transfer(XferOp::Write).expect("write");
        snapshots.push(session.xfer_snapshot().expect("snapshot"));
        session.close().expect("close");
    }
    assert_eq!(snapshots[0], snapshots[1]);
}

#[test]
fn too_many_buffers_rejected() {
    init();
    let engine = dram_engine(LOCAL_AGENT);
    let err = TransferSession::new(engine.clone(), engine, dram_config(4))
        .err()
        .expect("must fail");
    assert_eq!(err.status(), Status::InvalidParam);
}

#[test]
fn invalid_kind_pair_rejected_at_prep() {
    init();
    let engine = dram_engine(LOCAL_AGENT);
    let mut local = DescList::new(MemoryKind::Dram);
    local.push(MetaDesc::new(0x1000, 16, 0));
    let mut remote = DescList::new(MemoryKind::Object);
    remote.push(MetaDesc::new(0, 16, 0));

    let err = engine
        .prep_xfer(
            XferOp::Write,
            &local,
            &remote,
            LOCAL_AGENT,
            &XferOptArgs::default(),
        )
        .expect_err("must fail");
    assert_eq!(err.status(), Status::InvalidParam);
}

#[test]
fn unregistered_memory_fails_at_post() {
    init();
    let engine = dram_engine(LOCAL_AGENT);
    let src = vec![1_u8; 32];
    let mut dst = vec![0_u8; 32];
    let mut local = DescList::new(MemoryKind::Dram);
    local.push(MetaDesc::new(src.as_ptr() as u64, 32, 0));
    let mut remote = DescList::new(MemoryKind::Dram);
    remote.push(MetaDesc::new(dst.as_mut_ptr() as u64, 32, 0));
    let args = XferOptArgs::default();

    let handle = engine
        .prep_xfer(XferOp::Write, &local, &remote, LOCAL_AGENT, &args)
        .expect("prep");
    let err = engine
        .post_xfer(XferOp::Write, &local, &remote, LOCAL_AGENT, &handle, &args)
        .expect_err("must fail");
    assert_eq!(err.status(), Status::Backend);
    engine.release_req_h(handle).expect("release");
    assert_eq!(dst, vec![0_u8; 32]);
}

/// Registers `buf` on `owner`, publishes it, and loads it on `initiator`.
fn publish(
    owner: &Arc<dyn BackendEngine>,
    initiator: &Arc<dyn BackendEngine>,
    buf: &mut [u8],
) -> (xferlink_transfer::RegisteredMd, xferlink_transfer::LoadedMd) {
    let desc = lend(buf, 1);
    let md = owner.register_mem(&desc, MemoryKind::Dram).expect("register");
    let public = owner.get_public_data(&md).expect("public data");
    assert!(!public.is_empty());
    let loaded = initiator
        .load_remote_md(
            &desc.with_meta_info(public),
            MemoryKind::Dram,
            owner.local_agent(),
        )
        .expect("load remote md");
    (md, loaded)
}

#[test]
fn notification_arrives_once_and_only_after_completion() {
    init();
    let local = dram_engine(LOCAL_AGENT);
    let remote = dram_engine(REMOTE_AGENT);
    local
        .load_remote_conn_info(REMOTE_AGENT, &remote.get_conn_info().expect("conn info"))
        .expect("connect");

    let mut src = vec![0x42_u8; 64];
    let mut dst = vec![0_u8; 64];
    let src_md = local
        .register_mem(&lend(&mut src, 0), MemoryKind::Dram)
        .expect("register src");
    let (dst_md, loaded) = publish(&remote, &local, &mut dst);

    let mut local_descs = DescList::new(MemoryKind::Dram);
    local_descs.push(MetaDesc::new(src.as_ptr() as u64, 64, 0).with_md(src_md.md_ref()));
    let mut remote_descs = DescList::new(MemoryKind::Dram);
    remote_descs.push(MetaDesc::new(dst.as_ptr() as u64, 64, 1).with_md(loaded.md_ref()));
    let args = XferOptArgs::with_notif("done");

    let handle = local
        .prep_xfer(XferOp::Write, &local_descs, &remote_descs, REMOTE_AGENT, &args)
        .expect("prep");
    let status = local
        .post_xfer(
            XferOp::Write,
            &local_descs,
            &remote_descs,
            REMOTE_AGENT,
            &handle,
            &args,
        )
        .expect("post");
    assert_eq!(status, XferStatus::InProgress);
    assert!(remote.get_notifs().expect("notifs").is_empty());

    local.progress().expect("progress");
    assert_eq!(local.check_xfer(&handle), Ok(XferStatus::Done));
    let notifs = remote.get_notifs().expect("notifs");
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].sender, LOCAL_AGENT);
    assert_eq!(notifs[0].message, "done");
    assert!(remote.get_notifs().expect("notifs").is_empty());
    assert_eq!(dst, src);

    local.release_req_h(handle).expect("release");
    local.unload_md(loaded).expect("unload");
    local.disconnect(REMOTE_AGENT).expect("disconnect");
    remote.deregister_mem(dst_md).expect("deregister dst");
    local.deregister_mem(src_md).expect("deregister src");
}

#[test]
fn peer_deregistration_fails_the_transfer() {
    init();
    let local = dram_engine(LOCAL_AGENT);
    let remote = dram_engine(REMOTE_AGENT);
    local
        .load_remote_conn_info(REMOTE_AGENT, &remote.get_conn_info().expect("conn info"))
        .expect("connect");

    let mut src = vec![7_u8; 16];
    let mut dst = vec![0_u8; 16];
    let src_md = local
        .register_mem(&lend(&mut src, 0), MemoryKind::Dram)
        .expect("register src");
    let (dst_md, loaded) = publish(&remote, &local, &mut dst);

    let mut local_descs = DescList::new(MemoryKind::Dram);
    local_descs.push(MetaDesc::new(src.as_ptr() as u64, 16, 0));
    let mut remote_descs = DescList::new(MemoryKind::Dram);
    remote_descs.push(MetaDesc::new(dst.as_ptr() as u64, 16, 1).with_md(loaded.md_ref()));
    let args = XferOptArgs::default();

    let handle = local
        .prep_xfer(XferOp::Write, &local_descs, &remote_descs, REMOTE_AGENT, &args)
        .expect("prep");
    local
        .post_xfer(
            XferOp::Write,
            &local_descs,
            &remote_descs,
            REMOTE_AGENT,
            &handle,
            &args,
        )
        .expect("post");
    remote.deregister_mem(dst_md).expect("deregister dst");

    local.progress().expect("progress");
    let err = local.check_xfer(&handle).expect_err("region is gone");
    assert_eq!(err.status(), Status::Backend);
    assert_eq!(dst, vec![0_u8; 16]);

    local.release_req_h(handle).expect("release");
    local.unload_md(loaded).expect("unload");
    local.deregister_mem(src_md).expect("deregister src");
}

#[test]
fn unknown_peer_metadata_is_backend_error() {
    init();
    let local = dram_engine(LOCAL_AGENT);
    let remote = dram_engine(REMOTE_AGENT);
    let mut buf = vec![0_u8; 16];
    let desc = lend(&mut buf, 0);
    let md = remote.register_mem(&desc, MemoryKind::Dram).expect("register");
    let public = remote.get_public_data(&md).expect("public data");

    // Not connected yet.
    let err = local
        .load_remote_md(
            &desc.clone().with_meta_info(public),
            MemoryKind::Dram,
            REMOTE_AGENT,
        )
        .expect_err("unknown peer");
    assert_eq!(err.status(), Status::Backend);

    local
        .load_remote_conn_info(REMOTE_AGENT, &remote.get_conn_info().expect("conn info"))
        .expect("connect");
    let err = local
        .load_remote_md(
            &desc.with_meta_info("not-a-token"),
            MemoryKind::Dram,
            REMOTE_AGENT,
        )
        .expect_err("malformed");
    assert_eq!(err.status(), Status::Backend);

    local.disconnect(REMOTE_AGENT).expect("disconnect");
    remote.deregister_mem(md).expect("deregister");
}

#[test]
fn explicit_notifications_arrive_in_order() {
    init();
    let local = dram_engine(LOCAL_AGENT);
    let remote = dram_engine(REMOTE_AGENT);
    let orchestrator =
        TransferOrchestrator::remote(Arc::clone(&local), Arc::clone(&remote)).expect("connect");

    local.gen_notif(REMOTE_AGENT, "first").expect("first notif");
    orchestrator.gen_notif("second").expect("second notif");

    let notifs = remote.get_notifs().expect("notifs");
    assert_eq!(notifs.len(), 2);
    assert_eq!(notifs[0].message, "first");
    assert_eq!(notifs[1].message, "second");
    assert!(notifs.iter().all(|notif| notif.sender == LOCAL_AGENT));
    assert!(remote.get_notifs().expect("notifs").is_empty());
    assert!(local.get_notifs().expect("notifs").is_empty());

    let err = local
        .gen_notif("Agent9", "lost")
        .expect_err("unknown peer");
    assert_eq!(err.status(), Status::Backend);
    orchestrator.close().expect("close");
}

#[test]
fn unlent_host_memory_is_refused() {
    init();
    let engine = dram_engine(LOCAL_AGENT);
    let err = engine
        .register_mem(&BlobDesc::new(0x10, 4096, 0), MemoryKind::Dram)
        .expect_err("arbitrary address");
    assert_eq!(err.status(), Status::Backend);
}

#[test]
fn peer_deregistration_races_progress_thread_safely() {
    init();
    let local = dram_engine_with_progress_thread(LOCAL_AGENT);
    let remote = dram_engine(REMOTE_AGENT);
    local
        .load_remote_conn_info(REMOTE_AGENT, &remote.get_conn_info().expect("conn info"))
        .expect("connect");

    let mut src = vec![0x6c_u8; 4096];
    let src_md = local
        .register_mem(&lend(&mut src, 0), MemoryKind::Dram)
        .expect("register src");
    let args = XferOptArgs::default();

    for _ in 0..64 {
        let mut dst = vec![0_u8; 4096];
        let (dst_md, loaded) = publish(&remote, &local, &mut dst);

        let mut local_descs = DescList::new(MemoryKind::Dram);
        local_descs.push(MetaDesc::new(src.as_ptr() as u64, 4096, 0).with_md(src_md.md_ref()));
        let mut remote_descs = DescList::new(MemoryKind::Dram);
        remote_descs.push(MetaDesc::new(dst.as_ptr() as u64, 4096, 1).with_md(loaded.md_ref()));

        let handle = local
            .prep_xfer(XferOp::Write, &local_descs, &remote_descs, REMOTE_AGENT, &args)
            .expect("prep");
        local
            .post_xfer(
                XferOp::Write,
                &local_descs,
                &remote_descs,
                REMOTE_AGENT,
                &handle,
                &args,
            )
            .expect("post");
        remote.deregister_mem(dst_md).expect("deregister dst");
        drop(dst);

        let outcome = loop {
            match local.check_xfer(&handle) {
                Ok(XferStatus::InProgress) => std::thread::yield_now(),
                other => break other,
            }
        };
        match outcome {
            Ok(status) => assert_eq!(status, XferStatus::Done),
            Err(err) => assert_eq!(err.status(), Status::Backend),
        }
        local.release_req_h(handle).expect("release");
        local.unload_md(loaded).expect("unload");
    }
    local.deregister_mem(src_md).expect("deregister src");
}
