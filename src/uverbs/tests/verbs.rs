use std::thread;
use std::time::Duration;

use ipc::ring::ring_bytes;
use libuverbs::api::{
    AccessFlags, AsHandle, Cqe, Handle, QpCapability, QpState, QpType, SendFlags, Sge, Status,
    WcOpcode, WcStatus, Wqe, WrOpcode,
};
use libuverbs::{
    CompletionQueue, Context, Error, ProtectionDomain, QpInitAttr, QueuePair, RingTarget,
};

mod common;
use common::{poll_n, TestDaemon};

fn status<T: std::fmt::Debug>(res: Result<T, Error>) -> Status {
    res.unwrap_err()
        .status()
        .expect("the daemon should have answered with a status")
}

fn init_attr(cq: &CompletionQueue, depth: u32) -> QpInitAttr<'_> {
    QpInitAttr {
        send_cq: cq,
        recv_cq: cq,
        cap: QpCapability {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_sge: 1,
        },
        qp_type: QpType::Rc,
        sq_sig_all: true,
    }
}

fn send(wr_id: u64, addr: u64, length: u32, lkey: u32) -> Wqe {
    Wqe::new(
        wr_id,
        WrOpcode::Send,
        SendFlags::SIGNALED,
        Sge { addr, length, lkey },
    )
}

fn setup(ctx: &Context, depth: u32) -> (ProtectionDomain, CompletionQueue, QueuePair) {
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(depth).unwrap();
    let qp = ctx.create_qp(&pd, &init_attr(&cq, depth)).unwrap();
    (pd, cq, qp)
}

#[test]
fn unknown_device() {
    let daemon = TestDaemon::start(1);
    assert_eq!(
        status(Context::open(daemon.path(), "mlx5_9")),
        Status::NoDevice
    );
    let ctx = daemon.open("eth1");
    assert_eq!(ctx.device(), "eth1");
}

#[test]
fn pd_lifecycle() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let pd1 = ctx.alloc_pd().unwrap();
    let pd2 = ctx.alloc_pd().unwrap();
    assert_eq!(pd1.as_handle(), Handle(1));
    assert_eq!(pd2.as_handle(), Handle(2));

    ctx.dealloc_pd(&pd1).unwrap();
    assert_eq!(status(ctx.dealloc_pd(&pd1)), Status::NotFound);
    // handles are not reused
    assert_eq!(ctx.alloc_pd().unwrap().as_handle(), Handle(3));
    ctx.dealloc_pd(&pd2).unwrap();
    ctx.close().unwrap();
}

#[test]
fn handles_are_per_context() {
    let daemon = TestDaemon::start(1);
    let a = daemon.open("eth0");
    let b = daemon.open("eth0");
    let pd_a = a.alloc_pd().unwrap();
    let pd_b = b.alloc_pd().unwrap();
    assert_eq!(pd_a.as_handle(), pd_b.as_handle());

    a.dealloc_pd(&pd_a).unwrap();
    // b's PD with the same handle is untouched
    b.dealloc_pd(&pd_b).unwrap();
}

#[test]
fn rings_are_distinct_regions() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (pd, cq, qp) = setup(&ctx, 128);
    assert_eq!(cq.depth(), 128);
    assert_eq!(qp.pd(), pd.as_handle());

    let names = [
        cq.region().name(),
        qp.send_region().name(),
        qp.recv_region().name(),
    ];
    assert_ne!(names[0], names[1]);
    assert_ne!(names[0], names[2]);
    assert_ne!(names[1], names[2]);
    // WQEs and CQEs are both one cache line
    assert_eq!(cq.region().size(), qp.send_region().size());
    assert_eq!(qp.send_region().size(), qp.recv_region().size());

    assert_eq!(cq.capacity(), 129);
    assert_eq!(qp.capacity(), (129, 129));
    assert!(cq.region().size() >= ring_bytes::<Cqe>(128));
    assert!(qp.send_region().size() >= ring_bytes::<Wqe>(128));

    // send and receive depths are sized independently
    let attr = QpInitAttr {
        cap: QpCapability {
            max_send_wr: 512,
            max_recv_wr: 16,
            max_sge: 1,
        },
        ..init_attr(&cq, 128)
    };
    let qp = ctx.create_qp(&pd, &attr).unwrap();
    assert_eq!(qp.capacity(), (513, 17));
    assert!(qp.send_region().size() >= ring_bytes::<Wqe>(512));
    assert!(qp.recv_region().size() >= ring_bytes::<Wqe>(16));
    assert!(qp.send_region().size() > qp.recv_region().size());
}

#[test]
fn experimental_word_access() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (pd, cq, qp) = setup(&ctx, 128);

    let last = cq.region().size() as u64 - 8;
    ctx.experimental_write(RingTarget::Cq, &cq, &Handle::INVALID, last, 42)
        .unwrap();
    assert_eq!(
        ctx.experimental_read(RingTarget::Cq, &cq, &Handle::INVALID, last)
            .unwrap(),
        42
    );
    // the client maps the same memory
    assert_eq!(cq.region().read_word(last as usize).unwrap(), 42);

    let last = qp.send_region().size() as u64 - 8;
    for (target, value) in [(RingTarget::SendQueue, 43), (RingTarget::RecvQueue, 44)] {
        ctx.experimental_write(target, &qp, &pd, last, value).unwrap();
        assert_eq!(ctx.experimental_read(target, &qp, &pd, last).unwrap(), value);
    }
    assert_eq!(qp.send_region().read_word(last as usize).unwrap(), 43);
    assert_eq!(qp.recv_region().read_word(last as usize).unwrap(), 44);

    let size = cq.region().size() as u64;
    assert_eq!(
        status(ctx.experimental_read(RingTarget::Cq, &cq, &Handle::INVALID, size)),
        Status::Invalid
    );
    assert_eq!(
        status(ctx.experimental_read(RingTarget::SendQueue, &qp, &Handle(99), 0)),
        Status::NotFound
    );
}

#[test]
fn send_completions() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (pd, mut cq, mut qp) = setup(&ctx, 64);
    let buf = vec![0u8; 4096];
    let mr = ctx
        .reg_mr_slice(&pd, &buf, AccessFlags::LOCAL_WRITE)
        .unwrap();
    assert_eq!(mr.lkey, mr.rkey);
    let base = buf.as_ptr() as u64;

    qp.post_send(&[send(7, base, 64, mr.lkey)]).unwrap();
    let wc = poll_n(&mut cq, 1);
    assert_eq!(wc[0].wr_id, 7);
    assert_eq!(wc[0].status(), WcStatus::Success);
    assert_eq!(wc[0].opcode(), Some(WcOpcode::Send));
    assert_eq!(wc[0].byte_len, 64);
    assert_eq!(wc[0].qp_num, qp.qp_num());

    qp.post_send(&[
        send(8, base + 4090, 64, mr.lkey),
        send(9, base, 64, mr.lkey ^ 0x00ff_0000),
        send(10, base + 4032, 64, mr.lkey),
    ])
    .unwrap();
    let wc = poll_n(&mut cq, 3);
    let got: Vec<_> = wc.iter().map(|c| (c.wr_id, c.status())).collect();
    assert_eq!(
        got,
        vec![
            (8, WcStatus::LocAccessErr),
            (9, WcStatus::LocProtErr),
            (10, WcStatus::Success),
        ]
    );

    ctx.dereg_mr(&mr).unwrap();
    assert_eq!(status(ctx.dereg_mr(&mr)), Status::NotFound);
    qp.post_send(&[send(11, base, 64, mr.lkey)]).unwrap();
    let wc = poll_n(&mut cq, 1);
    assert_eq!((wc[0].wr_id, wc[0].status()), (11, WcStatus::LocProtErr));
}

#[test]
fn completions_wait_for_cq_space() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let pd = ctx.alloc_pd().unwrap();
    let mut cq = ctx.create_cq(4).unwrap();
    let attr = QpInitAttr {
        cap: QpCapability {
            max_send_wr: 64,
            max_recv_wr: 4,
            max_sge: 1,
        },
        ..init_attr(&cq, 4)
    };
    let mut qp = ctx.create_qp(&pd, &attr).unwrap();
    let buf = vec![0u8; 256];
    let mr = ctx
        .reg_mr_slice(&pd, &buf, AccessFlags::LOCAL_WRITE)
        .unwrap();
    let base = buf.as_ptr() as u64;

    let wrs: Vec<_> = (0..64).map(|i| send(i, base, 64, mr.lkey)).collect();
    qp.post_send(&wrs).unwrap();
    // the worker stalls on the full CQ meanwhile
    thread::sleep(Duration::from_millis(500));

    let wc = poll_n(&mut cq, 64);
    let ids: Vec<_> = wc.iter().map(|c| c.wr_id).collect();
    assert_eq!(ids, (0..64u64).collect::<Vec<_>>());
    assert!(wc.iter().all(|c| c.status() == WcStatus::Success));
}

#[test]
fn mr_of_another_pd_is_rejected() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (_pd, mut cq, mut qp) = setup(&ctx, 16);
    let other = ctx.alloc_pd().unwrap();
    let buf = vec![0u8; 256];
    let mr = ctx
        .reg_mr_slice(&other, &buf, AccessFlags::LOCAL_WRITE)
        .unwrap();

    qp.post_send(&[send(1, buf.as_ptr() as u64, 16, mr.lkey)])
        .unwrap();
    let wc = poll_n(&mut cq, 1);
    assert_eq!(wc[0].status(), WcStatus::LocProtErr);
}

#[test]
fn full_send_queue() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(64).unwrap();
    let mut qp = ctx.create_qp(&pd, &init_attr(&cq, 4)).unwrap();
    // keep the worker away from the ring while it fills up
    ctx.destroy_qp(&qp).unwrap();
    thread::sleep(Duration::from_millis(50));

    let wrs: Vec<_> = (0..6).map(|i| send(i, 0, 0, 0)).collect();
    match qp.post_send(&wrs) {
        Err(Error::QueueFull { posted }) => assert_eq!(posted, 4),
        other => panic!("expected a full queue, got {:?}", other),
    }
}

#[test]
fn destroy_cq_while_attached() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (_pd, cq, qp) = setup(&ctx, 32);

    assert_eq!(status(ctx.destroy_cq(&cq)), Status::Busy);
    ctx.destroy_qp(&qp).unwrap();
    assert_eq!(status(ctx.destroy_qp(&qp)), Status::NotFound);
    ctx.destroy_cq(&cq).unwrap();
    assert_eq!(status(ctx.destroy_cq(&cq)), Status::NotFound);
}

#[test]
fn dealloc_pd_releases_children() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (pd, cq, qp) = setup(&ctx, 32);
    let buf = vec![0u8; 64];
    let mr = ctx.reg_mr_slice(&pd, &buf, AccessFlags::empty()).unwrap();

    ctx.dealloc_pd(&pd).unwrap();
    assert_eq!(status(ctx.destroy_qp(&qp)), Status::NotFound);
    assert_eq!(status(ctx.dereg_mr(&mr)), Status::NotFound);
    ctx.destroy_cq(&cq).unwrap();
}

#[test]
fn create_validation() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let pd = ctx.alloc_pd().unwrap();
    assert_eq!(status(ctx.create_cq(0)), Status::Invalid);
    let cq = ctx.create_cq(8).unwrap();

    let mut attr = init_attr(&cq, 8);
    attr.cap.max_sge = 2;
    assert_eq!(status(ctx.create_qp(&pd, &attr)), Status::Invalid);
    attr.cap.max_sge = 1;
    attr.cap.max_send_wr = 0;
    assert_eq!(status(ctx.create_qp(&pd, &attr)), Status::Invalid);

    assert_eq!(
        status(ctx.reg_mr(&pd, 0x1000, 0, AccessFlags::LOCAL_WRITE)),
        Status::Invalid
    );
    assert_eq!(
        status(ctx.reg_mr(&pd, u64::MAX - 8, 64, AccessFlags::LOCAL_WRITE)),
        Status::Invalid
    );

    ctx.dealloc_pd(&pd).unwrap();
    assert_eq!(
        status(ctx.create_qp(&pd, &init_attr(&cq, 8))),
        Status::NotFound
    );
    // the failed attempts left no attachment behind
    ctx.destroy_cq(&cq).unwrap();
}

#[test]
fn modify_qp_records_state() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let (_pd, _cq, qp) = setup(&ctx, 8);
    for (cur, next) in [
        (QpState::Reset, QpState::Init),
        (QpState::Init, QpState::Rtr),
        (QpState::Rtr, QpState::Rts),
    ] {
        ctx.modify_qp(&qp, next, cur, qp.qp_num(), 0).unwrap();
    }
    ctx.destroy_qp(&qp).unwrap();
    assert_eq!(
        status(ctx.modify_qp(&qp, QpState::Err, QpState::Rts, 0, 0)),
        Status::NotFound
    );
}

#[test]
fn close_releases_everything() {
    let daemon = TestDaemon::start(2);
    let ctx = daemon.open("eth0");
    let (_pd, _cq, _qp) = setup(&ctx, 16);
    ctx.close().unwrap();

    // dropping a context without closing it releases its resources too
    let ctx = daemon.open("eth0");
    let (_pd, _cq, _qp) = setup(&ctx, 16);
    drop(ctx);

    let ctx = daemon.open("eth1");
    let (pd, mut cq, mut qp) = setup(&ctx, 16);
    let buf = vec![0u8; 128];
    let mr = ctx
        .reg_mr_slice(&pd, &buf, AccessFlags::LOCAL_WRITE)
        .unwrap();
    qp.post_send(&[send(3, buf.as_ptr() as u64, 128, mr.lkey)])
        .unwrap();
    assert_eq!(poll_n(&mut cq, 1)[0].status(), WcStatus::Success);
}
