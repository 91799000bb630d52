use libuverbs::api::{
    AccessFlags, Cqe, QpCapability, QpType, SendFlags, Sge, WcStatus, Wqe, WrOpcode,
};
use libuverbs::QpInitAttr;

mod common;
use common::{poll_n, TestDaemon};

const ITERS: u64 = 10_000;
const BATCH: u64 = 32;
const DEPTH: u32 = 4096;

#[test]
fn loopback_send_batches() {
    let daemon = TestDaemon::start(1);
    let ctx = daemon.open("eth0");
    let pd = ctx.alloc_pd().unwrap();
    let mut cq = ctx.create_cq(DEPTH).unwrap();
    let mut qp = ctx
        .create_qp(
            &pd,
            &QpInitAttr {
                send_cq: &cq,
                recv_cq: &cq,
                cap: QpCapability {
                    max_send_wr: DEPTH,
                    max_recv_wr: DEPTH,
                    max_sge: 1,
                },
                qp_type: QpType::Rc,
                sq_sig_all: true,
            },
        )
        .unwrap();
    let buf = vec![0u8; 4096];
    let mr = ctx
        .reg_mr_slice(&pd, &buf, AccessFlags::LOCAL_WRITE)
        .unwrap();
    let base = buf.as_ptr() as u64;

    let mut wrs = Vec::with_capacity(BATCH as usize);
    for iter in 0..ITERS {
        wrs.clear();
        wrs.extend((0..BATCH).map(|i| {
            let sge = Sge {
                addr: base + (i * 64) % 4096,
                length: 64,
                lkey: mr.lkey,
            };
            Wqe::new(iter * BATCH + i, WrOpcode::Send, SendFlags::SIGNALED, sge)
        }));
        qp.post_send(&wrs).unwrap();

        let wc = poll_n(&mut cq, BATCH as usize);
        for (i, c) in wc.iter().enumerate() {
            assert_eq!(c.wr_id, iter * BATCH + i as u64);
            assert_eq!(c.status(), WcStatus::Success);
            assert_eq!(c.byte_len, 64);
        }
    }

    let mut rest = [Cqe::default(); 4];
    assert_eq!(cq.poll(&mut rest), 0);
    ctx.close().unwrap();
}
