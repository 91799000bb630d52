//! Loopback transport: every posted send-queue request completes locally.
//!
//! No payload is moved. Each request is checked against the memory region its lkey names and
//! completes with success, a protection error or an access error.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use spin::Mutex;

use uverbs_api::{Cqe, WcOpcode, WcStatus, Wqe};

use super::PollerItem;
use crate::log;

pub const BATCH_SIZE: usize = 32;

#[derive(Debug)]
struct WorkerShared {
    pending: Mutex<Vec<PollerItem>>,
    dirty: AtomicBool,
    running: Arc<AtomicBool>,
}

impl WorkerShared {
    fn update<F: FnOnce(&mut Vec<PollerItem>)>(&self, f: F) {
        f(&mut self.pending.lock());
        self.dirty.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct LoopbackDriver {
    workers: Vec<Arc<WorkerShared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    next: AtomicUsize,
}

impl LoopbackDriver {
    pub fn new(num_workers: usize) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for i in 0..num_workers.max(1) {
            let shared = Arc::new(WorkerShared {
                pending: Mutex::new(Vec::new()),
                dirty: AtomicBool::new(false),
                running: Arc::clone(&running),
            });
            let worker = Worker::new(Arc::clone(&shared));
            let handle = thread::Builder::new()
                .name(format!("uverbs-worker-{}", i))
                .spawn(move || worker.mainloop())?;
            workers.push(shared);
            handles.push(handle);
        }
        log::info!("loopback driver started {} worker(s)", workers.len());
        Ok(LoopbackDriver {
            workers,
            handles: Mutex::new(handles),
            running,
            next: AtomicUsize::new(0),
        })
    }

    /// Assigns the QP to a worker, round robin.
    pub fn add(&self, item: PollerItem) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        log::debug!("QP {} assigned to worker {}", item.qp_num, i);
        self.workers[i].update(|items| items.push(item));
    }

    pub fn remove(&self, qp_num: u32) {
        for worker in &self.workers {
            if worker.pending.lock().iter().any(|x| x.qp_num == qp_num) {
                worker.update(|items| items.retain(|x| x.qp_num != qp_num));
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("a loopback worker panicked");
            }
        }
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    /// Private copy of `shared.pending`, refreshed only when `dirty` is observed.
    items: Vec<PollerItem>,
    wqes: Vec<Wqe>,
    cqes: Vec<Cqe>,
}

impl Worker {
    fn new(shared: Arc<WorkerShared>) -> Self {
        Worker {
            shared,
            items: Vec::new(),
            wqes: vec![Wqe::default(); BATCH_SIZE],
            cqes: vec![Cqe::default(); BATCH_SIZE],
        }
    }

    fn mainloop(mut self) {
        while self.shared.running.load(Ordering::Acquire) {
            if self.shared.dirty.swap(false, Ordering::AcqRel) {
                self.items = self.shared.pending.lock().clone();
            }

            let mut work = 0;
            for i in 0..self.items.len() {
                work += self.poll_one(i);
            }
            if work == 0 {
                thread::yield_now();
            }
        }
    }

    /// Serves one batch of the i-th QP and returns how many requests it consumed.
    ///
    /// Requests are only taken from the send queue when the CQ has room for their completions,
    /// so a stalled consumer leaves its work posted. The CQ stays locked for the whole batch
    /// because several QPs may complete into it.
    fn poll_one(&mut self, i: usize) -> usize {
        let item = &self.items[i];
        let mut cq = item.send_cq.lock();
        let room = cq.free_space().min(BATCH_SIZE);
        if room == 0 {
            return 0;
        }
        let n = item.sq.lock().pop_batch(&mut self.wqes[..room]);
        if n == 0 {
            return 0;
        }
        for (wqe, cqe) in self.wqes[..n].iter().zip(self.cqes.iter_mut()) {
            *cqe = complete(item, wqe);
        }
        let pushed = cq.push_batch(&self.cqes[..n]);
        debug_assert_eq!(pushed, n, "CQ space was reserved for the batch");
        n
    }
}

fn complete(item: &PollerItem, wqe: &Wqe) -> Cqe {
    let opcode = match wqe.opcode() {
        Some(op) if op.is_send_queue_op() => op,
        _ => return Cqe::new(wqe.wr_id, WcStatus::LocQpOpErr, WcOpcode::Send, item.qp_num),
    };
    let sge = &wqe.sge;
    let status = match item.mr_index.get(sge.lkey) {
        Some(mr) if mr.pd == item.pd => {
            if mr.contains(sge.addr, sge.length as u64) {
                WcStatus::Success
            } else {
                WcStatus::LocAccessErr
            }
        }
        _ => WcStatus::LocProtErr,
    };
    let mut cqe = Cqe::new(wqe.wr_id, status, opcode.completion_opcode(), item.qp_num);
    if status == WcStatus::Success {
        cqe.byte_len = sge.length;
    }
    cqe
}
