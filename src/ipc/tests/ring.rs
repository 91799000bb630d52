use std::fs::File;
use std::os::unix::io::FromRawFd;

use crossbeam::thread;
use rand::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use ipc::{LockingRing, SharedRegion, SpscRing};

const NUM_ITERS: u64 = 100_000;
const SEED: u64 = 999;

type Element = [u64; 4];

fn element(i: u64, rng: &mut StdRng) -> Element {
    [i, rng.gen(), rng.gen(), rng.gen()]
}

/// Maps the same region a second time, the way a client maps a descriptor it received.
fn reopen(region: &SharedRegion) -> SharedRegion {
    let fd = unsafe { libc::dup(region.fd()) };
    assert!(fd >= 0);
    let file = unsafe { File::from_raw_fd(fd) };
    SharedRegion::open(region.name(), file, region.size()).unwrap()
}

#[test]
fn spsc_ring_correctness() {
    let mut producer = SpscRing::<Element>::create("spsc-correctness", 31).unwrap();
    let mut consumer = SpscRing::<Element>::attach(reopen(producer.region())).unwrap();

    thread::scope(|s| {
        let sender = s.spawn(|_| {
            let mut rng = StdRng::seed_from_u64(SEED);
            for i in 0..NUM_ITERS {
                let e = element(i, &mut rng);
                while !producer.push(&e) {
                    std::thread::yield_now();
                }
            }
        });
        let receiver = s.spawn(|_| {
            // send and receiver use the same seed
            let mut rng = StdRng::seed_from_u64(SEED);
            for i in 0..NUM_ITERS {
                let e = element(i, &mut rng);
                let got = loop {
                    match consumer.pop() {
                        Some(x) => break x,
                        None => std::thread::yield_now(),
                    }
                };
                assert_eq!(e, got);
            }
        });

        sender.join().unwrap();
        receiver.join().unwrap();
    })
    .unwrap();
}

#[test]
fn spsc_ring_batches() {
    let mut producer = SpscRing::<Element>::create("spsc-batches", 63).unwrap();
    let mut consumer = SpscRing::<Element>::attach(reopen(producer.region())).unwrap();

    thread::scope(|s| {
        let sender = s.spawn(|_| {
            let mut rng = StdRng::seed_from_u64(SEED);
            let mut sizes = StdRng::seed_from_u64(SEED + 1);
            let mut next = 0;
            while next < NUM_ITERS {
                let n = sizes.gen_range(1..=40).min(NUM_ITERS - next) as usize;
                let batch: Vec<Element> = (0..n as u64).map(|k| element(next + k, &mut rng)).collect();
                let mut sent = 0;
                while sent < n {
                    let pushed = producer.push_batch(&batch[sent..]);
                    assert!(pushed <= n - sent);
                    sent += pushed;
                    if pushed == 0 {
                        std::thread::yield_now();
                    }
                }
                next += n as u64;
            }
        });
        let receiver = s.spawn(|_| {
            let mut rng = StdRng::seed_from_u64(SEED);
            let mut sizes = StdRng::seed_from_u64(SEED + 2);
            let mut buf = [[0u64; 4]; 48];
            let mut next = 0;
            while next < NUM_ITERS {
                let want = sizes.gen_range(1..=buf.len());
                let n = consumer.pop_batch(&mut buf[..want]);
                assert!(n <= want);
                for got in &buf[..n] {
                    assert_eq!(*got, element(next, &mut rng));
                    next += 1;
                }
                if n == 0 {
                    std::thread::yield_now();
                }
            }
            let mut rest = [[0u64; 4]; 4];
            assert_eq!(consumer.pop_batch(&mut rest), 0);
        });

        sender.join().unwrap();
        receiver.join().unwrap();
    })
    .unwrap();
}

#[test]
fn locking_ring_multiple_producers() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 20_000;

    let ring = LockingRing::<[u64; 2]>::create("locking-mp", 64).unwrap();

    thread::scope(|s| {
        for p in 0..PRODUCERS {
            let ring = &ring;
            s.spawn(move |_| {
                for i in 0..PER_PRODUCER {
                    while !ring.push(&[p, i]) {
                        std::thread::yield_now();
                    }
                }
            });
        }
        s.spawn(|_| {
            let mut expected = vec![0u64; PRODUCERS as usize];
            let mut total = 0;
            while total < PRODUCERS * PER_PRODUCER {
                match ring.pop() {
                    Some([p, i]) => {
                        // per-producer FIFO order survives interleaving
                        assert_eq!(expected[p as usize], i);
                        expected[p as usize] += 1;
                        total += 1;
                    }
                    None => std::thread::yield_now(),
                }
            }
            assert!(expected.iter().all(|&n| n == PER_PRODUCER));
        });
    })
    .unwrap();
    assert!(ring.is_empty());
}
