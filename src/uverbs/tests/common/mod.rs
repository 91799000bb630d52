#![allow(dead_code)]
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libuverbs::api::Cqe;
use libuverbs::{CompletionQueue, Context};
use uverbs::config::DeviceConfig;
use uverbs::{Config, Daemon};

/// A daemon serving a private socket from a background thread. Stopped on drop.
pub struct TestDaemon {
    prefix: PathBuf,
    path: PathBuf,
    exit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestDaemon {
    pub fn start(workers: usize) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let prefix = std::env::temp_dir().join(format!(
            "uverbs-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));

        let mut config = Config::default();
        config.control.prefix = prefix.clone();
        config.driver.workers = workers;
        config.devices = vec![
            DeviceConfig {
                name: "eth0".to_owned(),
            },
            DeviceConfig {
                name: "eth1".to_owned(),
            },
        ];
        let path = config.socket_path();

        let daemon = Daemon::new(config).unwrap();
        let exit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exit);
        let handle = thread::spawn(move || daemon.run(&flag).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(Instant::now() < deadline, "daemon did not come up");
            thread::sleep(Duration::from_millis(5));
        }
        TestDaemon {
            prefix,
            path,
            exit,
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn open(&self, dev_name: &str) -> Context {
        Context::open(&self.path, dev_name).unwrap()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_dir_all(&self.prefix);
    }
}

/// Polls `cq` until `n` completions arrived or ten seconds passed.
pub fn poll_n(cq: &mut CompletionQueue, n: usize) -> Vec<Cqe> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::with_capacity(n);
    let mut wc = [Cqe::default(); 32];
    while out.len() < n {
        assert!(
            Instant::now() < deadline,
            "only {} of {} completions arrived",
            out.len(),
            n
        );
        let got = cq.poll(&mut wc[..(n - out.len()).min(32)]);
        out.extend_from_slice(&wc[..got]);
        if got == 0 {
            thread::yield_now();
        }
    }
    out
}
