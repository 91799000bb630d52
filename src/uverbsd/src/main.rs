use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal;

use anyhow::Result;
use clap::Parser;

use uverbs::{Config, Daemon};

pub mod logging;

#[derive(Debug, Clone, Parser)]
#[command(name = "uverbs daemon")]
struct Opts {
    /// uverbsd config path
    #[arg(short, long, default_value = "uverbsd.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_terminate(_sig: i32) {
    TERMINATE.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    // load config
    let opts = Opts::parse();
    let config = Config::from_path(&opts.config)?;

    // init log setting from "UVERBS_LOG", optionally mirrored to a file
    let _guard = logging::init_log(&config, !opts.no_ansi)?;

    let daemon = Daemon::new(config)?;

    // process Ctrl-C and termination
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_terminate),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for sig in [signal::SIGINT, signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &sig_action) }?;
    }

    // the control channel now takes over
    daemon.run(&TERMINATE)?;
    tracing::info!("uverbsd exited");
    Ok(())
}
