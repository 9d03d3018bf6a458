// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! The Kestrel store server binary.
//!
//! Runs one store of the replicated key-value engine against an
//! in-process placement stub. The networked service surface (client RPC,
//! peer transport, placement-driver RPC) plugs in at the `Transport` and
//! `PdClient` boundaries and ships separately.

use std::process;
use std::sync::{Arc, Mutex};

use clap::Parser;
use kestrel_engine::{Engines, MemEngine};
use kestrel_pd::MockPdClient;
use kestrel_raftstore::store::{Config, Node, Router, SnapManager, Transport};
use kestrel_raftstore::Result;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use slog::{error, info, o, Drain, Logger};

#[derive(Parser)]
#[command(name = "kestrel-server", about = "A compact replicated key-value store")]
struct Args {
    /// Placement driver address.
    #[arg(long = "pd")]
    pd: Option<String>,
    /// Store listening address.
    #[arg(long = "addr")]
    addr: Option<String>,
    /// Data directory.
    #[arg(long = "data-dir")]
    data_dir: Option<String>,
    /// Log level: trace, debug, info, warn, error.
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn build_logger(level_str: &str) -> Logger {
    let level = match level_str {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "warn" => slog::Level::Warning,
        "error" => slog::Level::Error,
        _ => slog::Level::Info,
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!())
}

/// Loopback transport: every peer this demo build talks to lives in the
/// same process, so messages go straight back into the router.
#[derive(Clone)]
struct LocalTransport {
    router: Arc<Mutex<Option<Router<MemEngine>>>>,
}

impl LocalTransport {
    fn new() -> LocalTransport {
        LocalTransport {
            router: Arc::new(Mutex::new(None)),
        }
    }

    fn set_router(&self, router: Router<MemEngine>) {
        *self.router.lock().unwrap() = Some(router);
    }
}

impl Transport for LocalTransport {
    fn send(&self, msg: kestrel_proto::raft_serverpb::RaftMessage) -> Result<()> {
        let router = self.router.lock().unwrap();
        match router.as_ref() {
            Some(r) => r.send_raft_message(msg),
            None => Ok(()),
        }
    }
}

fn run(cfg: Config, logger: &Logger) -> Result<()> {
    let engines = Engines::new(MemEngine::new(), MemEngine::new());
    let snap_mgr = SnapManager::new(format!("{}/snap", cfg.data_dir));
    snap_mgr.init()?;

    let pd_client = Arc::new(MockPdClient::new(1));
    let trans = LocalTransport::new();

    let mut node = Node::new(cfg, Arc::clone(&pd_client), logger.clone())?;
    let router = node.start(engines, trans.clone(), snap_mgr)?;
    trans.set_router(router);
    info!(logger, "store started"; "store_id" => node.id());

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGQUIT])?;
    if let Some(signal) = signals.forever().next() {
        info!(logger, "got signal to exit"; "signal" => signal);
    }

    node.stop();
    Ok(())
}

fn main() {
    let args = Args::parse();
    let mut cfg = Config::default();
    if let Some(pd) = args.pd {
        cfg.pd_addr = pd;
    }
    if let Some(addr) = args.addr {
        cfg.store_addr = addr;
    }
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        cfg.log_level = level;
    }

    let logger = build_logger(&cfg.log_level);
    if let Err(e) = cfg.validate() {
        error!(logger, "invalid configuration"; "err" => %e);
        process::exit(1);
    }
    info!(logger, "starting kestrel store"; "addr" => &cfg.store_addr);

    if let Err(e) = run(cfg, &logger) {
        error!(logger, "server failed"; "err" => %e);
        process::exit(1);
    }
    info!(logger, "server stopped");
}
