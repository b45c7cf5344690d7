// TGD - DAEMON
// Runs the backhaul core over the in-memory loopback radio.
//
// Usage:
//   tgd [--config PATH] [--links N] [--log-level LEVEL] [--backend auto|linux|nss|pfe|dpaa2]
//
// TGD_* environment variables override the config file; flags override both.
// SIGINT/SIGTERM stop the monitor loop and run the full removal sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use tgd::baseband::loopback::LoopbackBaseband;
use tgd::baseband::Baseband;
use tgd::config::{self, TgdConfig};
use tgd::control::notify::{ChannelBus, Notification};
use tgd::driver::{Driver, Platform};
use tgd::logging;
use tgd::protocol::frame::Frame;
use tgd::protocol::wire::MacAddr;
use tgd::route::{BackendChoice, BackendKind, HostStack, OffloadEngine, OffloadEngines, SoftOffloadEngine};

const LOOPBACK_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const NOTIFY_DEPTH: usize = 256;
const MONITOR_TICK: Duration = Duration::from_millis(100);
const TELEM_EVERY: u32 = 10;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

// ============================================================================
// HOST STACK
// ============================================================================

/// Counts delivered frames; the daemon has no real network stack behind it.
#[derive(Default)]
struct CountingHost {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl HostStack for CountingHost {
    fn deliver(&self, _dev_index: usize, frame: Frame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

fn engines_for(choice: BackendChoice) -> OffloadEngines {
    let soft = |name: &'static str| Some(Arc::new(SoftOffloadEngine::new(name)) as Arc<dyn OffloadEngine>);
    match choice {
        BackendChoice::Only(BackendKind::Nss) => OffloadEngines { nss: soft("nss"), ..OffloadEngines::default() },
        BackendChoice::Only(BackendKind::Pfe) => OffloadEngines { pfe: soft("pfe"), ..OffloadEngines::default() },
        BackendChoice::Only(BackendKind::Dpaa2) => OffloadEngines { dpaa2: soft("dpaa2"), ..OffloadEngines::default() },
        _ => OffloadEngines::default(),
    }
}

fn drain_notifications(rx: &Receiver<Notification>) {
    while let Ok(n) = rx.try_recv() {
        match &n {
            Notification::LinkStatus { ifname, peer, status, .. } => {
                info!("[TGD-EVT] {} peer {} status {}", ifname.as_deref().unwrap_or("-"), peer, status)
            }
            Notification::DeviceUp { radio, mac } | Notification::DeviceDown { radio, mac } => {
                info!("[TGD-EVT] {} radio {} ({})", n.kind(), radio, mac)
            }
            other => info!("[TGD-EVT] {}", other.kind()),
        }
    }
}

// ============================================================================
// MONITOR
// ============================================================================

fn run_monitor(drv: &Driver, host: &CountingHost, notes: &Receiver<Notification>) {
    eprintln!("[TGD-MON] {} radio(s), {} link slot(s) each", drv.devices().len(), drv.config().num_virt_links);
    eprintln!("---------------------------------------------------------------------");
    let mut ticks = 0u32;
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(MONITOR_TICK);
        drain_notifications(notes);
        ticks += 1;
        if ticks < TELEM_EVERY {
            continue;
        }
        ticks = 0;

        let reports = drv.stats();
        eprintln!(
            "[TELEM] LINKS:{:<3} HOST_RX:{:<10} HOST_BYTES:{:<12}",
            reports.len(),
            host.frames.load(Ordering::Relaxed),
            host.bytes.load(Ordering::Relaxed)
        );
        for r in &reports {
            eprintln!(
                "  terra{:<2} link:{:<3} {:?} {} -> {} RX:{}/{}B TX:{}/{}B ERR:{}",
                r.dev_index, r.link, r.state, r.src, r.dst, r.rx_packets, r.rx_bytes, r.tx_packets, r.tx_bytes,
                r.tx_errors
            );
        }
    }
    drain_notifications(notes);
}

// ============================================================================
// MAIN
// ============================================================================

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match TgdConfig::from_args(&args, std::env::vars()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[TGD] {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = logging::init(cfg.log_level) {
        eprintln!("[TGD] logger: {}", e);
    }
    for name in config::unknown_env(std::env::vars()) {
        warn!("[TGD-CFG] ignoring unknown environment variable {}", name);
    }

    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let (bus, notes) = ChannelBus::new(NOTIFY_DEPTH);
    let host = Arc::new(CountingHost::default());
    let platform = Platform {
        basebands: vec![Arc::new(LoopbackBaseband::new(LOOPBACK_MAC)) as Arc<dyn Baseband>],
        engines: engines_for(cfg.backend),
        host: host.clone(),
        bus: Arc::new(bus),
        gps: None,
    };

    let mut drv = match Driver::probe(&platform, &cfg) {
        Ok(d) => d,
        Err(e) => {
            error!("[TGD-DEV] probe failed: {}", e);
            std::process::exit(1);
        }
    };
    for dev in drv.devices() {
        info!("[TGD-DEV] radio {} on {} backend", dev.radio(), dev.backend().kind().name());
    }

    run_monitor(&drv, &host, &notes);

    info!("[TGD-DEV] shutdown requested");
    drv.remove();
    drain_notifications(&notes);
    log::logger().flush();
}
