// TGD - QUEUE STATS SAMPLER
// Periodic per-link congestion report pushed to firmware.
// One RT thread per radio. Each tick: read radio counters for every Up link,
// derive arrival rate (bytes/ms), smooth it with a 1/8 EWMA, push one batch.
// The batch is handed to the event worker; the sampler never does ioctl I/O.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::engine::clock::{clock_ns, elapsed_ms_min1, set_realtime_priority};
use crate::protocol::fw_msg::{QueueStatsEntry, QUEUE_STATS_MAX_LINKS};
use crate::protocol::wire::MacAddr;

pub const QUEUE_STATS_INTERVAL: Duration = Duration::from_millis(20);
const LOG_PERIOD: Duration = Duration::from_secs(1);
const SAMPLER_RT_PRIORITY: i32 = 98;

// ============================================================================
// RATE ESTIMATION
// ============================================================================

#[inline(always)]
pub fn round_div(x: u64, y: u64) -> u64 { x.saturating_add(y / 2) / y.max(1) }

/// Per-link arrival-rate state carried between ticks.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateEstimator {
    tot_arrived: u64,
    avg_per_ms: u64,
    last_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSample {
    /// Bytes arrived since the previous sample.
    pub arrived: u64,
    pub inst_per_ms: u64,
    pub avg_per_ms: u64,
    /// Counter went backwards (stats reset or re-association).
    pub reset: bool,
    /// Value reported southbound.
    pub reported: u32,
}

impl RateEstimator {
    pub fn new(now_ns: u64) -> Self { RateEstimator { tot_arrived: 0, avg_per_ms: 0, last_ns: now_ns } }

    pub fn avg_per_ms(&self) -> u64 { self.avg_per_ms }

    /// Feed the cumulative arrived-bytes counter observed at `now_ns`.
    pub fn update(&mut self, tot_arrived: u64, now_ns: u64) -> RateSample {
        let ms = elapsed_ms_min1(self.last_ns, now_ns);
        self.last_ns = now_ns;

        let reset = tot_arrived < self.tot_arrived;
        let arrived = if reset { tot_arrived } else { tot_arrived - self.tot_arrived };
        self.tot_arrived = tot_arrived;

        let inst = round_div(arrived, ms);
        self.avg_per_ms = if reset {
            inst
        } else {
            inst.saturating_add(self.avg_per_ms.saturating_mul(7)) / 8
        };

        let reported = if self.avg_per_ms != 0 {
            clamp_u32(self.avg_per_ms)
        } else if inst != 0 {
            clamp_u32(inst)
        } else if arrived != 0 {
            1
        } else {
            0
        };
        RateSample { arrived, inst_per_ms: inst, avg_per_ms: self.avg_per_ms, reset, reported }
    }
}

#[inline(always)]
pub fn clamp_u32(v: u64) -> u32 { v.min(u32::MAX as u64) as u32 }

// ============================================================================
// SOURCE CONTRACT
// ============================================================================

/// Radio counters for one Up link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkQueueStats {
    pub peer: MacAddr,
    pub bytes_pending: u64,
    pub arrived_bytes: u64,
}

pub trait QueueStatsSource: Send + Sync {
    fn link_count(&self) -> usize;
    /// None when the link at `index` is not Up.
    fn sample_link(&self, index: usize) -> Option<LinkQueueStats>;
    /// Hand a finished batch to the control plane. Must not block.
    fn publish_queue_stats(&self, batch: Vec<QueueStatsEntry>);
}

// ============================================================================
// TICK
// ============================================================================

#[derive(Default)]
pub struct SamplerCounters {
    pub ticks: AtomicU64,
    pub too_many_links: AtomicU64,
}

pub struct SamplerCore {
    estimators: [RateEstimator; QUEUE_STATS_MAX_LINKS],
    log_every: u64,
    loops: u64,
}

impl SamplerCore {
    pub fn new(now_ns: u64, tick: Duration) -> Self {
        let per_tick = tick.as_millis().max(1) as u64;
        SamplerCore {
            estimators: [RateEstimator::new(now_ns); QUEUE_STATS_MAX_LINKS],
            log_every: (LOG_PERIOD.as_millis() as u64 / per_tick).max(1),
            loops: 0,
        }
    }

    /// One sampling pass. Returns the batch and whether links were skipped.
    pub fn tick(&mut self, source: &dyn QueueStatsSource, now_ns: u64) -> (Vec<QueueStatsEntry>, bool) {
        self.loops += 1;
        let verbose = self.loops % self.log_every == 0;
        let total = source.link_count();
        let mut batch = Vec::with_capacity(total.min(QUEUE_STATS_MAX_LINKS));
        for index in 0..total.min(QUEUE_STATS_MAX_LINKS) {
            let entry = match source.sample_link(index) {
                None => QueueStatsEntry::default(),
                Some(s) => {
                    let est = &mut self.estimators[index];
                    let r = est.update(s.arrived_bytes, now_ns);
                    if verbose {
                        debug!("[TGD-QSTATS] link {} tot {} arr {} pend {} rate {} reset {} mac {}",
                            index, s.arrived_bytes, r.arrived, s.bytes_pending, r.reported, r.reset, s.peer);
                    }
                    QueueStatsEntry {
                        bytes_pending: clamp_u32(s.bytes_pending).to_le(),
                        arrival_rate: r.reported.to_le(),
                        dst_mac: s.peer.0,
                    }
                }
            };
            batch.push(entry);
        }
        (batch, total > QUEUE_STATS_MAX_LINKS)
    }
}

// ============================================================================
// THREAD
// ============================================================================

pub struct QueueStatsSampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pub counters: Arc<SamplerCounters>,
}

impl QueueStatsSampler {
    pub fn start(source: Weak<dyn QueueStatsSource>, tick: Duration, name: String) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(SamplerCounters::default());
        let (t_stop, t_counters) = (stop.clone(), counters.clone());
        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = set_realtime_priority(SAMPLER_RT_PRIORITY) {
                warn!("[TGD-QSTATS] {}: SCHED_FIFO unavailable ({}), running at normal priority", name, e);
            }
            info!("[TGD-QSTATS] {} starting, tick {:?}", name, tick);
            let mut core = SamplerCore::new(clock_ns(), tick);
            let mut skipped = 0u64;
            while !t_stop.load(Ordering::Acquire) {
                std::thread::sleep(tick);
                if t_stop.load(Ordering::Acquire) { break; }
                let Some(src) = source.upgrade() else { break };
                let (batch, too_many) = core.tick(src.as_ref(), clock_ns());
                if too_many {
                    skipped += 1;
                    t_counters.too_many_links.fetch_add(1, Ordering::Relaxed);
                }
                let sampled = batch.len();
                if !batch.is_empty() {
                    src.publish_queue_stats(batch);
                }
                let n = t_counters.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                if n % core.log_every == 0 {
                    debug!("[TGD-QSTATS] {}: tick {} sampled {} links", name, n, sampled);
                    if skipped != 0 {
                        warn!("[TGD-QSTATS] {}: too_many_links on {} ticks", name, skipped);
                        skipped = 0;
                    }
                }
            }
            info!("[TGD-QSTATS] {} exiting", name);
        })?;
        Ok(QueueStatsSampler { stop, handle: Some(handle), counters })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("[TGD-QSTATS] sampler thread panicked");
            }
        }
    }
}

impl Drop for QueueStatsSampler {
    fn drop(&mut self) { self.stop(); }
}
