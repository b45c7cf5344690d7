// TGD - FIRMWARE EVENT QUEUE
// Northbound firmware events arrive on the baseband's receive context and are
// processed in order by one worker thread. The queue lock is held only to push
// or pop. Queue-stats batches from the sampler ride the same worker so that
// every ioctl is issued from one thread; a batch is dropped while the previous
// one is still waiting.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::engine::clock::clock_ms;
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::protocol::fw_msg::QueueStatsEntry;

pub const MAX_EVENT_SIZE: usize = 1024;
/// Receipt-to-done time that gets an event reported as slow.
pub const SLOW_EVENT_MS: u64 = 1000;

/// Consumer of the worker's output. Implemented by the owning device.
pub trait EventSink: Send + Sync {
    fn handle_event(&self, event: &[u8]);
    fn send_queue_stats(&self, batch: &[QueueStatsEntry]);
}

enum Work {
    Event { data: Vec<u8>, received_ms: u64 },
    QueueStats(Vec<QueueStatsEntry>),
}

#[derive(Default)]
pub struct EventCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub processed: AtomicU64,
    pub slow: AtomicU64,
    pub flushed: AtomicU64,
    pub stats_sent: AtomicU64,
    pub stats_dropped: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Work>,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
    intake: AtomicBool,
    stats_queued: AtomicBool,
    counters: EventCounters,
}

pub struct EventQueue {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Spawn the worker. Intake starts disabled.
    pub fn start(sink: Weak<dyn EventSink>, name: String) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            intake: AtomicBool::new(false),
            stats_queued: AtomicBool::new(false),
            counters: EventCounters::default(),
        });
        let t_shared = shared.clone();
        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("[TGD-EVT] {} starting", name);
            while let Some(work) = next_work(&t_shared) {
                let Some(sink) = sink.upgrade() else { break };
                match work {
                    Work::Event { data, received_ms } => {
                        let started_ms = clock_ms();
                        sink.handle_event(&data);
                        let done_ms = clock_ms();
                        t_shared.counters.processed.fetch_add(1, Ordering::Relaxed);
                        if done_ms.saturating_sub(received_ms) >= SLOW_EVENT_MS {
                            t_shared.counters.slow.fetch_add(1, Ordering::Relaxed);
                            warn!("[TGD-EVT] slow event type {}: received {} started {} done {} ms",
                                data[0], received_ms, started_ms, done_ms);
                        }
                    }
                    Work::QueueStats(batch) => {
                        t_shared.stats_queued.store(false, Ordering::Release);
                        sink.send_queue_stats(&batch);
                        t_shared.counters.stats_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("[TGD-EVT] {} exiting", name);
        })?;
        Ok(EventQueue { shared, handle: Mutex::new(Some(handle)) })
    }

    pub fn counters(&self) -> &EventCounters { &self.shared.counters }

    pub fn set_intake(&self, on: bool) {
        self.shared.intake.store(on, Ordering::Release);
        info!("[TGD-EVT] event intake {}", if on { "enabled" } else { "disabled" });
    }

    pub fn intake_enabled(&self) -> bool { self.shared.intake.load(Ordering::Acquire) }

    pub fn len(&self) -> usize { lock(&self.shared.state).items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Copy one raw firmware event into the queue.
    pub fn submit(&self, event: &[u8]) -> Result<()> {
        let checked = if event.is_empty() {
            Err(TgdError::EmptyEvent)
        } else if event.len() > MAX_EVENT_SIZE {
            Err(TgdError::EventTooLarge(event.len()))
        } else if !self.intake_enabled() {
            Err(TgdError::IntakeDisabled)
        } else {
            Ok(())
        };
        if let Err(e) = checked {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            error!("[TGD-EVT] event rejected: {}", e);
            return Err(e);
        }
        let work = Work::Event { data: event.to_vec(), received_ms: clock_ms() };
        self.push(work);
        self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a stats batch. Returns false when the previous batch is still waiting.
    pub fn push_queue_stats(&self, batch: Vec<QueueStatsEntry>) -> bool {
        if self.shared.stats_queued.swap(true, Ordering::AcqRel) {
            self.shared.counters.stats_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.push(Work::QueueStats(batch));
        true
    }

    fn push(&self, work: Work) {
        lock(&self.shared.state).items.push_back(work);
        self.shared.cv.notify_one();
    }

    /// Discard everything queued. Returns the number of events dropped.
    pub fn flush(&self) -> usize {
        let drained: Vec<Work> = lock(&self.shared.state).items.drain(..).collect();
        self.shared.stats_queued.store(false, Ordering::Release);
        let events = drained.iter().filter(|w| matches!(w, Work::Event { .. })).count();
        self.shared.counters.flushed.fetch_add(events as u64, Ordering::Relaxed);
        if events != 0 {
            debug!("[TGD-EVT] flushed {} events", events);
        }
        events
    }

    /// Let the worker finish the item in hand and join it. Queued items stay queued.
    pub fn stop(&self) {
        lock(&self.shared.state).stop = true;
        self.shared.cv.notify_all();
        let Some(h) = lock(&self.handle).take() else { return };
        if h.thread().id() == std::thread::current().id() {
            return;
        }
        if h.join().is_err() {
            warn!("[TGD-EVT] event worker panicked");
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) { self.stop(); }
}

fn next_work(shared: &Shared) -> Option<Work> {
    let mut st = lock(&shared.state);
    loop {
        if st.stop {
            return None;
        }
        if let Some(w) = st.items.pop_front() {
            return Some(w);
        }
        st = shared.cv.wait(st).unwrap_or_else(std::sync::PoisonError::into_inner);
    }
}
