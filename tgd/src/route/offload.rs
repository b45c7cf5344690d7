// TGD - OFFLOAD ENGINE CONTRACT
// Hardware packet engines (NSS, PFE, DPAA2) are configured through asynchronous
// calls: the core submits a request with a Completion, the engine answers from
// any thread. ConfigChannel turns that into a blocking call with a 2 s deadline.
// A missed deadline marks the engine dead for good; every later call fails fast
// with HW_DEAD_CODE and never reaches the hardware.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::protocol::amsdu::FrameFormat;
use crate::protocol::frame::Frame;
use crate::protocol::wire::MacAddr;

pub const CFG_CALL_TIMEOUT: Duration = Duration::from_secs(2);
pub const HW_DEAD_CODE: i32 = 0xBADF;

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NssPortKind {
    Wlan,
    NextHop,
}

/// A-MSDU aggregation parameters programmed into PFE per port and priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmsduConfig {
    pub max_size: u32,
    pub timeout_us: u32,
    pub proprietary: bool,
    pub src: MacAddr,
    pub dst: MacAddr,
}

/// One DPAA2 aggregation context: a (device, tx queue) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmsduContext {
    pub context_id: u32,
    pub dev_index: usize,
    pub cos: u8,
    pub format: FrameFormat,
    pub timeout_us: u32,
    pub max_size: u32,
    pub chan_id: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OffloadRequest {
    NssPortSet { port: i32, kind: NssPortKind, dst_port: i32, mac: MacAddr },
    NssPortCos { port: i32, cos: u8 },
    NssCosQueue { port: i32, cos: u8, queue: u8 },
    NssPortState { port: i32, up: bool },
    NssPortDelete { port: i32 },
    NssBind { port: i32, dev_index: usize },
    NssUnbind { port: i32, dev_index: usize },
    PfeAllocPort { dev_index: usize },
    PfeReleasePort { dev_index: usize },
    PfeAmsduConfigure { dev_index: usize, prio: u8, cfg: AmsduConfig },
    PfeOpenPort { dev_index: usize },
    PfeClosePort { dev_index: usize },
    Dpaa2AddContext(AmsduContext),
    Dpaa2DelContext { context_id: u32 },
}

/// How an inbound frame is presented to an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxClass {
    /// Terragraph short-format aggregate.
    TgShort,
    /// Standard-short aggregate.
    StdShort,
    /// Plain Ethernet frame.
    Msdu,
    /// Locally originated frame handed to the engine for aggregation.
    LocalOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffloadRxMeta {
    pub dev_index: usize,
    /// Engine source port, when the engine uses ports.
    pub port: Option<i32>,
    pub class: RxClass,
}

// ============================================================================
// ENGINE TRAITS
// ============================================================================

/// Frames leaving the engine toward a radio link.
pub trait OffloadTx: Send + Sync {
    fn packet_tx(&self, dev_index: usize, frame: Frame, cos: u8) -> Result<()>;
}

pub trait OffloadEngine: Send + Sync {
    fn name(&self) -> &'static str;
    /// Bring the engine API up. `Unsupported` lets selection fall through.
    fn init(&self) -> Result<()> { Ok(()) }
    /// Start an asynchronous config call. Err carries an immediate failure code.
    fn submit(&self, req: OffloadRequest, done: Completion) -> std::result::Result<(), i32>;
    /// Fire-and-forget per-cos transmit pause (`stop`) or resume.
    fn flow_control(&self, dev_index: usize, cos: u8, stop: bool) -> std::result::Result<(), i32>;
    /// Takes the frame unconditionally.
    fn rx(&self, frame: Frame, meta: OffloadRxMeta) -> std::result::Result<(), i32>;
    fn register_tx(&self, sink: Option<Weak<dyn OffloadTx>>);
    fn shutdown(&self);
}

// ============================================================================
// COMPLETION
// ============================================================================

#[derive(Default)]
struct SlotState {
    generation: u64,
    in_flight: bool,
    code: Option<i32>,
}

#[derive(Default)]
struct CallSlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

/// Answer handle for one config call. Stale or repeated answers are ignored.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<CallSlot>,
    generation: u64,
}

impl Completion {
    pub fn complete(&self, code: i32) {
        let mut s = lock(&self.slot.state);
        if s.generation == self.generation && s.in_flight && s.code.is_none() {
            s.code = Some(code);
            self.slot.done.notify_all();
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completion(gen={})", self.generation)
    }
}

// ============================================================================
// CONFIG CHANNEL
// ============================================================================

/// Serialized config calls for one link. Shares the engine-wide dead flag.
pub struct ConfigChannel {
    engine: Arc<dyn OffloadEngine>,
    dead: Arc<AtomicBool>,
    slot: Arc<CallSlot>,
    serial: Mutex<()>,
    timeout: Duration,
}

impl ConfigChannel {
    pub fn new(engine: Arc<dyn OffloadEngine>, dead: Arc<AtomicBool>, timeout: Duration) -> Self {
        ConfigChannel { engine, dead, slot: Arc::new(CallSlot::default()), serial: Mutex::new(()), timeout }
    }

    pub fn is_dead(&self) -> bool { self.dead.load(Ordering::Acquire) }

    /// Run one call to completion and return the raw engine code.
    pub fn call_raw(&self, req: OffloadRequest) -> i32 {
        let _serial = lock(&self.serial);
        if self.is_dead() {
            return HW_DEAD_CODE;
        }
        let generation = {
            let mut s = lock(&self.slot.state);
            s.generation = s.generation.wrapping_add(1);
            s.in_flight = true;
            s.code = None;
            s.generation
        };
        let done = Completion { slot: self.slot.clone(), generation };
        debug!("[TGD-RT] {} call {:?}", self.engine.name(), req);
        if let Err(code) = self.engine.submit(req, done.clone()) {
            done.complete(code);
        }
        self.wait()
    }

    pub fn call(&self, req: OffloadRequest) -> Result<()> {
        match self.call_raw(req) {
            0 => Ok(()),
            HW_DEAD_CODE => Err(TgdError::HardwareDead),
            code => Err(TgdError::ConfigCall(code)),
        }
    }

    fn wait(&self) -> i32 {
        let deadline = Instant::now() + self.timeout;
        let mut s = lock(&self.slot.state);
        while s.code.is_none() {
            let now = Instant::now();
            if now >= deadline {
                self.dead.store(true, Ordering::Release);
                error!("[TGD-RT] timeout waiting for {} to respond, offload disabled", self.engine.name());
                s.code = Some(HW_DEAD_CODE);
                break;
            }
            s = match self.slot.done.wait_timeout(s, deadline - now) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
        s.in_flight = false;
        s.code.unwrap_or(HW_DEAD_CODE)
    }
}

// ============================================================================
// SOFTWARE ENGINE
// ============================================================================

/// In-memory engine. Records every interaction; answers config calls inline,
/// from a helper thread, or never (stall).
pub struct SoftOffloadEngine {
    name: &'static str,
    requests: Mutex<Vec<OffloadRequest>>,
    flow: Mutex<Vec<(usize, u8, bool)>>,
    rx_log: Mutex<Vec<(OffloadRxMeta, Vec<u8>)>>,
    sink: Mutex<Option<Weak<dyn OffloadTx>>>,
    shut_down: AtomicBool,
    /// Never answer config calls.
    pub stall: AtomicBool,
    /// Fail every rx handoff.
    pub reject_rx: AtomicBool,
    /// Answer config calls from a separate thread.
    pub answer_async: AtomicBool,
    /// Code returned for config calls.
    pub answer_code: AtomicI32,
    /// Non-zero: refuse submission outright with this code.
    pub submit_error: AtomicI32,
    /// Returned by `init`.
    pub unsupported: AtomicBool,
}

impl SoftOffloadEngine {
    pub fn new(name: &'static str) -> Self {
        SoftOffloadEngine {
            name,
            requests: Mutex::new(Vec::new()),
            flow: Mutex::new(Vec::new()),
            rx_log: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            reject_rx: AtomicBool::new(false),
            answer_async: AtomicBool::new(false),
            answer_code: AtomicI32::new(0),
            submit_error: AtomicI32::new(0),
            unsupported: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> Vec<OffloadRequest> { lock(&self.requests).clone() }
    pub fn flow_events(&self) -> Vec<(usize, u8, bool)> { lock(&self.flow).clone() }
    pub fn received(&self) -> Vec<(OffloadRxMeta, Vec<u8>)> { lock(&self.rx_log).clone() }
    pub fn is_shut_down(&self) -> bool { self.shut_down.load(Ordering::Acquire) }
    pub fn has_sink(&self) -> bool { lock(&self.sink).as_ref().and_then(Weak::upgrade).is_some() }

    /// Play the engine forwarding a frame to a link.
    pub fn emit_tx(&self, dev_index: usize, frame: Frame, cos: u8) -> Result<()> {
        let sink = lock(&self.sink).as_ref().and_then(Weak::upgrade);
        match sink {
            Some(s) => s.packet_tx(dev_index, frame, cos),
            None => Err(TgdError::Unsupported("no tx sink registered")),
        }
    }
}

impl OffloadEngine for SoftOffloadEngine {
    fn name(&self) -> &'static str { self.name }

    fn init(&self) -> Result<()> {
        if self.unsupported.load(Ordering::Relaxed) {
            return Err(TgdError::Unsupported("offload engine not present"));
        }
        Ok(())
    }

    fn submit(&self, req: OffloadRequest, done: Completion) -> std::result::Result<(), i32> {
        let refuse = self.submit_error.load(Ordering::Relaxed);
        if refuse != 0 {
            return Err(refuse);
        }
        lock(&self.requests).push(req);
        if self.stall.load(Ordering::Relaxed) {
            return Ok(());
        }
        let code = self.answer_code.load(Ordering::Relaxed);
        if self.answer_async.load(Ordering::Relaxed) {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(1));
                done.complete(code);
            });
        } else {
            done.complete(code);
        }
        Ok(())
    }

    fn flow_control(&self, dev_index: usize, cos: u8, stop: bool) -> std::result::Result<(), i32> {
        lock(&self.flow).push((dev_index, cos, stop));
        Ok(())
    }

    fn rx(&self, frame: Frame, meta: OffloadRxMeta) -> std::result::Result<(), i32> {
        if self.reject_rx.load(Ordering::Relaxed) {
            return Err(-libc::ENOMEM);
        }
        lock(&self.rx_log).push((meta, frame.into_vec()));
        Ok(())
    }

    fn register_tx(&self, sink: Option<Weak<dyn OffloadTx>>) { *lock(&self.sink) = sink; }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        *lock(&self.sink) = None;
    }
}
