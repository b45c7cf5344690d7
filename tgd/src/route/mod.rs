// TGD - ROUTING BACKENDS
// Where frames go after the link layer. One backend per radio, picked once at
// probe: a hardware offload engine when the platform has one, plain host
// delivery otherwise. Every variant answers the same capability set; per-link
// engine state lives in the link's BackendPriv.

pub mod offload;
pub mod linux;
pub mod nss;
pub mod pfe;
pub mod dpaa2;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{info, warn};

use crate::baseband::BH_MQ_QUEUE_NUM;
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::link::{Link, LinkState};
use crate::protocol::amsdu::FrameFormat;
use crate::protocol::frame::Frame;
use crate::protocol::wire::MacAddr;

pub use offload::{ConfigChannel, OffloadEngine, OffloadRequest, OffloadTx, SoftOffloadEngine};

// Host priorities the backends assign to engine-originated frames.
pub const SKB_PRIO_BE: u8 = 0;
pub const SKB_PRIO_BK: u8 = 2;
pub const SKB_PRIO_VI: u8 = 5;
pub const SKB_PRIO_VO: u8 = 6;

// ============================================================================
// BOUNDARIES
// ============================================================================

/// Host networking stack. Receives every frame the core delivers upward.
pub trait HostStack: Send + Sync {
    fn deliver(&self, dev_index: usize, frame: Frame);
}

/// Keeps every delivered frame, tagged with its interface.
#[derive(Default)]
pub struct RecordingHost {
    frames: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl RecordingHost {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { lock(&self.frames).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn take(&self) -> Vec<(usize, Vec<u8>)> { std::mem::take(&mut *lock(&self.frames)) }
}

impl HostStack for RecordingHost {
    fn deliver(&self, dev_index: usize, frame: Frame) { lock(&self.frames).push((dev_index, frame.into_vec())); }
}

/// Device services a backend drives. The owning radio implements it.
pub trait DataPath {
    fn dev_mac(&self) -> MacAddr;
    fn frame_format(&self) -> FrameFormat;
    fn radio_index(&self) -> usize;
    /// Common transmit checks. None when the frame was dropped and counted.
    fn tx_pre(&self, link: &Link, frame: Frame) -> Option<Frame>;
    /// Hand a checked frame to the radio.
    fn tx_post(&self, link: &Link, frame: Frame);
    fn deliver(&self, link: &Link, frame: Frame);
}

/// tx_pre then tx_post, for backends with no transmit work of their own.
pub fn tx_common(dp: &dyn DataPath, link: &Link, frame: Frame) {
    if let Some(frame) = dp.tx_pre(link, frame) {
        dp.tx_post(link, frame);
    }
}

// ============================================================================
// SELECTION
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Linux,
    Nss,
    Pfe,
    Dpaa2,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Linux => "linux",
            BackendKind::Nss => "nss",
            BackendKind::Pfe => "pfe",
            BackendKind::Dpaa2 => "dpaa2",
        }
    }
}

/// Requested backend. `Auto` probes engines in NSS, PFE, DPAA2 order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendChoice {
    #[default]
    Auto,
    Only(BackendKind),
}

/// Offload engines present on the platform.
#[derive(Clone, Default)]
pub struct OffloadEngines {
    pub nss: Option<Arc<dyn OffloadEngine>>,
    pub pfe: Option<Arc<dyn OffloadEngine>>,
    pub dpaa2: Option<Arc<dyn OffloadEngine>>,
}

#[derive(Clone, Copy, Debug)]
pub struct BackendOptions {
    pub choice: BackendChoice,
    pub format: FrameFormat,
    pub dpaa2_handle_local: bool,
    pub cfg_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            choice: BackendChoice::Auto,
            format: FrameFormat::Short,
            dpaa2_handle_local: false,
            cfg_timeout: offload::CFG_CALL_TIMEOUT,
        }
    }
}

/// Engine handle plus the dead flag every link channel shares.
#[derive(Clone)]
pub struct EngineHandle {
    pub engine: Arc<dyn OffloadEngine>,
    pub dead: Arc<AtomicBool>,
    pub timeout: Duration,
}

impl EngineHandle {
    fn new(engine: Arc<dyn OffloadEngine>, timeout: Duration) -> Self {
        EngineHandle { engine, dead: Arc::new(AtomicBool::new(false)), timeout }
    }

    pub fn channel(&self) -> ConfigChannel {
        ConfigChannel::new(self.engine.clone(), self.dead.clone(), self.timeout)
    }
}

// ============================================================================
// PER-LINK STATE
// ============================================================================

pub enum BackendPriv {
    Unattached,
    Linux,
    Nss(nss::NssPriv),
    Pfe(pfe::PfePriv),
    Dpaa2(dpaa2::Dpaa2Priv),
}

impl BackendPriv {
    pub fn is_attached(&self) -> bool { !matches!(self, BackendPriv::Unattached) }
}

// ============================================================================
// DISPATCH
// ============================================================================

pub enum RoutingBackend {
    Linux,
    Nss(nss::NssBackend),
    Pfe(pfe::PfeBackend),
    Dpaa2(dpaa2::Dpaa2Backend),
}

impl RoutingBackend {
    pub fn select(engines: &OffloadEngines, opts: &BackendOptions) -> Result<RoutingBackend> {
        let wants = |k: BackendKind| matches!(opts.choice, BackendChoice::Auto) || opts.choice == BackendChoice::Only(k);

        if wants(BackendKind::Nss) {
            if let Some(e) = &engines.nss {
                match nss::NssBackend::init(EngineHandle::new(e.clone(), opts.cfg_timeout), opts.format) {
                    Ok(b) => return Ok(Self::chosen(RoutingBackend::Nss(b))),
                    Err(TgdError::Unsupported(why)) => warn!("[TGD-RT] nss unavailable: {}", why),
                    Err(e) => return Err(e),
                }
            }
        }
        if wants(BackendKind::Pfe) {
            if let Some(e) = &engines.pfe {
                let b = pfe::PfeBackend::init(EngineHandle::new(e.clone(), opts.cfg_timeout))?;
                return Ok(Self::chosen(RoutingBackend::Pfe(b)));
            }
        }
        if wants(BackendKind::Dpaa2) {
            if let Some(e) = &engines.dpaa2 {
                let handle = EngineHandle::new(e.clone(), opts.cfg_timeout);
                match dpaa2::Dpaa2Backend::init(handle, opts.format, opts.dpaa2_handle_local) {
                    Ok(b) => return Ok(Self::chosen(RoutingBackend::Dpaa2(b))),
                    Err(TgdError::Unsupported(why)) => warn!("[TGD-RT] dpaa2 unavailable: {}", why),
                    Err(e) => return Err(e),
                }
            }
        }
        if let BackendChoice::Only(k) = opts.choice {
            if k != BackendKind::Linux {
                warn!("[TGD-RT] requested backend {} not available, using linux", k.name());
            }
        }
        Ok(Self::chosen(RoutingBackend::Linux))
    }

    fn chosen(b: RoutingBackend) -> RoutingBackend {
        info!("[TGD-RT] routing backend: {}", b.kind().name());
        b
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            RoutingBackend::Linux => BackendKind::Linux,
            RoutingBackend::Nss(_) => BackendKind::Nss,
            RoutingBackend::Pfe(_) => BackendKind::Pfe,
            RoutingBackend::Dpaa2(_) => BackendKind::Dpaa2,
        }
    }

    /// Links per radio this backend can carry.
    pub fn max_links(&self, requested: usize) -> usize {
        match self {
            RoutingBackend::Pfe(_) => requested.min(1),
            _ => requested,
        }
    }

    /// Route engine-originated frames back into the radios.
    pub fn attach_tx(&self, sink: Weak<dyn OffloadTx>) {
        match self {
            RoutingBackend::Pfe(b) => b.engine().register_tx(Some(sink)),
            RoutingBackend::Dpaa2(b) => b.engine().register_tx(Some(sink)),
            RoutingBackend::Nss(b) => b.engine().register_tx(Some(sink)),
            RoutingBackend::Linux => {}
        }
    }

    pub fn add_device(&self, dp: &dyn DataPath, link: &Link) -> Result<()> {
        let mut slot = lock(&link.backend);
        *slot = match self {
            RoutingBackend::Linux => BackendPriv::Linux,
            RoutingBackend::Nss(b) => BackendPriv::Nss(b.add_device(link)),
            RoutingBackend::Pfe(b) => BackendPriv::Pfe(b.add_device(link)?),
            RoutingBackend::Dpaa2(b) => BackendPriv::Dpaa2(b.add_device(dp, link)?),
        };
        Ok(())
    }

    pub fn remove_device(&self, link: &Link) {
        let mut slot = lock(&link.backend);
        let prev = std::mem::replace(&mut *slot, BackendPriv::Unattached);
        match (self, prev) {
            (RoutingBackend::Nss(b), BackendPriv::Nss(p)) => b.remove_device(link, p),
            (RoutingBackend::Pfe(b), BackendPriv::Pfe(p)) => b.remove_device(link, p),
            (RoutingBackend::Dpaa2(b), BackendPriv::Dpaa2(p)) => b.remove_device(link, p),
            _ => {}
        }
    }

    pub fn set_link_state(&self, dp: &dyn DataPath, link: &Link, state: LinkState) {
        match self {
            RoutingBackend::Linux | RoutingBackend::Dpaa2(_) => {}
            RoutingBackend::Nss(b) => b.set_link_state(dp, link, state),
            RoutingBackend::Pfe(b) => b.set_link_state(dp, link, state),
        }
    }

    /// `stop` pauses queue `qid`; otherwise resumes it. Returns true when the
    /// queue changed state; the engine only hears about real transitions.
    pub fn flow_control(&self, link: &Link, qid: u8, stop: bool) -> bool {
        if qid as usize >= BH_MQ_QUEUE_NUM {
            return false;
        }
        let changed = if stop { link.stop_queue(qid) } else { link.wake_queue(qid) };
        if !changed {
            return false;
        }
        match self {
            RoutingBackend::Linux => {}
            RoutingBackend::Nss(b) => b.flow_control(link, qid, stop),
            RoutingBackend::Pfe(b) => b.flow_control(link, qid, stop),
            RoutingBackend::Dpaa2(b) => b.flow_control(link, qid, stop),
        }
        true
    }

    /// Takes the frame on every path.
    pub fn tx(&self, dp: &dyn DataPath, link: &Link, frame: Frame) {
        match self {
            RoutingBackend::Linux | RoutingBackend::Pfe(_) => tx_common(dp, link, frame),
            RoutingBackend::Nss(b) => b.tx(dp, link, frame),
            RoutingBackend::Dpaa2(b) => b.tx(dp, link, frame),
        }
    }

    pub fn rx(&self, dp: &dyn DataPath, link: &Link, frame: Frame) {
        match self {
            RoutingBackend::Linux => linux::rx(dp, link, frame),
            RoutingBackend::Nss(b) => b.rx(dp, link, frame),
            RoutingBackend::Pfe(b) => b.rx(dp, link, frame),
            RoutingBackend::Dpaa2(b) => b.rx(dp, link, frame),
        }
    }

    pub fn module_shutdown(&self) {
        match self {
            RoutingBackend::Linux => {}
            RoutingBackend::Nss(b) => b.engine().register_tx(None),
            RoutingBackend::Pfe(b) => b.engine().shutdown(),
            RoutingBackend::Dpaa2(b) => b.engine().register_tx(None),
        }
        info!("[TGD-RT] {} backend shut down", self.kind().name());
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn soft(name: &'static str) -> Arc<SoftOffloadEngine> { Arc::new(SoftOffloadEngine::new(name)) }

    #[test]
    fn selection_order() {
        let opts = BackendOptions::default();
        assert_eq!(RoutingBackend::select(&OffloadEngines::default(), &opts).unwrap().kind(), BackendKind::Linux);

        let all = OffloadEngines { nss: Some(soft("nss")), pfe: Some(soft("pfe")), dpaa2: Some(soft("dpaa2")) };
        assert_eq!(RoutingBackend::select(&all, &opts).unwrap().kind(), BackendKind::Nss);

        // NSS refuses the standard format and selection falls through
        let std_fmt = BackendOptions { format: FrameFormat::StdShort, ..opts };
        assert_eq!(RoutingBackend::select(&all, &std_fmt).unwrap().kind(), BackendKind::Pfe);

        let d = soft("dpaa2");
        d.unsupported.store(true, std::sync::atomic::Ordering::Relaxed);
        let only_dpaa2 = OffloadEngines { dpaa2: Some(d), ..OffloadEngines::default() };
        assert_eq!(RoutingBackend::select(&only_dpaa2, &opts).unwrap().kind(), BackendKind::Linux);
    }

    #[test]
    fn explicit_choice_limits_probing() {
        let all = OffloadEngines { nss: Some(soft("nss")), pfe: Some(soft("pfe")), dpaa2: Some(soft("dpaa2")) };
        let opts = BackendOptions { choice: BackendChoice::Only(BackendKind::Dpaa2), ..BackendOptions::default() };
        assert_eq!(RoutingBackend::select(&all, &opts).unwrap().kind(), BackendKind::Dpaa2);
        let opts = BackendOptions { choice: BackendChoice::Only(BackendKind::Linux), ..BackendOptions::default() };
        assert_eq!(RoutingBackend::select(&all, &opts).unwrap().kind(), BackendKind::Linux);
        let none = OffloadEngines::default();
        let opts = BackendOptions { choice: BackendChoice::Only(BackendKind::Pfe), ..BackendOptions::default() };
        assert_eq!(RoutingBackend::select(&none, &opts).unwrap().kind(), BackendKind::Linux);
    }

    #[test]
    fn pfe_caps_links() {
        let engines = OffloadEngines { pfe: Some(soft("pfe")), ..OffloadEngines::default() };
        let b = RoutingBackend::select(&engines, &BackendOptions::default()).unwrap();
        assert_eq!(b.max_links(4), 1);
        assert_eq!(RoutingBackend::Linux.max_links(4), 4);
    }
}
