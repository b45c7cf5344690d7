// TGD - PFE ROUTING BACKEND
// Packet forwarding engine. One engine port per link, opened while the link is
// Up with a low-priority A-MSDU context aimed at the peer. The engine sends
// frames back through the device transmit entry, so transmit itself is the
// common path.

use log::{debug, error};

use crate::baseband::BH_MQ_QUEUE_NUM;
use crate::engine::lock;
use crate::error::Result;
use crate::link::{Counter, Link, LinkState};
use crate::protocol::frame::Frame;
use crate::protocol::wire::{ethertype_of, ETH_P_TGAMSDU};

use super::offload::{AmsduConfig, ConfigChannel, OffloadEngine, OffloadRequest, OffloadRxMeta, RxClass};
use super::{BackendPriv, DataPath, EngineHandle};

pub const PFE_PRIO_LO: u8 = 0;
pub const PFE_PRIO_HI: u8 = 1;

pub const QID_TO_PRIO: [u8; BH_MQ_QUEUE_NUM] = [PFE_PRIO_LO, PFE_PRIO_LO, PFE_PRIO_HI, PFE_PRIO_HI];

pub const AMSDU_DATA_SIZE: u32 = 6000;
pub const AMSDU_DATA_TIMEOUT_US: u32 = 1000;

pub struct PfePriv {
    pub open: bool,
    channel: ConfigChannel,
}

pub struct PfeBackend {
    handle: EngineHandle,
}

impl PfeBackend {
    pub fn init(handle: EngineHandle) -> Result<Self> {
        handle.engine.init()?;
        Ok(PfeBackend { handle })
    }

    pub fn engine(&self) -> &dyn OffloadEngine { self.handle.engine.as_ref() }

    pub fn add_device(&self, link: &Link) -> Result<PfePriv> {
        let channel = self.handle.channel();
        channel.call(OffloadRequest::PfeAllocPort { dev_index: link.dev_index() })?;
        Ok(PfePriv { open: false, channel })
    }

    pub fn remove_device(&self, link: &Link, p: PfePriv) {
        if let Err(e) = p.channel.call(OffloadRequest::PfeReleasePort { dev_index: link.dev_index() }) {
            error!("[TGD-PFE] release of {} failed: {}", link.ifname(), e);
        }
    }

    pub fn set_link_state(&self, dp: &dyn DataPath, link: &Link, state: LinkState) {
        let mut slot = lock(&link.backend);
        let BackendPriv::Pfe(p) = &mut *slot else { return };
        let dev_index = link.dev_index();
        if state == LinkState::Up {
            let cfg = AmsduConfig {
                max_size: AMSDU_DATA_SIZE,
                timeout_us: AMSDU_DATA_TIMEOUT_US,
                proprietary: true,
                src: dp.dev_mac(),
                dst: link.peer(),
            };
            if let Err(e) = p.channel.call(OffloadRequest::PfeAmsduConfigure { dev_index, prio: PFE_PRIO_LO, cfg }) {
                error!("[TGD-PFE] A-MSDU configure on {} failed: {}", link.ifname(), e);
            }
            p.open = p.channel.call(OffloadRequest::PfeOpenPort { dev_index }).is_ok();
        } else {
            let _ = p.channel.call(OffloadRequest::PfeClosePort { dev_index });
            p.open = false;
        }
    }

    pub fn flow_control(&self, link: &Link, qid: u8, stop: bool) {
        if let Err(code) = self.handle.engine.flow_control(link.dev_index(), QID_TO_PRIO[qid as usize], stop) {
            debug!("[TGD-PFE] flow control of {} qid {} failed: {}", link.ifname(), qid, code);
        }
    }

    pub fn rx(&self, dp: &dyn DataPath, link: &Link, frame: Frame) {
        if ethertype_of(frame.data()) != Some(ETH_P_TGAMSDU) {
            dp.deliver(link, frame);
            return;
        }
        let meta = OffloadRxMeta { dev_index: link.dev_index(), port: None, class: RxClass::TgShort };
        if let Err(code) = self.handle.engine.rx(frame, meta) {
            debug!("[TGD-PFE] full on {}: {}", link.ifname(), code);
            link.counters.inc(Counter::RxDropPackets);
        }
    }
}
