// TGD - DPAA2 ROUTING BACKEND
// Datapath accelerator. Every link gets one A-MSDU context per transmit queue
// when it is created; the engine aggregates and hands finished frames back
// through the registered transmit sink with a class of service in 1..=8.

use log::{error, warn};

use crate::baseband::{BH_MQ_QUEUE_NUM, MQ_BE, MQ_BK, MQ_VI, MQ_VO};
use crate::error::Result;
use crate::link::Link;
use crate::protocol::amsdu::{self, FrameFormat};
use crate::protocol::frame::Frame;
use crate::protocol::wire::{ethertype_of, ETH_P_TGAMSDU, ETH_P_TGSTDAMSDU};

use super::offload::{AmsduContext, ConfigChannel, OffloadEngine, OffloadRequest, OffloadRxMeta, RxClass};
use super::{tx_common, DataPath, EngineHandle, SKB_PRIO_BE, SKB_PRIO_BK, SKB_PRIO_VI, SKB_PRIO_VO};

pub const MIN_COS: u8 = 1;
pub const MAX_COS: u8 = 8;

pub const QID_TO_COS: [u8; BH_MQ_QUEUE_NUM] = [1, 3, 5, 7];

/// (host priority, radio queue) for cos 1..=8.
const COS_TO_PRIO: [(u8, u8); MAX_COS as usize] = [
    (SKB_PRIO_BK, MQ_BK), (SKB_PRIO_BK, MQ_BK),
    (SKB_PRIO_BE, MQ_BE), (SKB_PRIO_BE, MQ_BE),
    (SKB_PRIO_VI, MQ_VI), (SKB_PRIO_VI, MQ_VI),
    (SKB_PRIO_VO, MQ_VO), (SKB_PRIO_VO, MQ_VO),
];

pub const AMSDU_SIZE: u32 = 6000;
pub const AMSDU_TIMEOUT_US: u32 = 1000;

/// Host priority and radio queue for an engine class of service.
/// Out-of-range values are clamped into 1..=8.
pub fn prio_for_cos(cos: u8) -> (u8, u8) {
    COS_TO_PRIO[(cos.clamp(MIN_COS, MAX_COS) - 1) as usize]
}

pub fn context_id(dev_index: usize, qid: u8) -> u32 {
    (dev_index * BH_MQ_QUEUE_NUM) as u32 + qid as u32
}

pub struct Dpaa2Priv {
    pub contexts: Vec<u32>,
    channel: ConfigChannel,
}

impl Dpaa2Priv {
    fn delete_contexts(&mut self, link: &Link) {
        while let Some(context_id) = self.contexts.pop() {
            if let Err(e) = self.channel.call(OffloadRequest::Dpaa2DelContext { context_id }) {
                error!("[TGD-DPAA2] unable to destroy A-MSDU context {} for {}: {}", context_id, link.ifname(), e);
            }
        }
    }
}

pub struct Dpaa2Backend {
    handle: EngineHandle,
    format: FrameFormat,
    handle_local: bool,
}

impl Dpaa2Backend {
    pub fn init(handle: EngineHandle, format: FrameFormat, handle_local: bool) -> Result<Self> {
        handle.engine.init()?;
        Ok(Dpaa2Backend { handle, format, handle_local })
    }

    pub fn engine(&self) -> &dyn OffloadEngine { self.handle.engine.as_ref() }

    pub fn add_device(&self, dp: &dyn DataPath, link: &Link) -> Result<Dpaa2Priv> {
        let mut p = Dpaa2Priv { contexts: Vec::with_capacity(BH_MQ_QUEUE_NUM), channel: self.handle.channel() };
        for qid in 0..BH_MQ_QUEUE_NUM as u8 {
            let ctx = AmsduContext {
                context_id: context_id(link.dev_index(), qid),
                dev_index: link.dev_index(),
                cos: QID_TO_COS[qid as usize],
                format: self.format,
                // voice aggregates leave immediately
                timeout_us: if qid == MQ_VO { 0 } else { AMSDU_TIMEOUT_US },
                max_size: AMSDU_SIZE,
                chan_id: dp.radio_index(),
            };
            if let Err(e) = p.channel.call(OffloadRequest::Dpaa2AddContext(ctx)) {
                error!("[TGD-DPAA2] unable to create A-MSDU context {} for {} qid {}: {}",
                       ctx.context_id, link.ifname(), qid, e);
                p.delete_contexts(link);
                return Err(e);
            }
            p.contexts.push(ctx.context_id);
        }
        Ok(p)
    }

    pub fn remove_device(&self, link: &Link, mut p: Dpaa2Priv) {
        p.delete_contexts(link);
    }

    pub fn flow_control(&self, link: &Link, qid: u8, stop: bool) {
        let cos = QID_TO_COS[qid as usize];
        if let Err(code) = self.handle.engine.flow_control(link.dev_index(), cos, stop) {
            error!("[TGD-DPAA2] unable to {} flow control for {} qid {}: {}",
                   if stop { "enable" } else { "disable" }, link.ifname(), qid, code);
        }
    }

    pub fn rx(&self, _dp: &dyn DataPath, link: &Link, frame: Frame) {
        let class = match ethertype_of(frame.data()) {
            Some(ETH_P_TGAMSDU) => RxClass::TgShort,
            Some(ETH_P_TGSTDAMSDU) => RxClass::StdShort,
            _ => RxClass::Msdu,
        };
        let meta = OffloadRxMeta { dev_index: link.dev_index(), port: None, class };
        if let Err(code) = self.handle.engine.rx(frame, meta) {
            warn!("[TGD-DPAA2] {}: packet rx handler error {}", link.ifname(), code);
        }
    }

    pub fn tx(&self, dp: &dyn DataPath, link: &Link, frame: Frame) {
        if !self.handle_local || amsdu::is_aggregate(frame.data()) {
            tx_common(dp, link, frame);
            return;
        }
        let meta = OffloadRxMeta { dev_index: link.dev_index(), port: None, class: RxClass::LocalOut };
        if let Err(code) = self.handle.engine.rx(frame, meta) {
            warn!("[TGD-DPAA2] {}: packet local rx handler error {}", link.ifname(), code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::engine::lock;
    use crate::link::LinkState;
    use crate::protocol::wire::MacAddr;
    use crate::route::offload::SoftOffloadEngine;
    use crate::route::testing::{eth, link_in, RecordingPath};
    use crate::route::{BackendOptions, OffloadEngines, RoutingBackend};

    fn backend(e: &Arc<SoftOffloadEngine>, handle_local: bool) -> RoutingBackend {
        let engines = OffloadEngines { dpaa2: Some(e.clone()), ..OffloadEngines::default() };
        let opts = BackendOptions { dpaa2_handle_local: handle_local, ..BackendOptions::default() };
        RoutingBackend::select(&engines, &opts).unwrap()
    }

    #[test]
    fn cos_table_clamps() {
        assert_eq!(prio_for_cos(0), (SKB_PRIO_BK, MQ_BK));
        assert_eq!(prio_for_cos(1), (SKB_PRIO_BK, MQ_BK));
        assert_eq!(prio_for_cos(4), (SKB_PRIO_BE, MQ_BE));
        assert_eq!(prio_for_cos(6), (SKB_PRIO_VI, MQ_VI));
        assert_eq!(prio_for_cos(8), (SKB_PRIO_VO, MQ_VO));
        assert_eq!(prio_for_cos(200), (SKB_PRIO_VO, MQ_VO));
    }

    #[test]
    fn one_context_per_queue() {
        let e = Arc::new(SoftOffloadEngine::new("dpaa2"));
        let b = backend(&e, false);
        let link = link_in(LinkState::Down, MacAddr([0xAA; 6]));
        b.add_device(&RecordingPath::new(), &link).unwrap();
        let reqs = e.requests();
        assert_eq!(reqs.len(), 4);
        let OffloadRequest::Dpaa2AddContext(vo) = reqs[3] else { panic!("unexpected {:?}", reqs[3]) };
        assert_eq!((vo.context_id, vo.cos, vo.timeout_us, vo.max_size), (15, 7, 0, 6000));
        let OffloadRequest::Dpaa2AddContext(bk) = reqs[0] else { panic!("unexpected {:?}", reqs[0]) };
        assert_eq!((bk.context_id, bk.cos, bk.timeout_us), (12, 1, 1000));

        b.remove_device(&link);
        let dels = e.requests().iter().filter(|r| matches!(r, OffloadRequest::Dpaa2DelContext { .. })).count();
        assert_eq!(dels, 4);
    }

    #[test]
    fn failed_context_rolls_back() {
        let e = Arc::new(SoftOffloadEngine::new("dpaa2"));
        let b = backend(&e, false);
        let link = link_in(LinkState::Down, MacAddr([0xAA; 6]));
        e.answer_code.store(-16, Ordering::Relaxed);
        assert!(b.add_device(&RecordingPath::new(), &link).is_err());
        assert!(!lock(&link.backend).is_attached());
        // first add failed, nothing to undo
        assert_eq!(e.requests().len(), 1);
    }

    #[test]
    fn rx_classifies_frames() {
        let e = Arc::new(SoftOffloadEngine::new("dpaa2"));
        let b = backend(&e, false);
        let dp = RecordingPath::new();
        let link = link_in(LinkState::Up, MacAddr([0xAA; 6]));
        b.rx(&dp, &link, eth(ETH_P_TGAMSDU, 40));
        b.rx(&dp, &link, eth(ETH_P_TGSTDAMSDU, 40));
        b.rx(&dp, &link, eth(0x0800, 40));
        let classes: Vec<RxClass> = e.received().iter().map(|(m, _)| m.class).collect();
        assert_eq!(classes, vec![RxClass::TgShort, RxClass::StdShort, RxClass::Msdu]);
        assert!(dp.host.lock().unwrap().is_empty());
    }

    #[test]
    fn local_handling_routes_plain_frames_to_engine() {
        let e = Arc::new(SoftOffloadEngine::new("dpaa2"));
        let dp = RecordingPath::new();
        let link = link_in(LinkState::Up, MacAddr([0xAA; 6]));

        backend(&e, false).tx(&dp, &link, eth(0x0800, 40));
        assert_eq!(dp.radio.lock().unwrap().len(), 1);

        let b = backend(&e, true);
        b.tx(&dp, &link, eth(0x0800, 40));
        b.tx(&dp, &link, eth(ETH_P_TGAMSDU, 40));
        assert_eq!(dp.radio.lock().unwrap().len(), 2);
        assert_eq!(e.received()[0].0.class, RxClass::LocalOut);
    }

    #[test]
    fn flow_control_uses_queue_cos() {
        let e = Arc::new(SoftOffloadEngine::new("dpaa2"));
        let b = backend(&e, false);
        let link = link_in(LinkState::Up, MacAddr([0xAA; 6]));
        // queues start stopped, so the first resume is the only transition
        b.flow_control(&link, 0, false);
        b.flow_control(&link, 2, true);
        b.flow_control(&link, 2, false);
        b.flow_control(&link, 0, false);
        assert_eq!(e.flow_events(), vec![(3, 1, false), (3, 5, false)]);
    }
}
