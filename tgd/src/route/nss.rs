// TGD - NSS ROUTING BACKEND
// Network-subsystem offload. Each link owns two engine ports: a WLAN port
// facing the CPU and a next-hop port carrying the peer MAC. Inbound aggregates
// go to the engine tagged with the WLAN port; outbound frames arrive either from
// the engine (already aggregated, cos in the side band) or from the host
// (aggregated here).

use log::{debug, error};

use crate::baseband::BH_MQ_QUEUE_NUM;
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::link::{Counter, Link, LinkState};
use crate::protocol::amsdu::{self, FrameFormat};
use crate::protocol::frame::{Frame, FrameMeta, FrameOrigin};
use crate::protocol::wire::{ethertype_of, ETH_P_TGAMSDU};

use super::offload::{ConfigChannel, NssPortKind, OffloadEngine, OffloadRequest, OffloadRxMeta, RxClass};
use super::{BackendPriv, DataPath, EngineHandle, SKB_PRIO_BE, SKB_PRIO_VI};

pub const NSS_WLAN_PORT_START: i32 = 16;
pub const NSS_CPU_PORT: i32 = 10;
pub const NSS_NH_PORT_START: i32 = 32;
pub const NSS_INVALID_PORT: i32 = -1;

// Class-of-service values shared with the engine's forwarding agent.
pub const NSS_COS_HI: u8 = 0;
pub const NSS_COS_LO: u8 = 2;

/// Radio queue to engine class of service.
pub const QID_TO_COS: [u8; BH_MQ_QUEUE_NUM] = [NSS_COS_LO, NSS_COS_LO, NSS_COS_HI, NSS_COS_HI];

pub struct NssPriv {
    pub wlan_port: i32,
    pub nh_port: i32,
    pub bound: bool,
    channel: ConfigChannel,
}

impl NssPriv {
    fn delete_ports(&mut self, link: &Link) {
        link.set_offload_port(NSS_INVALID_PORT);
        for port in [&mut self.nh_port, &mut self.wlan_port] {
            if *port != NSS_INVALID_PORT {
                let _ = self.channel.call(OffloadRequest::NssPortDelete { port: *port });
                *port = NSS_INVALID_PORT;
            }
        }
    }

    fn set_ports(&mut self, dp: &dyn DataPath, link: &Link) -> Result<()> {
        let wlan = NSS_WLAN_PORT_START + link.dev_index() as i32;
        self.channel.call(OffloadRequest::NssPortSet {
            port: wlan,
            kind: NssPortKind::Wlan,
            dst_port: NSS_CPU_PORT,
            mac: dp.dev_mac(),
        }).map_err(|e| {
            error!("[TGD-NSS] wlan port {} add failed: {}", wlan, e);
            e
        })?;
        self.channel.call(OffloadRequest::NssPortCos { port: wlan, cos: NSS_COS_LO }).map_err(|e| {
            error!("[TGD-NSS] wlan port {} default cos failed: {}", wlan, e);
            e
        })?;
        self.wlan_port = wlan;
        link.set_offload_port(wlan);

        // ctrl traffic on queue 1, data on queue 0
        for (cos, queue) in [(NSS_COS_HI, 1), (NSS_COS_LO, 0)] {
            if let Err(e) = self.channel.call(OffloadRequest::NssCosQueue { port: wlan, cos, queue }) {
                error!("[TGD-NSS] port {} cos {} to queue {} failed: {}", wlan, cos, queue, e);
            }
        }

        let nh = NSS_NH_PORT_START + link.dev_index() as i32;
        if let Err(e) = self.channel.call(OffloadRequest::NssPortSet {
            port: nh,
            kind: NssPortKind::NextHop,
            dst_port: wlan,
            mac: link.peer(),
        }) {
            error!("[TGD-NSS] next hop port {} add failed: {}", nh, e);
            self.delete_ports(link);
            return Err(e);
        }
        self.nh_port = nh;
        Ok(())
    }

    fn bind(&mut self, link: &Link) {
        if self.bound {
            return;
        }
        match self.channel.call(OffloadRequest::NssBind { port: self.wlan_port, dev_index: link.dev_index() }) {
            Ok(()) => self.bound = true,
            Err(e) => error!("[TGD-NSS] bind of port {} failed: {}", self.wlan_port, e),
        }
    }

    fn unbind(&mut self, link: &Link) {
        if !self.bound {
            return;
        }
        self.bound = false;
        if let Err(e) = self.channel.call(OffloadRequest::NssUnbind { port: self.wlan_port, dev_index: link.dev_index() }) {
            error!("[TGD-NSS] unbind of port {} failed: {}", self.wlan_port, e);
        }
    }
}

pub struct NssBackend {
    handle: EngineHandle,
}

impl NssBackend {
    pub fn init(handle: EngineHandle, format: FrameFormat) -> Result<Self> {
        if format != FrameFormat::Short {
            error!("[TGD-NSS] unsupported A-MSDU format {:?} requested", format);
            return Err(TgdError::Unsupported("nss requires the short A-MSDU format"));
        }
        handle.engine.init()?;
        Ok(NssBackend { handle })
    }

    pub fn engine(&self) -> &dyn OffloadEngine { self.handle.engine.as_ref() }

    pub fn add_device(&self, _link: &Link) -> NssPriv {
        NssPriv {
            wlan_port: NSS_INVALID_PORT,
            nh_port: NSS_INVALID_PORT,
            bound: false,
            channel: self.handle.channel(),
        }
    }

    pub fn remove_device(&self, link: &Link, mut p: NssPriv) {
        p.unbind(link);
        p.delete_ports(link);
    }

    pub fn set_link_state(&self, dp: &dyn DataPath, link: &Link, state: LinkState) {
        debug!("[TGD-NSS] link {} event for {}", state.name(), link.ifname());
        let mut slot = lock(&link.backend);
        let BackendPriv::Nss(p) = &mut *slot else { return };
        if state == LinkState::Up {
            if p.set_ports(dp, link).is_err() {
                return;
            }
            p.bind(link);
            // release queues left paused by an earlier link down
            for cos in [NSS_COS_HI, NSS_COS_LO] {
                let _ = self.handle.engine.flow_control(link.dev_index(), cos, false);
            }
        } else {
            for port in [p.wlan_port, p.nh_port] {
                if port != NSS_INVALID_PORT {
                    let _ = p.channel.call(OffloadRequest::NssPortState { port, up: false });
                }
            }
        }
    }

    pub fn flow_control(&self, link: &Link, qid: u8, stop: bool) {
        let cos = QID_TO_COS[qid as usize];
        if let Err(code) = self.handle.engine.flow_control(link.dev_index(), cos, stop) {
            debug!("[TGD-NSS] flow control of {} qid {} failed: {}", link.ifname(), qid, code);
        }
    }

    pub fn rx(&self, dp: &dyn DataPath, link: &Link, frame: Frame) {
        if ethertype_of(frame.data()) != Some(ETH_P_TGAMSDU) {
            dp.deliver(link, frame);
            return;
        }
        let meta = OffloadRxMeta { dev_index: link.dev_index(), port: Some(link.offload_port()), class: RxClass::TgShort };
        if let Err(code) = self.handle.engine.rx(frame, meta) {
            debug!("[TGD-NSS] rx on {} failed: {}", link.ifname(), code);
            link.counters.inc(Counter::RxErrNoMdata);
        }
    }

    pub fn tx(&self, dp: &dyn DataPath, link: &Link, mut frame: Frame) {
        let from_engine = match (frame.meta.origin, frame.meta.offload_tag) {
            (FrameOrigin::Offload, Some(cos)) => {
                frame.priority = if cos != 0 { SKB_PRIO_BE } else { SKB_PRIO_VI };
                link.counters.inc(if cos != 0 { Counter::TxFromNssDataCos } else { Counter::TxFromNssCtrlCos });
                link.counters.inc(Counter::TxFromNss);
                frame.meta = FrameMeta::default();
                true
            }
            _ => {
                link.counters.inc(if frame.priority != 0 { Counter::TxFromLnxDataCos } else { Counter::TxFromLnxCtrlCos });
                link.counters.inc(Counter::TxFromLinux);
                false
            }
        };
        let Some(mut frame) = dp.tx_pre(link, frame) else { return };
        if !from_engine {
            frame = amsdu::encapsulate(frame);
        }
        dp.tx_post(link, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::protocol::amsdu::AMSDU_PREFIX_LEN;
    use crate::protocol::wire::MacAddr;
    use crate::route::offload::SoftOffloadEngine;
    use crate::route::testing::{eth, link_in, RecordingPath};
    use crate::route::{BackendKind, BackendOptions, OffloadEngines, RoutingBackend};

    const PEER: MacAddr = MacAddr([0xAA; 6]);

    fn setup() -> (Arc<SoftOffloadEngine>, RoutingBackend, RecordingPath, Link) {
        let e = Arc::new(SoftOffloadEngine::new("nss"));
        let engines = OffloadEngines { nss: Some(e.clone()), ..OffloadEngines::default() };
        let b = RoutingBackend::select(&engines, &BackendOptions::default()).unwrap();
        assert_eq!(b.kind(), BackendKind::Nss);
        let dp = RecordingPath::new();
        let link = link_in(LinkState::Up, PEER);
        b.add_device(&dp, &link).unwrap();
        (e, b, dp, link)
    }

    fn ports(link: &Link) -> (i32, i32, bool) {
        match &*lock(&link.backend) {
            BackendPriv::Nss(p) => (p.wlan_port, p.nh_port, p.bound),
            _ => panic!("not an nss link"),
        }
    }

    #[test]
    fn link_up_programs_ports_and_binds_once() {
        let (e, b, dp, link) = setup();
        assert_eq!(ports(&link), (NSS_INVALID_PORT, NSS_INVALID_PORT, false));
        b.set_link_state(&dp, &link, LinkState::Up);
        assert_eq!(ports(&link), (19, 35, true));
        let reqs = e.requests();
        assert_eq!(reqs[0], OffloadRequest::NssPortSet { port: 19, kind: NssPortKind::Wlan, dst_port: NSS_CPU_PORT, mac: dp.mac });
        assert_eq!(reqs[1], OffloadRequest::NssPortCos { port: 19, cos: NSS_COS_LO });
        assert_eq!(reqs[4], OffloadRequest::NssPortSet { port: 35, kind: NssPortKind::NextHop, dst_port: 19, mac: PEER });
        assert_eq!(reqs[5], OffloadRequest::NssBind { port: 19, dev_index: 3 });
        assert_eq!(e.flow_events(), vec![(3, NSS_COS_HI, false), (3, NSS_COS_LO, false)]);

        b.set_link_state(&dp, &link, LinkState::Up);
        let binds = e.requests().iter().filter(|r| matches!(r, OffloadRequest::NssBind { .. })).count();
        assert_eq!(binds, 1);

        b.set_link_state(&dp, &link, LinkState::Down);
        let reqs = e.requests();
        assert_eq!(&reqs[reqs.len() - 2..], &[
            OffloadRequest::NssPortState { port: 19, up: false },
            OffloadRequest::NssPortState { port: 35, up: false },
        ]);
    }

    #[test]
    fn remove_unbinds_then_deletes_ports() {
        let (e, b, dp, link) = setup();
        b.set_link_state(&dp, &link, LinkState::Up);
        assert_eq!(link.offload_port(), 19);
        b.remove_device(&link);
        assert_eq!(link.offload_port(), NSS_INVALID_PORT);
        let reqs = e.requests();
        assert!(reqs.contains(&OffloadRequest::NssUnbind { port: 19, dev_index: 3 }));
        assert!(reqs.contains(&OffloadRequest::NssPortDelete { port: 35 }));
        assert!(reqs.contains(&OffloadRequest::NssPortDelete { port: 19 }));
        assert!(!lock(&link.backend).is_attached());
    }

    #[test]
    fn refused_port_set_leaves_link_unbound() {
        let (e, b, dp, link) = setup();
        e.answer_code.store(-22, Ordering::Relaxed);
        b.set_link_state(&dp, &link, LinkState::Up);
        assert_eq!(ports(&link), (NSS_INVALID_PORT, NSS_INVALID_PORT, false));
        assert!(e.flow_events().is_empty());
    }

    #[test]
    fn rx_hands_aggregates_to_engine() {
        let (e, b, dp, link) = setup();
        b.set_link_state(&dp, &link, LinkState::Up);
        b.rx(&dp, &link, eth(0x0800, 60));
        assert_eq!(dp.host.lock().unwrap().len(), 1);
        b.rx(&dp, &link, eth(ETH_P_TGAMSDU, 60));
        let got = e.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, OffloadRxMeta { dev_index: 3, port: Some(19), class: RxClass::TgShort });

        e.reject_rx.store(true, Ordering::Relaxed);
        b.rx(&dp, &link, eth(ETH_P_TGAMSDU, 60));
        assert_eq!(link.counters.get(Counter::RxErrNoMdata), 1);
    }

    #[test]
    fn rx_does_not_wait_for_port_programming() {
        let (e, b, dp, link) = setup();
        e.stall.store(true, Ordering::Relaxed);
        std::thread::scope(|s| {
            s.spawn(|| b.set_link_state(&dp, &link, LinkState::Up));
            let deadline = Instant::now() + Duration::from_secs(1);
            while e.requests().is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(e.requests().len(), 1);

            let start = Instant::now();
            b.rx(&dp, &link, eth(ETH_P_TGAMSDU, 60));
            assert!(start.elapsed() < Duration::from_millis(200));
            assert_eq!(e.received().len(), 1);
        });
    }

    #[test]
    fn tx_from_engine_and_host() {
        let (_e, b, dp, link) = setup();
        let meta = FrameMeta { origin: FrameOrigin::Offload, offload_tag: Some(2) };
        b.tx(&dp, &link, eth(ETH_P_TGAMSDU, 60).with_meta(meta));
        b.tx(&dp, &link, eth(0x0800, 60).with_priority(3));
        b.tx(&dp, &link, eth(0x0800, 60));

        assert_eq!(link.counters.get(Counter::TxFromNss), 1);
        assert_eq!(link.counters.get(Counter::TxFromNssDataCos), 1);
        assert_eq!(link.counters.get(Counter::TxFromLinux), 2);
        assert_eq!(link.counters.get(Counter::TxFromLnxDataCos), 1);
        assert_eq!(link.counters.get(Counter::TxFromLnxCtrlCos), 1);
        let radio = dp.radio.lock().unwrap();
        assert_eq!(radio[0].len(), 60);
        assert_eq!(radio[1].len(), 60 + AMSDU_PREFIX_LEN);
    }

    #[test]
    fn flow_control_maps_queue_to_cos() {
        let (e, b, _dp, link) = setup();
        link.wake_all_queues();
        assert!(b.flow_control(&link, 3, true));
        assert!(link.queue_stopped(3));
        assert!(b.flow_control(&link, 0, true));
        assert!(b.flow_control(&link, 0, false));
        assert_eq!(e.flow_events(), vec![(3, NSS_COS_HI, true), (3, NSS_COS_LO, true), (3, NSS_COS_LO, false)]);
    }

    #[test]
    fn repeated_toggle_reaches_engine_once() {
        let (e, b, _dp, link) = setup();
        link.wake_all_queues();
        assert!(b.flow_control(&link, 3, true));
        assert!(!b.flow_control(&link, 3, true));
        assert!(b.flow_control(&link, 3, false));
        assert!(!b.flow_control(&link, 3, false));
        assert_eq!(e.flow_events(), vec![(3, NSS_COS_HI, true), (3, NSS_COS_HI, false)]);
    }

    #[test]
    fn standard_format_is_refused() {
        let e = Arc::new(SoftOffloadEngine::new("nss"));
        let h = EngineHandle::new(e, Default::default());
        assert!(matches!(NssBackend::init(h, FrameFormat::StdShort), Err(TgdError::Unsupported(_))));
    }
}
