// TGD - RADIO DEVICE
// One baseband radio and everything hanging off it: the link table, the
// routing backend, the firmware event worker. Implements every seam the
// lower layers call back through (link hooks, key installer, data path,
// queue-stats source, event sink, offload tx) so each of them stays ignorant
// of the others.
//
// Radio callbacks reach the device through a ClientHandle holding a Weak
// reference; the baseband never keeps a radio alive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, error, info, warn};

use crate::baseband::{
    Baseband, BhClient, BhLinkStats, LinkInfoDesc, RxDesc, TxDesc, BH_MQ_PRIO_NUM, BH_MQ_QUEUE_NUM, TX_LIFETIME,
};
use crate::control::events::{EventQueue, EventSink};
use crate::control::handler::{self, GpsHook, HtsfRegistry, NlCounters};
use crate::control::notify::{Notification, NotificationBus};
use crate::engine::sampler::{LinkQueueStats, QueueStatsSource};
use crate::error::{Result, TgdError};
use crate::link::{Counter, Link, LinkHooks, LinkState, LinkTable};
use crate::protocol::amsdu::FrameFormat;
use crate::protocol::frame::{Frame, FrameMeta, FrameOrigin};
use crate::protocol::fw_msg::QueueStatsEntry;
use crate::protocol::wire::{ethertype_of, MacAddr, ETH_ALEN, ETH_HLEN};
use crate::route::{dpaa2, tx_common, BackendKind, DataPath, HostStack, OffloadTx, RoutingBackend};
use crate::route::{SKB_PRIO_BE, SKB_PRIO_VI};
use crate::security::KeyInstaller;

const ETH_P_IPV6: u16 = 0x86DD;
/// Network-control DSCP; those IPv6 frames ride the video queue.
const DSCP_NC: u8 = 0x30;

// ============================================================================
// CONSTRUCTION
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    pub radio: usize,
    pub num_links: usize,
    pub format: FrameFormat,
    /// Master flow-control switch. Cleared during removal.
    pub fc_enable: bool,
    /// Act on the radio's suspend/resume callbacks.
    pub bh_flow_control: bool,
}

/// Platform services shared by every radio.
#[derive(Clone)]
pub struct DeviceServices {
    pub baseband: Arc<dyn Baseband>,
    pub host: Arc<dyn HostStack>,
    pub bus: Arc<dyn NotificationBus>,
    pub gps: Option<Arc<dyn GpsHook>>,
    pub htsf: Arc<HtsfRegistry>,
}

/// Per-link row of the stats report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkReport {
    pub link: i32,
    pub state: LinkState,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub dst: MacAddr,
    pub src: MacAddr,
    pub dev_index: usize,
}

pub struct Device {
    radio: usize,
    mac: AtomicU64,
    baseband: Arc<dyn Baseband>,
    prio_map: [u8; BH_MQ_PRIO_NUM],
    backend: RoutingBackend,
    links: LinkTable,
    host: Arc<dyn HostStack>,
    bus: Arc<dyn NotificationBus>,
    gps: Option<Arc<dyn GpsHook>>,
    htsf: Arc<HtsfRegistry>,
    events: OnceLock<EventQueue>,
    nl: NlCounters,
    format: FrameFormat,
    fc_enable: AtomicBool,
    bh_flow_control: bool,
    admin_up: AtomicBool,
}

impl Device {
    /// Build the radio, wire every link's security gate back to it and start
    /// the event worker with intake disabled. Links are not yet attached to
    /// the backend; see `attach_links`.
    pub fn new(cfg: DeviceConfig, services: DeviceServices, backend: RoutingBackend) -> Result<Arc<Device>> {
        let DeviceServices { baseband, host, bus, gps, htsf } = services;
        let dev = Arc::new(Device {
            radio: cfg.radio,
            mac: AtomicU64::new(baseband.mac_addr().to_u64()),
            prio_map: baseband.prio_queue_map(),
            baseband,
            backend,
            links: LinkTable::new(cfg.num_links, cfg.num_links * cfg.radio),
            host,
            bus,
            gps,
            htsf,
            events: OnceLock::new(),
            nl: NlCounters::default(),
            format: cfg.format,
            fc_enable: AtomicBool::new(cfg.fc_enable),
            bh_flow_control: cfg.bh_flow_control,
            admin_up: AtomicBool::new(false),
        });

        let installer: Weak<dyn KeyInstaller> = Arc::downgrade(&dev) as Weak<dyn KeyInstaller>;
        for l in dev.links.iter() {
            l.security.attach(installer.clone());
        }
        let sink: Weak<dyn EventSink> = Arc::downgrade(&dev) as Weak<dyn EventSink>;
        let queue = EventQueue::start(sink, format!("tgrxevt.{}", cfg.radio))?;
        if dev.events.set(queue).is_err() {
            return Err(TgdError::AlreadyRegistered);
        }
        info!("[TGD-DEV] radio {} mac {}: {} links, backend {}",
            dev.radio, dev.mac(), dev.links.len(), dev.backend.kind().name());
        Ok(dev)
    }

    /// Give every link its backend state. Rolls back on the first refusal.
    pub fn attach_links(&self) -> Result<()> {
        for (i, l) in self.links.iter().enumerate() {
            if let Err(e) = self.backend.add_device(self, l) {
                error!("[TGD-DEV] {}: backend refused link: {}", l.ifname(), e);
                for prev in self.links.iter().take(i).rev() {
                    self.backend.remove_device(prev);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn detach_links(&self) {
        for l in self.links.iter() {
            self.backend.remove_device(l);
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    #[inline(always)] pub fn radio(&self) -> usize { self.radio }
    #[inline(always)] pub fn mac(&self) -> MacAddr { MacAddr::from_u64(self.mac.load(Ordering::Acquire)) }
    #[inline(always)] pub fn links(&self) -> &LinkTable { &self.links }
    pub fn baseband(&self) -> &dyn Baseband { self.baseband.as_ref() }
    pub fn backend(&self) -> &RoutingBackend { &self.backend }
    pub fn bus(&self) -> &dyn NotificationBus { self.bus.as_ref() }
    pub fn gps(&self) -> Option<&dyn GpsHook> { self.gps.as_deref() }
    pub fn htsf(&self) -> &HtsfRegistry { &self.htsf }
    pub fn nl(&self) -> &NlCounters { &self.nl }
    pub fn events(&self) -> Option<&EventQueue> { self.events.get() }
    pub fn is_up(&self) -> bool { self.admin_up.load(Ordering::Acquire) }

    pub fn link(&self, index: usize) -> Result<&Link> {
        self.links.get(index).ok_or(TgdError::InvalidArgument("link index out of range"))
    }

    pub fn link_by_dev_index(&self, dev_index: usize) -> Option<&Link> {
        self.links.iter().find(|l| l.dev_index() == dev_index)
    }

    pub fn owns(&self, dev_index: usize) -> bool { self.link_by_dev_index(dev_index).is_some() }

    pub fn set_fc_enable(&self, on: bool) { self.fc_enable.store(on, Ordering::Release); }

    pub fn set_intake(&self, on: bool) {
        if let Some(q) = self.events() {
            q.set_intake(on);
        }
    }

    /// Disable intake, join the worker and drop whatever it left queued.
    pub fn stop_events(&self) -> usize {
        let Some(q) = self.events() else { return 0 };
        q.set_intake(false);
        q.stop();
        q.flush()
    }

    // ========================================================================
    // ADMIN
    // ========================================================================

    pub fn open(&self) {
        if !self.admin_up.swap(true, Ordering::AcqRel) {
            info!("[TGD-DEV] radio {} open", self.radio);
        }
    }

    /// Take the radio down: every link that left Init is torn down.
    pub fn stop(&self) {
        self.admin_up.store(false, Ordering::Release);
        for l in self.links.iter().filter(|l| l.state() != LinkState::Init) {
            self.links.teardown(self, l);
        }
        info!("[TGD-DEV] radio {} stopped", self.radio);
    }

    pub fn set_if_mac_addr(&self, mac: MacAddr) {
        let old = MacAddr::from_u64(self.mac.swap(mac.to_u64(), Ordering::AcqRel));
        info!("[TGD-DEV] radio {} mac {} -> {}", self.radio, old, mac);
    }

    // ========================================================================
    // FIRMWARE-DRIVEN LINK CHANGES
    // ========================================================================

    pub fn set_link_mac_addr(&self, peer: MacAddr, rx_link: u8, tx_link: u8) {
        match self.links.bind(self, peer, rx_link as i32, tx_link as i32) {
            Ok(l) => info!("[TGD-DEV] {} bound to {} rx {} tx {}", l.ifname(), peer, rx_link, tx_link),
            Err(e) => error!("[TGD-DEV] radio {}: cannot bind {}: {}", self.radio, peer, e),
        }
    }

    pub fn del_link_info(&self, peer: MacAddr) -> Result<()> {
        self.links.teardown_peer(self, peer)
    }

    // ========================================================================
    // STATION (supplicant / authenticator)
    // ========================================================================

    /// Station flags changed. Opening the port announces the secured link.
    pub fn authorize_station(&self, link_index: usize, authorized: bool) -> Result<()> {
        let link = self.link(link_index)?;
        if link.security.change_station(authorized) {
            self.bus.publish(Notification::WsecLinkup { ifname: link.ifname(), peer: link.peer() });
        }
        Ok(())
    }

    /// Close the port and ask firmware to drop the peer, if one is connected.
    pub fn del_station(&self, link_index: usize) -> Result<()> {
        let link = self.link(link_index)?;
        if let Some(peer) = link.security.del_station() {
            handler::send_disassoc_req(self.baseband(), peer)?;
        }
        Ok(())
    }

    // ========================================================================
    // TRANSMIT
    // ========================================================================

    /// Host priority -> radio queue. IPv6 network-control traffic is promoted.
    pub fn select_queue(&self, frame: &mut Frame) -> u8 {
        let d = frame.data();
        if ethertype_of(d) == Some(ETH_P_IPV6) && d.len() >= ETH_HLEN + 2 {
            let tc = ((d[ETH_HLEN] & 0x0F) << 4) | (d[ETH_HLEN + 1] >> 4);
            frame.priority = if tc >> 2 == DSCP_NC { SKB_PRIO_VI } else { SKB_PRIO_BE };
        }
        let q = self.prio_map[(frame.priority as usize).min(BH_MQ_PRIO_NUM - 1)];
        frame.queue = q;
        q
    }

    pub fn xmit(&self, link: &Link, mut frame: Frame) {
        self.select_queue(&mut frame);
        self.backend.tx(self, link, frame);
    }

    /// Host transmit on one link interface. Takes the frame on every path.
    pub fn transmit(&self, link_index: usize, frame: Frame) -> Result<()> {
        let link = self.link(link_index)?;
        if !self.is_up() {
            link.counters.inc(Counter::TxTgdErr);
            return Ok(());
        }
        self.xmit(link, frame);
        Ok(())
    }

    // ========================================================================
    // RECEIVE
    // ========================================================================

    pub fn rx_frame(&self, link: &Link, frame: Frame) {
        if !link.security.admits(frame.data()) {
            link.counters.inc(Counter::RxTgdRxStopped);
            return;
        }
        self.backend.rx(self, link, frame);
    }

    // ========================================================================
    // FLOW CONTROL
    // ========================================================================

    /// Radio asked to stop or resume queue `qid` of the link using `tx_link`.
    pub fn flow_control_common(&self, link: &Link, tx_link: i32, qid: u8, stop: bool) {
        if !self.fc_enable.load(Ordering::Acquire) || link.tx_link() != tx_link {
            return;
        }
        if qid as usize >= BH_MQ_QUEUE_NUM {
            warn!("[TGD-DEV] {}: flow control for bad queue {}", link.ifname(), qid);
            return;
        }
        if stop {
            if self.backend.flow_control(link, qid, true) {
                link.counters.inc(Counter::LinkSuspend);
            }
        } else if link.state() == LinkState::Up {
            if self.backend.flow_control(link, qid, false) {
                link.counters.inc(Counter::LinkResume);
            }
        } else {
            debug!("[TGD-DEV] {}: suppress flow off for queue {} in {}", link.ifname(), qid, link.state().name());
        }
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn refresh_link_stats(&self) {
        for l in self.links.iter().filter(|l| l.tx_link() >= 0) {
            if let Some(cur) = self.fetch_stats(l) {
                l.with_stats(|s| s.refresh(&cur));
            }
        }
    }

    /// One row per link that has left Init.
    pub fn stats(&self) -> Vec<LinkReport> {
        self.refresh_link_stats();
        let src = self.mac();
        self.links
            .iter()
            .filter(|l| l.state() != LinkState::Init)
            .map(|l| {
                let s = l.interface_stats();
                LinkReport {
                    link: l.tx_link(),
                    state: l.state(),
                    rx_packets: s.rx_packets,
                    tx_packets: s.tx_packets,
                    rx_bytes: s.rx_bytes,
                    tx_bytes: s.tx_bytes,
                    tx_errors: s.tx_errors,
                    dst: l.peer(),
                    src,
                    dev_index: l.dev_index(),
                }
            })
            .collect()
    }
}

// ============================================================================
// SEAMS
// ============================================================================

impl LinkHooks for Device {
    fn add_link_info(&self, link: &Link) -> Result<()> {
        let desc = LinkInfoDesc { peer_index: link.index(), rx_link: link.rx_link(), tx_link: link.tx_link() };
        self.baseband.add_link_info(&desc)
    }

    fn delete_link_info(&self, link: &Link) {
        let desc = LinkInfoDesc { peer_index: link.index(), rx_link: link.rx_link(), tx_link: link.tx_link() };
        if let Err(e) = self.baseband.delete_link_info(&desc) {
            warn!("[TGD-DEV] {}: delete link info failed: {}", link.ifname(), e);
        }
    }

    fn fetch_stats(&self, link: &Link) -> Option<BhLinkStats> {
        self.baseband.link_stats(link.index()).ok()
    }

    fn link_state_changed(&self, link: &Link, state: LinkState) {
        info!("[TGD-DEV] {} ({}) is {}", link.ifname(), link.peer(), state.name());
        self.backend.set_link_state(self, link, state);
    }
}

impl KeyInstaller for Device {
    fn install_key(&self, link_index: usize, peer: MacAddr, key: &[u8]) -> Result<()> {
        self.baseband.set_key(link_index, peer, key)
    }

    fn pkts_pending(&self, link_index: usize) -> Option<u64> {
        let link = self.links.get(link_index)?;
        if link.tx_link() < 0 {
            return None;
        }
        self.baseband.link_stats(link.index()).ok().map(|s| s.pkts_pending)
    }
}

impl QueueStatsSource for Device {
    fn link_count(&self) -> usize { self.links.len() }

    fn sample_link(&self, index: usize) -> Option<LinkQueueStats> {
        let link = self.links.get(index).filter(|l| l.state() == LinkState::Up)?;
        let s = self.baseband.link_stats(link.index()).ok()?;
        Some(LinkQueueStats { peer: link.peer(), bytes_pending: s.bytes_pending, arrived_bytes: s.arrived_bytes() })
    }

    fn publish_queue_stats(&self, batch: Vec<QueueStatsEntry>) {
        let Some(q) = self.events() else { return };
        if !q.push_queue_stats(batch) {
            debug!("[TGD-QSTATS] radio {}: previous batch still queued, dropped", self.radio);
        }
    }
}

impl EventSink for Device {
    fn handle_event(&self, event: &[u8]) { handler::dispatch(self, event); }

    fn send_queue_stats(&self, batch: &[QueueStatsEntry]) {
        if let Err(e) = handler::send_queue_stats(self.baseband(), batch) {
            warn!("[TGD-QSTATS] radio {}: queue stats push failed: {}", self.radio, e);
        }
    }
}

impl DataPath for Device {
    fn dev_mac(&self) -> MacAddr { self.mac() }
    fn frame_format(&self) -> FrameFormat { self.format }
    fn radio_index(&self) -> usize { self.radio }

    fn tx_pre(&self, link: &Link, mut frame: Frame) -> Option<Frame> {
        if frame.len() < ETH_HLEN {
            link.counters.inc(Counter::TxTgdErr);
            return None;
        }
        if !link.carrier_ok() || link.state() != LinkState::Up || link.tx_link() < 0 {
            link.counters.inc(Counter::TxTgdErr);
            return None;
        }
        if frame.queue as usize >= BH_MQ_QUEUE_NUM {
            frame.queue = 0;
        }
        let qid = frame.queue;
        if link.queue_stopped(qid) {
            link.counters.inc(Counter::TxTgdTxStopped);
            return None;
        }
        if !link.security.observe_tx(frame.data()) {
            link.counters.inc(Counter::TxTgdTxStopped);
            return None;
        }
        link.counters.inc(Counter::tx_packets_cos(qid));
        frame.data_mut()[..ETH_ALEN].copy_from_slice(&link.peer().0);
        Some(frame)
    }

    fn tx_post(&self, link: &Link, frame: Frame) {
        let desc = TxDesc { peer_index: link.index(), tx_link: link.tx_link(), lifetime: TX_LIFETIME };
        if let Err(e) = self.baseband.tx_data(frame, &desc) {
            link.counters.inc(Counter::TxTgdErr);
            debug!("[TGD-DEV] {}: radio tx failed: {}", link.ifname(), e);
        }
    }

    fn deliver(&self, link: &Link, frame: Frame) { self.host.deliver(link.dev_index(), frame); }
}

impl OffloadTx for Device {
    /// Frame forwarded by the offload engine to one of this radio's links.
    fn packet_tx(&self, dev_index: usize, mut frame: Frame, cos: u8) -> Result<()> {
        let link = self.link_by_dev_index(dev_index).ok_or(TgdError::InvalidArgument("unknown interface"))?;
        match self.backend.kind() {
            BackendKind::Dpaa2 => {
                let (prio, q) = dpaa2::prio_for_cos(cos);
                frame.priority = prio;
                frame.queue = q;
                tx_common(self, link, frame);
            }
            BackendKind::Nss => {
                let prio = if cos != 0 { SKB_PRIO_BE } else { SKB_PRIO_VI };
                frame.queue = self.prio_map[prio as usize];
                frame.meta = FrameMeta { origin: FrameOrigin::Offload, offload_tag: Some(cos as u32) };
                self.backend.tx(self, link, frame);
            }
            BackendKind::Pfe | BackendKind::Linux => self.xmit(link, frame),
        }
        Ok(())
    }
}

// ============================================================================
// RADIO CALLBACKS
// ============================================================================

/// What the baseband holds. Callbacks after the device is gone are no-ops.
pub struct ClientHandle(pub Weak<Device>);

impl BhClient for ClientHandle {
    fn rx_data(&self, frame: Frame, rxd: &RxDesc) {
        let Some(dev) = self.0.upgrade() else { return };
        let link = dev
            .links
            .get(rxd.peer_index)
            .filter(|l| l.state() != LinkState::Init)
            .or_else(|| dev.links.find_by_link_id(rxd.rx_link));
        match link {
            Some(l) => dev.rx_frame(l, frame),
            None => debug!("[TGD-DEV] radio {}: rx for unknown peer {} link {}", dev.radio, rxd.peer_index, rxd.rx_link),
        }
    }

    fn rx_event(&self, event: &[u8]) {
        let Some(dev) = self.0.upgrade() else { return };
        if let Some(q) = dev.events() {
            // rejection is logged and counted by the queue
            let _ = q.submit(event);
        }
    }

    fn link_resume(&self, peer_index: usize, link: i32, qid: u8) {
        let Some(dev) = self.0.upgrade() else { return };
        if !dev.bh_flow_control { return; }
        if let Some(l) = dev.links.get(peer_index) {
            dev.flow_control_common(l, link, qid, false);
        }
    }

    fn link_suspend(&self, peer_index: usize, link: i32, qid: u8) {
        let Some(dev) = self.0.upgrade() else { return };
        if !dev.bh_flow_control { return; }
        if let Some(l) = dev.links.get(peer_index) {
            dev.flow_control_common(l, link, qid, true);
        }
    }

    fn set_mac_addr(&self, mac: MacAddr) {
        let Some(dev) = self.0.upgrade() else { return };
        dev.set_if_mac_addr(mac);
        dev.bus.publish(Notification::DeviceUp { radio: dev.radio, mac });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseband::loopback::LoopbackBaseband;
    use crate::baseband::{MQ_BE, MQ_VI, MQ_VO};
    use crate::control::notify::RecordingBus;
    use crate::protocol::fw_msg::{self, FwEventType, LinkUpdate, WsecAuth};
    use crate::protocol::wire::{EAPOL_KEY_RSN, ETH_P_PAE, WPA_KEY_MIC, WPA_KEY_PAIR};
    use crate::route::RecordingHost;
    use crate::security::eapol::{build_eapol_key, M4_KEY_INFO};

    const DEV_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 1]);
    const AA: MacAddr = MacAddr([0xAA; 6]);
    const BB: MacAddr = MacAddr([0xBB; 6]);

    struct Rig {
        dev: Arc<Device>,
        bb: Arc<LoopbackBaseband>,
        bus: Arc<RecordingBus>,
        host: Arc<RecordingHost>,
    }

    fn rig(num_links: usize) -> Rig {
        let bb = Arc::new(LoopbackBaseband::new(DEV_MAC));
        let bus = Arc::new(RecordingBus::new());
        let host = Arc::new(RecordingHost::new());
        let cfg = DeviceConfig { radio: 0, num_links, format: FrameFormat::Short, fc_enable: true, bh_flow_control: true };
        let services = DeviceServices {
            baseband: bb.clone(),
            host: host.clone(),
            bus: bus.clone(),
            gps: None,
            htsf: Arc::new(HtsfRegistry::default()),
        };
        let dev = Device::new(cfg, services, RoutingBackend::Linux).unwrap();
        dev.attach_links().unwrap();
        dev.open();
        Rig { dev, bb, bus, host }
    }

    fn status(peer: MacAddr, state: LinkState, wsec: WsecAuth) -> Vec<u8> {
        fw_msg::encode_link_status(&LinkUpdate {
            status: state as u8,
            peer,
            failure_cause: 0,
            sta_node_type: 1,
            peer_node_type: 2,
            wsec_auth: wsec,
            assoc_req_ies: Vec::new(),
            assoc_resp_ies: Vec::new(),
        })
    }

    fn bring_up(r: &Rig, peer: MacAddr, id: u8, wsec: WsecAuth) {
        r.dev.handle_event(&fw_msg::encode_link_info(peer, id, id));
        r.dev.handle_event(&status(peer, LinkState::Up, wsec));
    }

    fn ipv4(len: usize) -> Frame {
        let mut v = vec![0u8; len];
        v[6..12].copy_from_slice(&DEV_MAC.0);
        v[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        Frame::from_vec(v)
    }

    fn ipv6(b14: u8, b15: u8) -> Frame {
        let mut v = vec![0u8; 60];
        v[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());
        v[14] = b14;
        v[15] = b15;
        Frame::from_vec(v)
    }

    #[test]
    fn link_info_then_up_opens_data_path() {
        let r = rig(2);
        bring_up(&r, AA, 0, WsecAuth::Disabled);
        let l = r.dev.links().get(0).unwrap();
        assert_eq!(l.state(), LinkState::Up);
        assert!(l.carrier_ok());
        assert_eq!(r.dev.links().active_count(), 1);

        let seen = r.bus.take();
        assert!(matches!(&seen[0], Notification::LinkStatus { ifname: Some(n), status: 2, .. } if n == "terra0"));
        assert!(matches!(&seen[1], Notification::WsecStatus { status: 0, .. }));

        r.dev.transmit(0, ipv4(60)).unwrap();
        let tx = r.bb.transmitted();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].0, TxDesc { peer_index: 0, tx_link: 0, lifetime: TX_LIFETIME });
        assert_eq!(&tx[0].1[..6], &AA.0);
        assert_eq!(l.counters.get(Counter::TxPacketsCos1), 1);
    }

    #[test]
    fn tx_pre_drops_are_counted() {
        let r = rig(1);
        let l = r.dev.links().get(0).unwrap();
        r.dev.transmit(0, ipv4(60)).unwrap();
        assert_eq!(l.counters.get(Counter::TxTgdErr), 1);

        bring_up(&r, AA, 0, WsecAuth::Disabled);
        r.dev.transmit(0, Frame::from_vec(vec![0u8; 10])).unwrap();
        assert_eq!(l.counters.get(Counter::TxTgdErr), 2);

        l.stop_queue(MQ_BE);
        r.dev.transmit(0, ipv4(60)).unwrap();
        assert_eq!(l.counters.get(Counter::TxTgdTxStopped), 1);

        let mut bad = ipv4(60);
        bad.queue = 9;
        r.dev.tx_pre(l, bad).unwrap();
        assert_eq!(l.counters.get(Counter::TxPacketsCos0), 1);
        assert!(r.bb.transmitted().is_empty());
    }

    #[test]
    fn closed_port_passes_only_eapol() {
        let r = rig(1);
        bring_up(&r, AA, 0, WsecAuth::Psk);
        let l = r.dev.links().get(0).unwrap();
        assert!(l.security.pae_closed());
        assert!(l.security.m4_pending());

        r.dev.transmit(0, ipv4(60)).unwrap();
        assert_eq!(l.counters.get(Counter::TxTgdTxStopped), 1);

        let m2 = build_eapol_key(AA.0, DEV_MAC.0, EAPOL_KEY_RSN, WPA_KEY_PAIR | WPA_KEY_MIC);
        r.dev.transmit(0, Frame::from_vec(m2)).unwrap();
        assert!(l.security.m4_pending());
        let m4 = build_eapol_key(AA.0, DEV_MAC.0, EAPOL_KEY_RSN, M4_KEY_INFO);
        r.dev.transmit(0, Frame::from_vec(m4)).unwrap();
        assert!(!l.security.m4_pending());
        assert_eq!(r.bb.transmitted().len(), 2);

        r.dev.rx_frame(l, ipv4(60));
        assert_eq!(l.counters.get(Counter::RxTgdRxStopped), 1);
        let mut eapol = ipv4(60).into_vec();
        eapol[12..14].copy_from_slice(&ETH_P_PAE.to_be_bytes());
        r.dev.rx_frame(l, Frame::from_vec(eapol));
        assert_eq!(r.host.len(), 1);

        r.bus.take();
        r.dev.authorize_station(0, true).unwrap();
        assert!(!l.security.pae_closed());
        assert_eq!(r.bus.take(), vec![Notification::WsecLinkup { ifname: "terra0".into(), peer: AA }]);
        r.dev.rx_frame(l, ipv4(60));
        assert_eq!(r.host.len(), 2);
    }

    #[test]
    fn queue_selection_follows_priority_and_dscp() {
        let r = rig(1);
        let mut f = ipv6(0x6C, 0x00);
        assert_eq!(r.dev.select_queue(&mut f), MQ_VI);
        assert_eq!(f.priority, SKB_PRIO_VI);
        let mut f = ipv6(0x60, 0x00).with_priority(6);
        assert_eq!(r.dev.select_queue(&mut f), MQ_BE);
        let mut f = ipv4(60).with_priority(6);
        assert_eq!(r.dev.select_queue(&mut f), MQ_VO);
        let mut f = ipv4(60).with_priority(200);
        assert_eq!(r.dev.select_queue(&mut f), MQ_VO);
    }

    #[test]
    fn flow_control_toggles_once_and_checks_link() {
        let r = rig(1);
        bring_up(&r, AA, 3, WsecAuth::Disabled);
        let l = r.dev.links().get(0).unwrap();

        r.dev.flow_control_common(l, 7, 1, true);
        assert!(!l.queue_stopped(1));
        r.dev.flow_control_common(l, 3, 1, true);
        r.dev.flow_control_common(l, 3, 1, true);
        assert!(l.queue_stopped(1));
        assert_eq!(l.counters.get(Counter::LinkSuspend), 1);

        r.dev.flow_control_common(l, 3, 1, false);
        assert!(!l.queue_stopped(1));
        assert_eq!(l.counters.get(Counter::LinkResume), 1);

        r.dev.handle_event(&status(AA, LinkState::Pause, WsecAuth::Disabled));
        r.dev.flow_control_common(l, 3, 1, false);
        assert!(l.queue_stopped(1));
        assert_eq!(l.counters.get(Counter::LinkResume), 1);

        r.dev.set_fc_enable(false);
        r.dev.handle_event(&status(AA, LinkState::Up, WsecAuth::Disabled));
        r.dev.flow_control_common(l, 3, 2, true);
        assert!(!l.queue_stopped(2));
    }

    #[test]
    fn del_link_tears_down_and_answers() {
        let r = rig(2);
        bring_up(&r, AA, 0, WsecAuth::Disabled);
        bring_up(&r, BB, 1, WsecAuth::Disabled);
        r.dev.handle_event(&fw_msg::encode_del_link_req(AA));
        let l = r.dev.links().get(0).unwrap();
        assert_eq!(l.state(), LinkState::Init);
        assert!(!l.is_bound());
        assert_eq!(r.dev.links().get(1).unwrap().state(), LinkState::Up);
        assert_eq!(r.dev.links().active_count(), 1);
        assert_eq!(r.bb.ioctls_of(FwEventType::SbDelLinkResp).len(), 1);
        assert_eq!(r.bb.links().len(), 1);
    }

    #[test]
    fn status_for_unknown_peer_still_notifies() {
        let r = rig(1);
        r.dev.handle_event(&status(BB, LinkState::Up, WsecAuth::Disabled));
        let seen = r.bus.take();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Notification::LinkStatus { ifname: None, peer, .. } if *peer == BB));
    }

    #[test]
    fn pending_needs_a_tx_link() {
        let r = rig(1);
        assert_eq!(r.dev.pkts_pending(0), None);
        bring_up(&r, AA, 0, WsecAuth::Disabled);
        r.bb.update_link_stats(0, |s| s.pkts_pending = 4);
        assert_eq!(r.dev.pkts_pending(0), Some(4));
    }

    #[test]
    fn only_up_links_are_sampled() {
        let r = rig(2);
        bring_up(&r, AA, 0, WsecAuth::Disabled);
        r.dev.handle_event(&fw_msg::encode_link_info(BB, 1, 1));
        r.bb.update_link_stats(0, |s| {
            s.bytes_pending = 100;
            s.bytes_enqueued = 400;
        });
        let s = r.dev.sample_link(0).unwrap();
        assert_eq!((s.peer, s.bytes_pending, s.arrived_bytes), (AA, 100, 400));
        assert!(r.dev.sample_link(1).is_none());
    }

    #[test]
    fn stats_report_skips_idle_links() {
        let r = rig(2);
        bring_up(&r, AA, 5, WsecAuth::Disabled);
        r.dev.transmit(0, ipv4(100)).unwrap();
        let rows = r.dev.stats();
        assert_eq!(rows.len(), 1);
        let row = rows[0];
        assert_eq!((row.link, row.state, row.dst, row.src, row.dev_index), (5, LinkState::Up, AA, DEV_MAC, 0));
        assert_eq!((row.tx_packets, row.tx_bytes), (1, 100));
    }

    #[test]
    fn callbacks_through_client_handle() {
        let r = rig(1);
        let client: Arc<dyn BhClient> = Arc::new(ClientHandle(Arc::downgrade(&r.dev)));
        bring_up(&r, AA, 2, WsecAuth::Disabled);
        let l = r.dev.links().get(0).unwrap();

        client.link_suspend(0, 2, 3);
        assert!(l.queue_stopped(3));
        client.link_resume(0, 2, 3);
        assert!(!l.queue_stopped(3));

        client.rx_data(ipv4(60), &RxDesc { peer_index: 0, rx_link: 2 });
        assert_eq!(r.host.len(), 1);

        r.bus.take();
        let new_mac = MacAddr([0x02, 0, 0, 0, 0, 9]);
        client.set_mac_addr(new_mac);
        assert_eq!(r.dev.mac(), new_mac);
        assert_eq!(r.bus.take(), vec![Notification::DeviceUp { radio: 0, mac: new_mac }]);
    }

    #[test]
    fn stop_tears_down_every_link() {
        let r = rig(2);
        bring_up(&r, AA, 0, WsecAuth::Disabled);
        r.dev.handle_event(&fw_msg::encode_link_info(BB, 1, 1));
        r.dev.stop();
        assert!(r.dev.links().iter().all(|l| l.state() == LinkState::Init));
        assert_eq!(r.dev.links().active_count(), 0);
        assert!(r.bb.links().is_empty());
        assert!(!r.dev.is_up());
    }
}
