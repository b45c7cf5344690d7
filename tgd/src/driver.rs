// TGD - DRIVER
// Arena of radios. Probe brings each baseband up in a fixed order and unwinds
// in reverse on failure; remove runs the shutdown sequence across all radios
// one step at a time, so no radio sends firmware shutdown while another still
// has live links.
//
// Offload engines are shared by every radio. Frames they hand back carry only
// an interface index, so one TxRouter owns the engine sink and finds the radio.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info, warn};

use crate::baseband::{Baseband, BhClient, TGD_BH_API_VERSION};
use crate::config::TgdConfig;
use crate::control::handler::{self, GpsHook, HtsfRegistry};
use crate::control::notify::{Notification, NotificationBus};
use crate::device::{ClientHandle, Device, DeviceConfig, DeviceServices, LinkReport};
use crate::engine::lock;
use crate::engine::sampler::{QueueStatsSampler, QueueStatsSource};
use crate::error::{Result, TgdError};
use crate::link::LinkState;
use crate::protocol::frame::Frame;
use crate::route::{HostStack, OffloadEngines, OffloadTx, RoutingBackend};

/// Per-peer wait for a disassociated link to leave Up.
pub const DISASSOC_WAIT: Duration = Duration::from_secs(1);

/// Everything the host platform provides.
#[derive(Clone)]
pub struct Platform {
    pub basebands: Vec<Arc<dyn Baseband>>,
    pub engines: OffloadEngines,
    pub host: Arc<dyn HostStack>,
    pub bus: Arc<dyn NotificationBus>,
    pub gps: Option<Arc<dyn GpsHook>>,
}

// ============================================================================
// OFFLOAD TX ROUTING
// ============================================================================

#[derive(Default)]
struct TxRouter {
    devices: Mutex<Vec<Weak<Device>>>,
}

impl TxRouter {
    fn add(&self, dev: &Arc<Device>) { lock(&self.devices).push(Arc::downgrade(dev)); }

    fn clear(&self) { lock(&self.devices).clear(); }

    fn find(&self, dev_index: usize) -> Option<Arc<Device>> {
        lock(&self.devices).iter().filter_map(Weak::upgrade).find(|d| d.owns(dev_index))
    }
}

impl OffloadTx for TxRouter {
    fn packet_tx(&self, dev_index: usize, frame: Frame, cos: u8) -> Result<()> {
        let dev = self.find(dev_index).ok_or(TgdError::InvalidArgument("unknown interface"))?;
        dev.packet_tx(dev_index, frame, cos)
    }
}

// ============================================================================
// DRIVER
// ============================================================================

pub struct Driver {
    devices: Vec<Arc<Device>>,
    samplers: Vec<Option<QueueStatsSampler>>,
    router: Arc<TxRouter>,
    htsf: Arc<HtsfRegistry>,
    bus: Arc<dyn NotificationBus>,
    cfg: TgdConfig,
    removed: bool,
}

impl Driver {
    /// Probe every baseband. A failing radio unwinds itself, then the radios
    /// already up are removed.
    pub fn probe(platform: &Platform, cfg: &TgdConfig) -> Result<Driver> {
        let mut drv = Driver {
            devices: Vec::with_capacity(platform.basebands.len()),
            samplers: Vec::with_capacity(platform.basebands.len()),
            router: Arc::new(TxRouter::default()),
            htsf: Arc::new(HtsfRegistry::default()),
            bus: platform.bus.clone(),
            cfg: *cfg,
            removed: false,
        };
        for (radio, bb) in platform.basebands.iter().enumerate() {
            if let Err(e) = drv.probe_radio(platform, radio, bb.clone()) {
                error!("[TGD-DEV] radio {} probe failed: {}", radio, e);
                drv.remove();
                return Err(e);
            }
        }
        info!("[TGD-DEV] {} radio(s) up", drv.devices.len());
        Ok(drv)
    }

    fn probe_radio(&mut self, p: &Platform, radio: usize, bb: Arc<dyn Baseband>) -> Result<()> {
        let found = bb.api_version();
        if found != TGD_BH_API_VERSION {
            return Err(TgdError::ApiVersionMismatch { expected: TGD_BH_API_VERSION, found });
        }
        let mac = bb.mac_addr();

        let backend = RoutingBackend::select(&p.engines, &self.cfg.backend_options())?;
        let num_links = backend.max_links(self.cfg.num_virt_links);
        let dcfg = DeviceConfig {
            radio,
            num_links,
            format: self.cfg.frame_format,
            fc_enable: self.cfg.fc_enable,
            bh_flow_control: self.cfg.bh_flow_control,
        };
        let services = DeviceServices {
            baseband: bb.clone(),
            host: p.host.clone(),
            bus: p.bus.clone(),
            gps: p.gps.clone(),
            htsf: self.htsf.clone(),
        };
        let dev = Device::new(dcfg, services, backend)?;

        let client: Arc<dyn BhClient> = Arc::new(ClientHandle(Arc::downgrade(&dev)));
        bb.register_client(client, num_links)?;
        if let Err(e) = dev.attach_links() {
            let _ = bb.unregister_client();
            return Err(e);
        }
        dev.backend().attach_tx(Arc::downgrade(&self.router) as Weak<dyn OffloadTx>);
        self.router.add(&dev);

        let sampler = if self.cfg.queue_stats {
            let source = Arc::downgrade(&dev) as Weak<dyn QueueStatsSource>;
            match QueueStatsSampler::start(source, self.cfg.qstats_tick(), format!("tgqstats.{}", radio)) {
                Ok(s) => Some(s),
                Err(e) => {
                    dev.detach_links();
                    dev.backend().module_shutdown();
                    let _ = bb.unregister_client();
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        dev.set_intake(true);
        if self.cfg.auto_up {
            dev.open();
        }
        self.bus.publish(Notification::DeviceUp { radio, mac });
        info!("[TGD-DEV] radio {} ({}) probed: {} links", radio, mac, num_links);
        self.devices.push(dev);
        self.samplers.push(sampler);
        Ok(())
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn devices(&self) -> &[Arc<Device>] { &self.devices }

    pub fn device(&self, radio: usize) -> Option<&Arc<Device>> { self.devices.get(radio) }

    /// Registry for the single timing-sync consumer.
    pub fn htsf(&self) -> &HtsfRegistry { &self.htsf }

    pub fn config(&self) -> &TgdConfig { &self.cfg }

    /// Host transmit on interface `terra{dev_index}`.
    pub fn transmit(&self, dev_index: usize, frame: Frame) -> Result<()> {
        for dev in &self.devices {
            if let Some(l) = dev.link_by_dev_index(dev_index) {
                return dev.transmit(l.index(), frame);
            }
        }
        Err(TgdError::InvalidArgument("unknown interface"))
    }

    /// Per-link report for every radio, in interface order.
    pub fn stats(&self) -> Vec<LinkReport> {
        self.devices.iter().flat_map(|d| d.stats()).collect()
    }

    // ========================================================================
    // REMOVE
    // ========================================================================

    /// Shut everything down. Safe to call more than once.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;

        for dev in &self.devices {
            self.bus.publish(Notification::DeviceDown { radio: dev.radio(), mac: dev.mac() });
        }

        // 1. samplers
        for s in self.samplers.iter_mut().flatten() {
            s.stop();
        }

        // 2. disassociate, firmware answers with link-down through the event worker
        for dev in &self.devices {
            for l in dev.links().iter().filter(|l| l.state() == LinkState::Up) {
                if let Err(e) = handler::send_disassoc_req(dev.baseband(), l.peer()) {
                    warn!("[TGD-DEV] {}: disassoc {} failed: {}", l.ifname(), l.peer(), e);
                    continue;
                }
                if !l.wait_while_up(DISASSOC_WAIT) {
                    warn!("[TGD-DEV] {}: still up {:?} after disassoc", l.ifname(), DISASSOC_WAIT);
                }
            }
        }

        // 3. event intake and worker
        for dev in &self.devices {
            let flushed = dev.stop_events();
            if flushed != 0 {
                info!("[TGD-DEV] radio {}: {} events flushed", dev.radio(), flushed);
            }
        }

        // 4. flow control
        for dev in &self.devices {
            dev.set_fc_enable(false);
        }

        // 5. firmware
        for dev in &self.devices {
            if let Err(e) = handler::send_fw_shutdown(dev.baseband()) {
                warn!("[TGD-DEV] radio {}: firmware shutdown failed: {}", dev.radio(), e);
            }
        }

        // 6. devices
        for dev in &self.devices {
            dev.stop();
        }

        // 7. baseband
        for dev in &self.devices {
            if let Err(e) = dev.baseband().unregister_client() {
                warn!("[TGD-DEV] radio {}: unregister failed: {}", dev.radio(), e);
            }
        }

        // 8. backend devices
        for dev in &self.devices {
            dev.detach_links();
        }

        // 9. backend module
        for dev in &self.devices {
            dev.backend().module_shutdown();
        }
        self.router.clear();
        info!("[TGD-DEV] driver removed");
    }
}

impl Drop for Driver {
    fn drop(&mut self) { self.remove(); }
}
