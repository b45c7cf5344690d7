// TGD - HOST ROUTING BACKEND
// No engine. Aggregates are split here and every frame goes to the host stack;
// transmit is the common path.

use log::debug;

use crate::link::{Counter, Link};
use crate::protocol::amsdu;
use crate::protocol::frame::Frame;
use crate::protocol::wire::{ethertype_of, ETH_P_TGAMSDU};

use super::DataPath;

pub fn rx(dp: &dyn DataPath, link: &Link, frame: Frame) {
    if ethertype_of(frame.data()) != Some(ETH_P_TGAMSDU) {
        dp.deliver(link, frame);
        return;
    }
    match amsdu::decapsulate(frame) {
        Ok(subs) => {
            for sub in subs {
                dp.deliver(link, sub);
            }
        }
        Err(e) => {
            debug!("[TGD-RT] {}: aggregate dropped: {}", link.ifname(), e);
            link.counters.inc(Counter::RxDropPackets);
        }
    }
}
