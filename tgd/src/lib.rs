// TGD - CRATE ROOT (LIBRARY)
// Terragraph backhaul data-plane and link-control core.
//
// Module hierarchy:
//   protocol/  - Frame buffer, Ethernet/EAPOL headers, A-MSDU codec, firmware envelope
//   baseband/  - Baseband platform contract + in-memory loopback radio
//   link/      - Link slots, lifecycle state machine, counters
//   security/  - EAPOL M4 detection, pairwise key gate
//   route/     - Routing backends (Linux, NSS, PFE, DPAA2) + offload config calls
//   engine/    - Monotonic clock, RT priority, queue-stats sampler
//   control/   - Firmware event queue, dispatcher, notification bus
//
// device.rs wires one radio together; driver.rs keeps the arena of radios.

pub mod error;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod baseband;
pub mod link;
pub mod security;
pub mod route;
pub mod engine;
pub mod control;
pub mod device;
pub mod driver;

pub use error::{Result, TgdError};
