// TGD - CONTROL MODULE
// Firmware control plane: event queue + worker, message dispatcher and
// southbound senders, northbound notification bus.

pub mod events;
pub mod handler;
pub mod notify;

pub use events::{EventQueue, EventSink, MAX_EVENT_SIZE};
pub use handler::{GpsHook, HtsfHandler, HtsfRegistry, NlCounters};
pub use notify::{ChannelBus, Notification, NotificationBus, NullBus, RecordingBus};
