//! Local network discovery over mDNS / DNS-SD: advertise this device under a
//! service id and browse for peers using the same id.

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;

pub use announce::Announcer;
pub use discover::{browse_blocking, Browser};
pub use model::{DiscoveredService, DiscoveryEvent, ServiceAnnouncement, ServiceId, TxtRecord};
