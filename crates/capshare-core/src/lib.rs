//! capshare core: moves a captured image set from one device to another.
//!
//! Peers find each other over mDNS, connect over an encrypted TCP link,
//! and hand over a store-only container that the receiver extracts into a
//! staging root it owns.

pub mod config;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod link;
pub mod session;
pub mod staging;
pub mod state;
pub mod transfer;
pub mod wire;

pub use config::SessionConfig;
pub use error::TransferError;
pub use keys::Identity;
pub use session::{SessionHandle, SessionSnapshot};
pub use state::{ConnectionState, PeerId, PeerInfo, Role};
pub use transfer::{Direction, TerminalResult, Transfer, TransferStatus};
