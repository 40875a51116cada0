//! Per-peer connection bookkeeping.
//!
//! Every connection attempt and every accepted link gets a fresh
//! generation. Events carry the generation they belong to, so a report from
//! an older link can never overwrite the state of a newer one, while a
//! "not connected" report for the current generation always wins.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

use crate::keys::short;

/// Which side of the invitation protocol this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Invites discovered peers.
    Browser,
    /// Announces itself and accepts every invitation.
    Advertiser,
}

/// A remote peer as proven by the link handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerId {
    pub display_name: String,
    pub fingerprint: String,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, short(&self.fingerprint))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub display_name: String,
    /// Unknown for peers invited by address until the handshake completes.
    pub fingerprint: Option<String>,
    /// mDNS full service name, when the peer was discovered.
    pub fullname: Option<String>,
    pub addrs: Vec<SocketAddr>,
    pub state: ConnectionState,
    pub generation: u64,
    /// An invitation was already sent and should not be repeated
    /// automatically.
    pub invited: bool,
}

impl PeerInfo {
    pub fn id(&self) -> Option<PeerId> {
        self.fingerprint.as_ref().map(|fp| PeerId {
            display_name: self.display_name.clone(),
            fingerprint: fp.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<PeerInfo>,
    next_generation: u64,
    last_disconnected: Option<String>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    /// A discovered service became visible or was re-resolved.
    pub fn observe(
        &mut self,
        fullname: &str,
        display_name: String,
        fingerprint: Option<String>,
        addrs: Vec<SocketAddr>,
    ) {
        let existing = self.peers.iter_mut().find(|p| {
            p.fullname.as_deref() == Some(fullname)
                || (fingerprint.is_some() && p.fingerprint == fingerprint)
        });
        match existing {
            Some(peer) => {
                peer.fullname = Some(fullname.to_string());
                if !addrs.is_empty() {
                    peer.addrs = addrs;
                }
                if peer.state == ConnectionState::Disconnected {
                    peer.display_name = display_name;
                    if fingerprint.is_some() {
                        peer.fingerprint = fingerprint;
                    }
                }
            }
            None => self.peers.push(PeerInfo {
                display_name,
                fingerprint,
                fullname: Some(fullname.to_string()),
                addrs,
                state: ConnectionState::Disconnected,
                generation: 0,
                invited: false,
            }),
        }
    }

    /// A discovered service went away. Peers with a live link or attempt
    /// stay until the link itself reports.
    pub fn lost(&mut self, fullname: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| {
            p.fullname.as_deref() != Some(fullname) || p.state != ConnectionState::Disconnected
        });
        before != self.peers.len()
    }

    /// First discovered peer that is worth an automatic invitation.
    pub fn invite_candidate(&self) -> Option<&PeerInfo> {
        if self.is_busy() {
            return None;
        }
        self.peers.iter().find(|p| {
            p.state == ConnectionState::Disconnected
                && !p.invited
                && p.fullname.is_some()
                && !p.addrs.is_empty()
        })
    }

    /// Start an attempt towards a discovered peer; returns its generation.
    pub fn begin_connect(&mut self, fullname: &str) -> Option<u64> {
        let generation = self.bump();
        let peer = self.peers.iter_mut().find(|p| {
            p.fullname.as_deref() == Some(fullname) && p.state == ConnectionState::Disconnected
        })?;
        peer.state = ConnectionState::Connecting;
        peer.generation = generation;
        peer.invited = true;
        self.last_disconnected = None;
        Some(generation)
    }

    /// Start an attempt towards an address nobody announced.
    pub fn begin_connect_addr(&mut self, addr: SocketAddr) -> u64 {
        let generation = self.bump();
        self.peers.push(PeerInfo {
            display_name: addr.to_string(),
            fingerprint: None,
            fullname: None,
            addrs: vec![addr],
            state: ConnectionState::Connecting,
            generation,
            invited: true,
        });
        self.last_disconnected = None;
        generation
    }

    /// The attempt of `generation` produced a verified link to `id`.
    ///
    /// Returns false when the attempt is stale; the caller must then drop
    /// the link.
    pub fn mark_connected(&mut self, generation: u64, id: PeerId) -> bool {
        let Some(idx) = self.peers.iter().position(|p| {
            p.generation == generation && p.state == ConnectionState::Connecting
        }) else {
            return false;
        };

        let peer = &mut self.peers[idx];
        peer.display_name = id.display_name;
        peer.fingerprint = Some(id.fingerprint);
        peer.state = ConnectionState::Connected;
        self.dedupe(idx);
        true
    }

    /// A peer connected to us and completed the invitation.
    pub fn accept_inbound(&mut self, id: PeerId, addr: SocketAddr) -> u64 {
        let generation = self.bump();
        let idx = match self
            .peers
            .iter()
            .position(|p| p.fingerprint.as_deref() == Some(id.fingerprint.as_str()))
        {
            Some(idx) => idx,
            None => {
                self.peers.push(PeerInfo {
                    display_name: id.display_name.clone(),
                    fingerprint: Some(id.fingerprint.clone()),
                    fullname: None,
                    addrs: Vec::new(),
                    state: ConnectionState::Disconnected,
                    generation,
                    invited: false,
                });
                self.peers.len() - 1
            }
        };

        let peer = &mut self.peers[idx];
        peer.display_name = id.display_name;
        if !peer.addrs.contains(&addr) {
            peer.addrs.push(addr);
        }
        peer.state = ConnectionState::Connected;
        peer.generation = generation;
        self.last_disconnected = None;
        generation
    }

    /// The attempt or link of `generation` is gone. Returns the peer's name
    /// when this changed anything.
    pub fn mark_disconnected(&mut self, generation: u64) -> Option<String> {
        let idx = self.peers.iter().position(|p| {
            p.generation == generation && p.state != ConnectionState::Disconnected
        })?;

        let peer = &mut self.peers[idx];
        let name = peer.display_name.clone();
        if peer.state == ConnectionState::Connected {
            // the link worked once; a later rediscovery may invite again
            peer.invited = false;
            self.last_disconnected = Some(name.clone());
        }
        peer.state = ConnectionState::Disconnected;
        if peer.fullname.is_none() {
            self.peers.remove(idx);
        }
        Some(name)
    }

    /// Locally dropped every link and attempt.
    pub fn disconnect_all(&mut self) -> Vec<u64> {
        let mut dropped = Vec::new();
        for peer in &mut self.peers {
            if peer.state == ConnectionState::Connected {
                self.last_disconnected = Some(peer.display_name.clone());
            }
            if peer.state != ConnectionState::Disconnected {
                dropped.push(peer.generation);
                peer.state = ConnectionState::Disconnected;
            }
        }
        self.peers.retain(|p| p.fullname.is_some());
        dropped
    }

    /// Designated partner: the first connected peer.
    pub fn partner(&self) -> Option<&PeerInfo> {
        self.peers
            .iter()
            .find(|p| p.state == ConnectionState::Connected)
    }

    pub fn connecting(&self) -> Option<&PeerInfo> {
        self.peers
            .iter()
            .find(|p| p.state == ConnectionState::Connecting)
    }

    pub fn is_busy(&self) -> bool {
        self.partner().is_some() || self.connecting().is_some()
    }

    pub fn status_text(&self, role: Role, discovering: bool) -> String {
        if let Some(p) = self.partner() {
            return format!("Connected to {}", p.display_name);
        }
        if let Some(p) = self.connecting() {
            return format!("Connecting to {}", p.display_name);
        }
        if let Some(name) = &self.last_disconnected {
            return format!("Disconnected from {}", name);
        }
        match (discovering, role) {
            (true, Role::Browser) => "Searching for peers".to_string(),
            (true, Role::Advertiser) => "Waiting for peers".to_string(),
            (false, _) => "Not connected".to_string(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Fold other entries with the same fingerprint into `keep`.
    fn dedupe(&mut self, keep: usize) {
        let Some(fp) = self.peers[keep].fingerprint.clone() else {
            return;
        };
        let mut fullname = self.peers[keep].fullname.clone();
        let mut idx = 0;
        let mut kept = keep;
        self.peers.retain(|p| {
            let current = idx;
            idx += 1;
            if current == keep || p.fingerprint.as_deref() != Some(fp.as_str()) {
                return true;
            }
            if p.state != ConnectionState::Disconnected {
                return true;
            }
            if fullname.is_none() {
                fullname = p.fullname.clone();
            }
            if current < keep {
                kept -= 1;
            }
            false
        });
        if self.peers[kept].fullname.is_none() {
            self.peers[kept].fullname = fullname;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    fn id(name: &str, fp: &str) -> PeerId {
        PeerId {
            display_name: name.into(),
            fingerprint: fp.into(),
        }
    }

    fn discovered(table: &mut PeerTable, name: &str, fp: &str, port: u16) -> String {
        let fullname = format!("{}._capshare._tcp.local.", name);
        table.observe(&fullname, name.into(), Some(fp.into()), vec![addr(port)]);
        fullname
    }

    #[test]
    fn test_discover_invite_connect_drop() {
        let mut table = PeerTable::new();
        assert_eq!(table.status_text(Role::Browser, true), "Searching for peers");

        let full = discovered(&mut table, "Studio", "aa11", 7000);
        assert_eq!(table.peers()[0].state, ConnectionState::Disconnected);
        assert_eq!(table.invite_candidate().unwrap().display_name, "Studio");

        let gen = table.begin_connect(&full).unwrap();
        assert_eq!(table.status_text(Role::Browser, true), "Connecting to Studio");
        assert!(table.invite_candidate().is_none());

        assert!(table.mark_connected(gen, id("Studio", "aa11")));
        assert_eq!(table.status_text(Role::Browser, true), "Connected to Studio");
        assert_eq!(table.partner().unwrap().fingerprint.as_deref(), Some("aa11"));

        assert_eq!(table.mark_disconnected(gen).as_deref(), Some("Studio"));
        assert!(table.partner().is_none());
        assert_eq!(table.status_text(Role::Browser, true), "Disconnected from Studio");
        // the entry is still visible and may be invited again
        assert_eq!(table.invite_candidate().unwrap().display_name, "Studio");
    }

    #[test]
    fn test_not_connected_beats_stale_connecting() {
        let mut table = PeerTable::new();
        let full = discovered(&mut table, "Studio", "aa11", 7000);

        let first = table.begin_connect(&full).unwrap();
        assert!(table.mark_disconnected(first).is_some());
        // a late success report for the failed attempt must not revive it
        assert!(!table.mark_connected(first, id("Studio", "aa11")));
        assert_eq!(table.peers()[0].state, ConnectionState::Disconnected);
        assert_eq!(table.status_text(Role::Browser, false), "Not connected");
    }

    #[test]
    fn test_old_generation_cannot_drop_new_link() {
        let mut table = PeerTable::new();
        let old = table.accept_inbound(id("Pad", "bb22"), addr(5000));
        assert!(table.mark_disconnected(old).is_some());

        let new = table.accept_inbound(id("Pad", "bb22"), addr(5001));
        assert_ne!(old, new);
        assert_eq!(table.mark_disconnected(old), None);
        assert_eq!(table.partner().unwrap().generation, new);
        assert_eq!(table.peers().len(), 1);
    }

    #[test]
    fn test_failed_invite_is_not_repeated() {
        let mut table = PeerTable::new();
        let a = discovered(&mut table, "A", "aa", 7000);
        discovered(&mut table, "B", "bb", 7001);

        let gen = table.begin_connect(&a).unwrap();
        table.mark_disconnected(gen);
        assert_eq!(table.invite_candidate().unwrap().display_name, "B");
    }

    #[test]
    fn test_partner_is_first_connected() {
        let mut table = PeerTable::new();
        table.accept_inbound(id("First", "01"), addr(1));
        table.accept_inbound(id("Second", "02"), addr(2));
        assert_eq!(table.partner().unwrap().display_name, "First");
        assert_eq!(table.status_text(Role::Advertiser, true), "Connected to First");
    }

    #[test]
    fn test_invite_by_address_learns_identity() {
        let mut table = PeerTable::new();
        discovered(&mut table, "Studio", "aa11", 7000);

        let gen = table.begin_connect_addr(addr(7000));
        assert_eq!(table.connecting().unwrap().display_name, "192.168.1.20:7000");
        assert!(table.mark_connected(gen, id("Studio", "aa11")));

        // merged with the discovered entry for the same identity
        assert_eq!(table.peers().len(), 1);
        let peer = table.partner().unwrap();
        assert_eq!(peer.display_name, "Studio");
        assert!(peer.fullname.is_some());
    }

    #[test]
    fn test_lost_keeps_live_links() {
        let mut table = PeerTable::new();
        let a = discovered(&mut table, "A", "aa", 7000);
        let b = discovered(&mut table, "B", "bb", 7001);
        let gen = table.begin_connect(&a).unwrap();
        table.mark_connected(gen, id("A", "aa"));

        assert!(!table.lost(&a));
        assert!(table.lost(&b));
        assert_eq!(table.peers().len(), 1);
    }

    #[test]
    fn test_disconnect_all() {
        let mut table = PeerTable::new();
        let gen = table.accept_inbound(id("Pad", "bb22"), addr(5000));
        let attempt = table.begin_connect_addr(addr(6000));

        let mut dropped = table.disconnect_all();
        dropped.sort_unstable();
        assert_eq!(dropped, vec![gen, attempt]);
        assert!(!table.is_busy());
        assert!(table.peers().is_empty());
        assert_eq!(table.status_text(Role::Advertiser, true), "Disconnected from Pad");
        assert_eq!(table.mark_disconnected(gen), None);
    }
}
