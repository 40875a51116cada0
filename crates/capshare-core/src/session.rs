//! Peer session.
//!
//! One actor task owns all session state: the peer table, running links,
//! discovery, the outbound transfer and the current staging root. Callers
//! talk to it through a [`SessionHandle`]; state comes back as
//! [`SessionSnapshot`]s on a watch channel. Network setup, file streaming
//! and archive work happen in helper tasks that report back as events, so
//! nothing but the actor ever mutates session state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mdns_core::{Announcer, Browser, DiscoveryEvent, ServiceAnnouncement, ServiceId, TxtRecord};
use serde::Serialize;
use tempfile::TempPath;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::keys::Identity;
use crate::link::{self, Established, LinkEvent, LinkHandle, Side};
use crate::staging::{self, StagingRoot};
use crate::state::{PeerId, PeerInfo, PeerTable, Role};
use crate::transfer::{Direction, TerminalResult, Transfer, TransferStatus};

/// TXT keys of our announcement.
pub const TXT_NAME: &str = "name";
pub const TXT_FINGERPRINT: &str = "fp";

const COMMAND_QUEUE: usize = 32;
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// What the session looks like right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub role: Role,
    pub discovering: bool,
    pub connection_status: String,
    pub is_connected: bool,
    pub partner: Option<PeerId>,
    pub peers: Vec<PeerInfo>,
    /// Where the advertiser accepts links.
    pub listen_addr: Option<SocketAddr>,
    /// Progress handle of the running send, if any.
    pub outbound: Option<Transfer>,
    /// The running or most recent receive.
    pub inbound: Option<Transfer>,
    pub transfer_status: TransferStatus,
    /// Extracted files of the latest successful receive.
    pub received_folder: Option<PathBuf>,
}

pub enum SessionCmd {
    StartDiscovery,
    StopDiscovery,
    Invite {
        addr: SocketAddr,
    },
    Send {
        container: PathBuf,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    CancelSend,
    Disconnect,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCmd>,
    state_rx: watch::Receiver<SessionSnapshot>,
    outgoing_dir: PathBuf,
}

impl SessionHandle {
    /// Spawn the session actor. An advertiser binds its listener right away
    /// so `listen_addr` is known before discovery starts.
    pub async fn start(
        config: SessionConfig,
        identity: Identity,
        role: Role,
    ) -> anyhow::Result<Self> {
        let service = config.service_id()?;
        config.ensure_data_dir()?;

        let listener = match role {
            Role::Advertiser => Some(Arc::new(
                TcpListener::bind(config.listen_addr)
                    .await
                    .with_context(|| format!("binding {}", config.listen_addr))?,
            )),
            Role::Browser => None,
        };
        let listen_addr = listener.as_ref().map(|l| l.local_addr()).transpose()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(placeholder(role, listen_addr));

        let outgoing_dir = config.outgoing_dir();
        let actor = Actor {
            listener,
            listen_addr,
            ..Actor::new(config, service, identity, role, internal_tx, link_tx, state_tx)
        };
        actor.publish();

        tracing::info!(?role, "Starting session as {}", actor.config.display_name);
        tokio::spawn(actor.run(cmd_rx, internal_rx, link_rx));

        Ok(Self {
            cmd_tx,
            state_rx,
            outgoing_dir,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    /// Wait until a snapshot satisfies `f` and return it.
    pub async fn wait_for<F>(&self, f: F) -> Result<SessionSnapshot, TransferError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        let snapshot = rx.wait_for(f).await.map_err(|_| session_closed())?;
        Ok(snapshot.clone())
    }

    pub async fn start_discovery(&self) -> Result<(), TransferError> {
        self.command(SessionCmd::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> Result<(), TransferError> {
        self.command(SessionCmd::StopDiscovery).await
    }

    /// Connect to a peer at a known address, without discovery.
    pub async fn invite(&self, addr: SocketAddr) -> Result<(), TransferError> {
        self.command(SessionCmd::Invite { addr }).await
    }

    /// Send a container to the partner.
    ///
    /// Resolves once the peer acknowledged the complete resource, or with
    /// the reason it did not. `NoPeer` and `Busy` come back immediately.
    pub async fn send(&self, container: &Path) -> Result<(), TransferError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCmd::Send {
            container: container.to_path_buf(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| session_closed())?
    }

    /// Stop the running send. Its `send` call resolves with `Cancelled`.
    pub async fn cancel_send(&self) -> Result<(), TransferError> {
        self.command(SessionCmd::CancelSend).await
    }

    pub async fn disconnect(&self) -> Result<(), TransferError> {
        self.command(SessionCmd::Disconnect).await
    }

    /// Stop everything and remove the staging root.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        let (done, rx) = oneshot::channel();
        self.command(SessionCmd::Shutdown { done }).await?;
        rx.await.map_err(|_| session_closed())
    }

    /// Pack `source_dir` into a temporary container, send it, and remove
    /// the container again.
    pub async fn pack_and_send(&self, source_dir: &Path) -> Result<(), TransferError> {
        if !self.snapshot().is_connected {
            return Err(TransferError::NoPeer);
        }

        let scratch = tempfile::Builder::new()
            .prefix("outgoing-")
            .tempdir_in(&self.outgoing_dir)?;
        let set_name = source_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture-set".to_string());
        let container = scratch.path().join(format!("{}.zip", set_name));

        let source = source_dir.to_path_buf();
        let container = tokio::task::spawn_blocking(move || archive::write_archive(&source, &container))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let result = self.send(&container).await;
        let _ = tokio::task::spawn_blocking(move || drop(scratch)).await;
        result
    }

    async fn command(&self, cmd: SessionCmd) -> Result<(), TransferError> {
        self.cmd_tx.send(cmd).await.map_err(|_| session_closed())
    }
}

fn session_closed() -> TransferError {
    TransferError::transport("session has shut down")
}

fn placeholder(role: Role, listen_addr: Option<SocketAddr>) -> SessionSnapshot {
    SessionSnapshot {
        role,
        discovering: false,
        connection_status: String::new(),
        is_connected: false,
        partner: None,
        peers: Vec::new(),
        listen_addr,
        outbound: None,
        inbound: None,
        transfer_status: TransferStatus::Idle,
        received_folder: None,
    }
}

/// Events from the actor's helper tasks.
enum Internal {
    Discovery(DiscoveryEvent),
    Accepted {
        established: Established<TcpStream>,
        addr: SocketAddr,
    },
    Connected {
        generation: u64,
        established: Established<TcpStream>,
    },
    ConnectFailed {
        generation: u64,
        reason: String,
    },
    SendProgress {
        transfer_id: u64,
        sent: u64,
        total: u64,
    },
    SendStreamed {
        transfer_id: u64,
        result: Result<(), TransferError>,
    },
    Staged {
        seq: u64,
        result: Result<StagingRoot, TransferError>,
    },
}

struct OutboundSend {
    transfer: Transfer,
    generation: u64,
    reply: Option<oneshot::Sender<Result<(), TransferError>>>,
    cancel: watch::Sender<bool>,
}

struct Actor {
    config: SessionConfig,
    service: ServiceId,
    identity: Arc<Identity>,
    role: Role,
    table: PeerTable,
    links: HashMap<u64, LinkHandle>,
    discovering: bool,
    browser: Option<Browser>,
    announcer: Option<Announcer>,
    listener: Option<Arc<TcpListener>>,
    listen_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    outbound: Option<OutboundSend>,
    /// Link generation and progress of the current receive.
    inbound: Option<(u64, Transfer)>,
    transfer_status: TransferStatus,
    staging: Option<StagingRoot>,
    staging_seq: u64,
    published_seq: u64,
    next_transfer_id: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl Actor {
    fn new(
        config: SessionConfig,
        service: ServiceId,
        identity: Identity,
        role: Role,
        internal_tx: mpsc::UnboundedSender<Internal>,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
        state_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            config,
            service,
            identity: Arc::new(identity),
            role,
            table: PeerTable::new(),
            links: HashMap::new(),
            discovering: false,
            browser: None,
            announcer: None,
            listener: None,
            listen_addr: None,
            accept_task: None,
            outbound: None,
            inbound: None,
            transfer_status: TransferStatus::Idle,
            staging: None,
            staging_seq: 0,
            published_seq: 0,
            next_transfer_id: 0,
            internal_tx,
            link_tx,
            state_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCmd>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCmd::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event),
                Some(event) = internal_rx.recv() => self.handle_internal(event),
            }
            self.publish();
        }
        tracing::info!("Session stopped");
    }

    fn handle_command(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::StartDiscovery => self.start_discovery(),
            SessionCmd::StopDiscovery => self.stop_discovery(),
            SessionCmd::Invite { addr } => {
                let generation = self.table.begin_connect_addr(addr);
                tracing::info!(generation, %addr, "Inviting by address");
                self.spawn_connect(generation, vec![addr]);
            }
            SessionCmd::Send { container, reply } => self.begin_send(container, reply),
            SessionCmd::CancelSend => {
                if self.outbound.is_some() {
                    self.finish_send(Err(TransferError::Cancelled));
                } else {
                    tracing::debug!("Nothing to cancel");
                }
            }
            SessionCmd::Disconnect => self.disconnect_all(),
            // handled by the loop
            SessionCmd::Shutdown { .. } => {}
        }
    }

    fn start_discovery(&mut self) {
        if self.discovering {
            tracing::debug!("Discovery already running");
            return;
        }
        self.discovering = true;

        match self.role {
            Role::Advertiser => {
                if let Some(listener) = &self.listener {
                    self.accept_task = Some(spawn_accept_loop(
                        listener.clone(),
                        self.identity.clone(),
                        self.config.display_name.clone(),
                        self.config.invite_timeout(),
                        self.internal_tx.clone(),
                    ));
                }
                if self.config.mdns {
                    match self.announce() {
                        Ok(announcer) => {
                            tracing::info!("Announced as {}", announcer.fullname());
                            self.announcer = Some(announcer);
                        }
                        Err(e) => tracing::warn!(
                            "mDNS announcement failed, reachable by address only: {:#}",
                            e
                        ),
                    }
                }
            }
            Role::Browser => {
                if self.config.mdns {
                    match Browser::start(&self.service) {
                        Ok((browser, mut rx)) => {
                            let internal = self.internal_tx.clone();
                            tokio::spawn(async move {
                                while let Some(event) = rx.recv().await {
                                    if internal.send(Internal::Discovery(event)).is_err() {
                                        break;
                                    }
                                }
                            });
                            tracing::info!("Browsing {}", browser.service_type());
                            self.browser = Some(browser);
                        }
                        Err(e) => tracing::warn!("mDNS browse failed: {:#}", e),
                    }
                }
                self.maybe_invite();
            }
        }
        tracing::info!("Discovery started");
    }

    fn stop_discovery(&mut self) {
        if !self.discovering {
            tracing::debug!("Discovery not running");
            return;
        }
        self.discovering = false;

        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.announcer = None;
        if let Some(browser) = self.browser.take() {
            // joins the browse thread
            tokio::task::spawn_blocking(move || drop(browser));
        }
        tracing::info!("Discovery stopped");
    }

    fn announce(&self) -> anyhow::Result<Announcer> {
        let port = self
            .listen_addr
            .map(|a| a.port())
            .context("advertiser has no listener")?;
        let ip = mdns_core::net::advertise_ip(self.config.interface.as_deref())?;
        let name = self.config.display_name.clone();

        Announcer::register(ServiceAnnouncement {
            service: self.service.clone(),
            host_name: mdns_core::announce::host_label(&name),
            instance_name: name.clone(),
            ip_addr: ip,
            port,
            txt: TxtRecord(vec![
                (TXT_NAME.to_string(), name),
                (TXT_FINGERPRINT.to_string(), self.identity.fingerprint()),
            ]),
        })
    }

    fn maybe_invite(&mut self) {
        if self.role != Role::Browser || !self.discovering {
            return;
        }
        let Some((fullname, addrs)) = self
            .table
            .invite_candidate()
            .and_then(|p| Some((p.fullname.clone()?, p.addrs.clone())))
        else {
            return;
        };
        if let Some(generation) = self.table.begin_connect(&fullname) {
            tracing::info!(generation, "Inviting {}", fullname);
            self.spawn_connect(generation, addrs);
        }
    }

    fn spawn_connect(&self, generation: u64, addrs: Vec<SocketAddr>) {
        let identity = self.identity.clone();
        let name = self.config.display_name.clone();
        let timeout = self.config.invite_timeout();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let attempt = async {
                let stream = connect_any(&addrs).await?;
                link::establish(stream, Side::Initiator, &identity, &name).await
            };
            let event = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(established)) => Internal::Connected {
                    generation,
                    established,
                },
                Ok(Err(e)) => Internal::ConnectFailed {
                    generation,
                    reason: e.to_string(),
                },
                Err(_) => Internal::ConnectFailed {
                    generation,
                    reason: "invitation timed out".to_string(),
                },
            };
            let _ = internal.send(event);
        });
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Discovery(DiscoveryEvent::Found(svc)) => {
                if !self.discovering {
                    return;
                }
                let fingerprint = svc.txt_value(TXT_FINGERPRINT).map(str::to_string);
                if fingerprint.as_deref() == Some(self.identity.fingerprint().as_str()) {
                    return;
                }
                let name = svc
                    .txt_value(TXT_NAME)
                    .unwrap_or(svc.instance_name.as_str())
                    .to_string();
                tracing::debug!("Found {} at {:?}", svc.fullname, svc.addresses);
                self.table
                    .observe(&svc.fullname, name, fingerprint, svc.socket_addrs());
                self.maybe_invite();
            }
            Internal::Discovery(DiscoveryEvent::Lost { fullname }) => {
                if self.table.lost(&fullname) {
                    tracing::debug!("Lost {}", fullname);
                }
            }
            Internal::Accepted { established, addr } => {
                if !self.discovering {
                    tracing::debug!(%addr, "Dropping link accepted after discovery stopped");
                    return;
                }
                let generation = self.table.accept_inbound(established.peer().clone(), addr);
                self.add_link(established, generation);
            }
            Internal::Connected {
                generation,
                established,
            } => {
                if self.table.mark_connected(generation, established.peer().clone()) {
                    self.add_link(established, generation);
                } else {
                    tracing::debug!(generation, "Dropping stale connection");
                }
            }
            Internal::ConnectFailed { generation, reason } => {
                if let Some(name) = self.table.mark_disconnected(generation) {
                    tracing::warn!(generation, "Could not connect to {}: {}", name, reason);
                }
                self.maybe_invite();
            }
            Internal::SendProgress {
                transfer_id,
                sent,
                total,
            } => {
                if let Some(out) = self.outbound_mut(transfer_id) {
                    if total > 0 {
                        out.transfer.advance(sent as f64 / total as f64);
                    }
                }
            }
            Internal::SendStreamed {
                transfer_id,
                result,
            } => match result {
                Ok(()) => tracing::debug!(transfer_id, "All data queued, awaiting receipt"),
                Err(TransferError::Cancelled) => {}
                Err(e) => {
                    if self.outbound_mut(transfer_id).is_some() {
                        self.finish_send(Err(e));
                    }
                }
            },
            Internal::Staged { seq, result } => self.staged(seq, result),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::InboundStarted {
                generation,
                transfer_id,
                name,
                ..
            } => {
                let transfer = Transfer::new(transfer_id, name.clone(), Direction::Inbound);
                self.inbound = Some((generation, transfer));
                self.transfer_status = TransferStatus::Receiving { name };
            }
            LinkEvent::InboundProgress {
                generation,
                transfer_id,
                received,
                size,
            } => {
                if let Some(transfer) = self.inbound_mut(generation, transfer_id) {
                    if size > 0 {
                        transfer.advance(received as f64 / size as f64);
                    }
                }
            }
            LinkEvent::InboundFinished {
                generation,
                transfer_id,
                name,
                result,
            } => {
                let terminal = match &result {
                    Ok(_) => TerminalResult::Success,
                    Err(reason) => TerminalResult::Failed(reason.clone()),
                };
                if let Some(transfer) = self.inbound_mut(generation, transfer_id) {
                    transfer.finish(terminal);
                }
                match result {
                    Ok(container) => {
                        self.transfer_status = TransferStatus::Extracting { name };
                        self.stage(container);
                    }
                    Err(reason) => {
                        self.transfer_status = TransferStatus::ReceiveFailed { reason };
                    }
                }
            }
            LinkEvent::Receipt {
                transfer_id,
                ok,
                reason,
                ..
            } => {
                if self.outbound_mut(transfer_id).is_none() {
                    tracing::debug!(transfer_id, "Receipt for a finished transfer");
                    return;
                }
                if ok {
                    self.finish_send(Ok(()));
                } else {
                    let reason = reason.unwrap_or_else(|| "rejected by peer".to_string());
                    self.finish_send(Err(TransferError::Transport(reason)));
                }
            }
            LinkEvent::Closed { generation, reason } => {
                if let Some(link) = self.links.remove(&generation) {
                    tracing::debug!(generation, peer = %link.peer(), "Link released");
                }
                if let Some(name) = self.table.mark_disconnected(generation) {
                    tracing::info!(generation, "Disconnected from {}: {}", name, reason);
                }
                if self.outbound.as_ref().map(|o| o.generation) == Some(generation) {
                    self.finish_send(Err(TransferError::transport("peer disconnected")));
                }
                self.maybe_invite();
            }
        }
    }

    fn add_link(&mut self, established: Established<TcpStream>, generation: u64) {
        let handle = link::spawn_link(
            established,
            generation,
            self.config.incoming_dir(),
            self.link_tx.clone(),
        );
        self.links.insert(generation, handle);
    }

    fn begin_send(
        &mut self,
        container: PathBuf,
        reply: oneshot::Sender<Result<(), TransferError>>,
    ) {
        if self.outbound.is_some() {
            let _ = reply.send(Err(TransferError::Busy));
            return;
        }
        let Some(link) = self
            .table
            .partner()
            .and_then(|p| self.links.get(&p.generation))
        else {
            let _ = reply.send(Err(TransferError::NoPeer));
            return;
        };
        let generation = link.generation();
        let sender = link.sender();

        self.next_transfer_id += 1;
        let transfer_id = self.next_transfer_id;
        let name = container
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture-set.zip".to_string());
        let (cancel, cancel_rx) = watch::channel(false);

        let internal = self.internal_tx.clone();
        let resource_name = name.clone();
        tokio::spawn(async move {
            let progress = internal.clone();
            let result = link::stream_resource(
                sender,
                transfer_id,
                &container,
                &resource_name,
                cancel_rx,
                move |sent, total| {
                    let _ = progress.send(Internal::SendProgress {
                        transfer_id,
                        sent,
                        total,
                    });
                },
            )
            .await;
            let _ = internal.send(Internal::SendStreamed {
                transfer_id,
                result,
            });
        });

        tracing::info!(transfer_id, generation, "Sending {}", name);
        self.transfer_status = TransferStatus::Sending { name: name.clone() };
        self.outbound = Some(OutboundSend {
            transfer: Transfer::new(transfer_id, name, Direction::Outbound),
            generation,
            reply: Some(reply),
            cancel,
        });
    }

    fn inbound_mut(&mut self, generation: u64, transfer_id: u64) -> Option<&mut Transfer> {
        self.inbound
            .as_mut()
            .filter(|(g, t)| *g == generation && t.id == transfer_id)
            .map(|(_, t)| t)
    }

    fn outbound_mut(&mut self, transfer_id: u64) -> Option<&mut OutboundSend> {
        self.outbound
            .as_mut()
            .filter(|o| o.transfer.id == transfer_id)
    }

    /// Resolve the running send exactly once and clear its progress handle.
    fn finish_send(&mut self, result: Result<(), TransferError>) {
        let Some(mut out) = self.outbound.take() else {
            return;
        };
        let _ = out.cancel.send(true);

        let name = out.transfer.resource_name.clone();
        let (terminal, status) = match &result {
            Ok(()) => (TerminalResult::Success, TransferStatus::Sent { name }),
            Err(TransferError::Cancelled) => {
                (TerminalResult::Cancelled, TransferStatus::SendCancelled { name })
            }
            Err(e) => (
                TerminalResult::Failed(e.to_string()),
                TransferStatus::SendFailed {
                    name,
                    reason: e.to_string(),
                },
            ),
        };
        out.transfer.finish(terminal);
        tracing::info!(
            transfer_id = out.transfer.id,
            "Send finished: {:?}",
            out.transfer.terminal_result
        );

        self.transfer_status = status;
        if let Some(reply) = out.reply.take() {
            let _ = reply.send(result);
        }
    }

    fn disconnect_all(&mut self) {
        let dropped = self.table.disconnect_all();
        self.links.clear();
        if !dropped.is_empty() {
            tracing::info!("Dropped {} link(s)", dropped.len());
        }
        if self.outbound.is_some() {
            self.finish_send(Err(TransferError::transport("disconnected")));
        }
    }

    fn stage(&mut self, container: TempPath) {
        self.staging_seq += 1;
        let seq = self.staging_seq;
        let base = self.config.staging_dir();
        let internal = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = staging::stage_container(container, &base);
            let _ = internal.send(Internal::Staged { seq, result });
        });
    }

    fn staged(&mut self, seq: u64, result: Result<StagingRoot, TransferError>) {
        match result {
            Ok(root) if seq < self.published_seq => {
                tracing::debug!(seq, "Discarding a staging root that was overtaken");
                discard(root);
            }
            Ok(root) => {
                tracing::info!(seq, root = %root.path().display(), "Received set staged");
                self.published_seq = seq;
                self.transfer_status = TransferStatus::Received {
                    folder: root.folder().to_path_buf(),
                    skipped: root.report().skipped.len(),
                };
                if let Some(old) = self.staging.replace(root) {
                    discard(old);
                }
            }
            Err(e) if seq < self.staging_seq => {
                tracing::warn!(seq, "Staging of an overtaken receive failed: {}", e);
            }
            Err(e) => {
                tracing::warn!(seq, "Staging failed: {}", e);
                self.transfer_status = TransferStatus::ReceiveFailed {
                    reason: e.to_string(),
                };
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stop_discovery();
        if self.outbound.is_some() {
            self.finish_send(Err(TransferError::Cancelled));
        }
        self.table.disconnect_all();
        self.links.clear();
        if let Some(root) = self.staging.take() {
            let _ = tokio::task::spawn_blocking(move || drop(root)).await;
        }
        self.publish();
    }

    fn snapshot(&self) -> SessionSnapshot {
        let partner = self.table.partner();
        SessionSnapshot {
            role: self.role,
            discovering: self.discovering,
            connection_status: self.table.status_text(self.role, self.discovering),
            is_connected: partner.is_some(),
            partner: partner.and_then(PeerInfo::id),
            peers: self.table.peers().to_vec(),
            listen_addr: self.listen_addr,
            outbound: self.outbound.as_ref().map(|o| o.transfer.clone()),
            inbound: self.inbound.as_ref().map(|(_, t)| t.clone()),
            transfer_status: self.transfer_status.clone(),
            received_folder: self.staging.as_ref().map(|r| r.folder().to_path_buf()),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Remove a staging root off the actor.
fn discard(root: StagingRoot) {
    tokio::task::spawn_blocking(move || drop(root));
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, TransferError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, "Connect failed: {}", e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .map(TransferError::Io)
        .unwrap_or_else(|| TransferError::transport("peer has no address")))
}

fn spawn_accept_loop(
    listener: Arc<TcpListener>,
    identity: Arc<Identity>,
    display_name: String,
    timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(%addr, "Incoming connection");

            let identity = identity.clone();
            let display_name = display_name.clone();
            let internal = internal.clone();
            tokio::spawn(async move {
                let handshake = link::establish(stream, Side::Responder, &identity, &display_name);
                match tokio::time::timeout(timeout, handshake).await {
                    Ok(Ok(established)) => {
                        let _ = internal.send(Internal::Accepted { established, addr });
                    }
                    Ok(Err(e)) => tracing::warn!(%addr, "Rejected inbound link: {}", e),
                    Err(_) => tracing::warn!(%addr, "Inbound invitation timed out"),
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config(dir: &Path, name: &str) -> SessionConfig {
        SessionConfig {
            data_dir: dir.to_path_buf(),
            display_name: name.to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            mdns: false,
            ..SessionConfig::default()
        }
    }

    async fn wait<F>(handle: &SessionHandle, f: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(WAIT, handle.wait_for(f))
            .await
            .expect("timed out waiting for session state")
            .unwrap()
    }

    struct Pair {
        receiver: SessionHandle,
        sender: SessionHandle,
        receiver_dir: TempDir,
        _sender_dir: TempDir,
    }

    async fn connected_pair() -> Pair {
        let receiver_dir = TempDir::new().unwrap();
        let sender_dir = TempDir::new().unwrap();

        let receiver = SessionHandle::start(
            test_config(receiver_dir.path(), "Workstation"),
            Identity::generate(),
            Role::Advertiser,
        )
        .await
        .unwrap();
        receiver.start_discovery().await.unwrap();
        let addr = receiver.snapshot().listen_addr.unwrap();

        let sender = SessionHandle::start(
            test_config(sender_dir.path(), "Scanner"),
            Identity::generate(),
            Role::Browser,
        )
        .await
        .unwrap();
        sender.invite(addr).await.unwrap();

        let snap = wait(&sender, |s| s.is_connected).await;
        assert_eq!(snap.connection_status, "Connected to Workstation");
        let snap = wait(&receiver, |s| s.is_connected).await;
        assert_eq!(snap.partner.unwrap().display_name, "Scanner");

        Pair {
            receiver,
            sender,
            receiver_dir,
            _sender_dir: sender_dir,
        }
    }

    fn capture_set(files: &[(&str, Vec<u8>)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, data) in files {
            fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    fn pack(src: &Path, out: &Path) -> PathBuf {
        archive::write_archive(src, &out.join("set.zip")).unwrap()
    }

    #[tokio::test]
    async fn test_send_without_peer_fails_fast() {
        let dir = TempDir::new().unwrap();
        let session = SessionHandle::start(
            test_config(dir.path(), "Scanner"),
            Identity::generate(),
            Role::Browser,
        )
        .await
        .unwrap();

        let err = session.send(&dir.path().join("set.zip")).await.unwrap_err();
        assert!(matches!(err, TransferError::NoPeer));

        let snap = session.snapshot();
        assert!(snap.outbound.is_none());
        assert_eq!(snap.transfer_status, TransferStatus::Idle);
        assert_eq!(snap.connection_status, "Not connected");

        let err = session.pack_and_send(dir.path()).await.unwrap_err();
        assert!(matches!(err, TransferError::NoPeer));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_over_loopback() {
        let pair = connected_pair().await;
        let set = capture_set(&[
            ("a.jpg", vec![0xAB; 120_000]),
            ("b.jpg", vec![0xCD; 98_000]),
        ]);
        let out = TempDir::new().unwrap();
        let container = pack(set.path(), out.path());

        pair.sender.send(&container).await.unwrap();
        let snap = pair.sender.snapshot();
        assert!(snap.outbound.is_none());
        assert_eq!(
            snap.transfer_status,
            TransferStatus::Sent {
                name: "set.zip".into()
            }
        );
        // the caller's container is left alone
        assert!(container.exists());

        let snap = wait(&pair.receiver, |s| s.received_folder.is_some()).await;
        let folder = snap.received_folder.unwrap();
        assert_eq!(fs::read(folder.join("a.jpg")).unwrap(), vec![0xAB; 120_000]);
        assert_eq!(fs::read(folder.join("b.jpg")).unwrap(), vec![0xCD; 98_000]);
        assert!(matches!(
            snap.transfer_status,
            TransferStatus::Received { skipped: 0, .. }
        ));
        let inbound = snap.inbound.unwrap();
        assert_eq!(inbound.direction, Direction::Inbound);
        assert_eq!(inbound.resource_name, "set.zip");
        assert_eq!(inbound.progress_fraction, 1.0);
        assert_eq!(inbound.terminal_result, Some(TerminalResult::Success));

        // a second set supersedes the first staging root
        let second = capture_set(&[("c.jpg", vec![0x11; 5_000])]);
        pair.sender.pack_and_send(second.path()).await.unwrap();
        let snap = wait(&pair.receiver, |s| {
            s.received_folder.as_ref().is_some_and(|f| *f != folder)
        })
        .await;
        let newer = snap.received_folder.unwrap();
        assert_eq!(fs::read(newer.join("c.jpg")).unwrap(), vec![0x11; 5_000]);

        let old_root = folder.parent().unwrap().to_path_buf();
        tokio::time::timeout(WAIT, async {
            while old_root.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("old staging root was not removed");

        // shutting down removes the current one too
        pair.receiver.shutdown().await.unwrap();
        assert!(!newer.exists());
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_failed_receive_keeps_previous_folder() {
        let pair = connected_pair().await;
        let set = capture_set(&[("a.jpg", vec![0xAB; 70_000])]);
        let out = TempDir::new().unwrap();
        let container = pack(set.path(), out.path());

        pair.sender.send(&container).await.unwrap();
        let snap = wait(&pair.receiver, |s| s.received_folder.is_some()).await;
        let folder = snap.received_folder.unwrap();

        // arrives intact but is not a container
        let junk = out.path().join("junk.zip");
        fs::write(&junk, vec![0x5A; 90_000]).unwrap();
        pair.sender.send(&junk).await.unwrap();

        let snap = wait(&pair.receiver, |s| {
            matches!(s.transfer_status, TransferStatus::ReceiveFailed { .. })
        })
        .await;
        assert_eq!(snap.received_folder.as_ref(), Some(&folder));
        assert!(folder.join("a.jpg").exists());
        let inbound = snap.inbound.unwrap();
        assert_eq!(inbound.resource_name, "junk.zip");
        assert_eq!(inbound.terminal_result, Some(TerminalResult::Success));

        let data = pair.receiver_dir.path();
        assert_eq!(entries(&data.join("incoming")), 0);
        // only the root of the earlier set
        assert_eq!(entries(&data.join("staging")), 1);
        pair.receiver.shutdown().await.unwrap();
        assert_eq!(entries(&data.join("staging")), 0);
    }

    fn idle_actor(dir: &Path) -> Actor {
        let config = test_config(dir, "Workstation");
        config.ensure_data_dir().unwrap();
        let service = config.service_id().unwrap();
        let (internal_tx, _) = mpsc::unbounded_channel();
        let (link_tx, _) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(placeholder(Role::Advertiser, None));
        Actor::new(
            config,
            service,
            Identity::generate(),
            Role::Advertiser,
            internal_tx,
            link_tx,
            state_tx,
        )
    }

    fn staged_root(actor: &Actor, files: &[(&str, Vec<u8>)]) -> StagingRoot {
        let set = capture_set(files);
        let tmp = tempfile::NamedTempFile::new_in(actor.config.incoming_dir()).unwrap();
        archive::write_archive(set.path(), tmp.path()).unwrap();
        staging::stage_container(tmp.into_temp_path(), &actor.config.staging_dir()).unwrap()
    }

    #[tokio::test]
    async fn test_overtaken_staging_failure_keeps_newer_result() {
        let dir = TempDir::new().unwrap();
        let mut actor = idle_actor(dir.path());
        actor.staging_seq = 2;

        let root = staged_root(&actor, &[("b.jpg", vec![2; 100])]);
        let folder = root.folder().to_path_buf();
        actor.staged(2, Ok(root));
        actor.staged(1, Err(TransferError::transport("bad container")));

        let snap = actor.snapshot();
        assert!(matches!(
            snap.transfer_status,
            TransferStatus::Received { .. }
        ));
        assert_eq!(snap.received_folder, Some(folder));

        // an overtaken success is dropped as well
        let older = staged_root(&actor, &[("a.jpg", vec![1; 100])]);
        let older_folder = older.folder().to_path_buf();
        actor.staged(1, Ok(older));
        assert_ne!(actor.snapshot().received_folder, Some(older_folder.clone()));
        actor.shutdown().await;
        tokio::time::timeout(WAIT, async {
            while older_folder.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("overtaken staging root was not removed");
    }

    #[tokio::test]
    async fn test_cancel_resolves_promptly() {
        let pair = connected_pair().await;
        let set = capture_set(&[("big.raw", vec![0x42; 12 * 1024 * 1024])]);
        let out = TempDir::new().unwrap();
        let container = pack(set.path(), out.path());

        let (first, second, cancelled) = tokio::time::timeout(WAIT, async {
            tokio::join!(
                pair.sender.send(&container),
                pair.sender.send(&container),
                pair.sender.cancel_send()
            )
        })
        .await
        .expect("cancel did not resolve the send");

        assert!(matches!(first, Err(TransferError::Cancelled)));
        assert!(matches!(second, Err(TransferError::Busy)));
        cancelled.unwrap();

        let snap = pair.sender.snapshot();
        assert!(snap.outbound.is_none());
        assert_eq!(
            snap.transfer_status,
            TransferStatus::SendCancelled {
                name: "set.zip".into()
            }
        );
        assert!(snap.transfer_status.is_terminal());
        assert!(snap.is_connected);
    }

    #[tokio::test]
    async fn test_disconnect_reaches_both_sides() {
        let pair = connected_pair().await;
        pair.sender.disconnect().await.unwrap();

        let snap = wait(&pair.sender, |s| !s.is_connected).await;
        assert_eq!(snap.connection_status, "Disconnected from Workstation");
        let snap = wait(&pair.receiver, |s| !s.is_connected).await;
        assert_eq!(snap.connection_status, "Disconnected from Scanner");

        let err = pair.sender.send(Path::new("set.zip")).await.unwrap_err();
        assert!(matches!(err, TransferError::NoPeer));
    }

    #[tokio::test]
    async fn test_discovery_start_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let session = SessionHandle::start(
            test_config(dir.path(), "Workstation"),
            Identity::generate(),
            Role::Advertiser,
        )
        .await
        .unwrap();
        let addr = session.snapshot().listen_addr;
        assert!(addr.is_some());

        session.start_discovery().await.unwrap();
        session.start_discovery().await.unwrap();
        let snap = wait(&session, |s| s.discovering).await;
        assert_eq!(snap.connection_status, "Waiting for peers");
        assert_eq!(snap.listen_addr, addr);

        session.stop_discovery().await.unwrap();
        session.stop_discovery().await.unwrap();
        let snap = wait(&session, |s| !s.discovering).await;
        assert_eq!(snap.connection_status, "Not connected");
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_invitation_times_out() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            invite_timeout_secs: 1,
            ..test_config(dir.path(), "Scanner")
        };
        let session = SessionHandle::start(config, Identity::generate(), Role::Browser)
            .await
            .unwrap();

        // accepts TCP connections but never answers the handshake
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        session.invite(addr).await.unwrap();

        let connecting = format!("Connecting to {}", addr);
        wait(&session, |s| s.connection_status == connecting).await;
        let snap = wait(&session, |s| s.connection_status == "Not connected").await;
        assert!(snap.peers.is_empty());
        assert!(!snap.is_connected);
        drop(silent);
    }
}
