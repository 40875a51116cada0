//! An established, encrypted connection to one peer.
//!
//! After the handshake and the invitation exchange the stream is split: a
//! writer task drains a bounded queue of outbound messages, and a reader
//! task turns inbound messages into [`LinkEvent`]s. An inbound resource is
//! written to a temporary file as it arrives and handed over only once it
//! is complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::TransferError;
use crate::handshake::{self, SecureChannel};
use crate::keys::Identity;
use crate::state::PeerId;
use crate::wire::Message;

/// Outbound messages buffered per link before senders have to wait.
const OUTBOUND_QUEUE: usize = 8;
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opened the connection and sends the invitation.
    Initiator,
    /// Accepted the connection and accepts the invitation.
    Responder,
}

/// Handshake and invitation done; not yet running.
pub struct Established<S> {
    peer: PeerId,
    stream: S,
    channel: SecureChannel,
}

impl<S> Established<S> {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    InboundStarted {
        generation: u64,
        transfer_id: u64,
        name: String,
        size: u64,
    },
    /// Bytes of the current resource written so far.
    InboundProgress {
        generation: u64,
        transfer_id: u64,
        received: u64,
        size: u64,
    },
    /// A complete resource (already acknowledged) or the reason it failed.
    InboundFinished {
        generation: u64,
        transfer_id: u64,
        name: String,
        result: Result<TempPath, String>,
    },
    Receipt {
        generation: u64,
        transfer_id: u64,
        ok: bool,
        reason: Option<String>,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

/// Owner side of a running link. Dropping it stops reading; the writer
/// flushes what is queued and then closes the stream.
pub struct LinkHandle {
    generation: u64,
    peer: PeerId,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
}

impl LinkHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Run the handshake and the invitation exchange on a fresh stream.
pub async fn establish<S>(
    mut stream: S,
    side: Side,
    identity: &Identity,
    display_name: &str,
) -> Result<Established<S>, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let channel = match side {
        Side::Initiator => handshake::initiator_handshake(identity, &mut stream).await?,
        Side::Responder => handshake::responder_handshake(identity, &mut stream).await?,
    };

    let fingerprint = channel.peer_fingerprint();
    if fingerprint == identity.fingerprint() {
        return Err(TransferError::transport("refusing a link to ourselves"));
    }

    let peer_name = match side {
        Side::Initiator => {
            let invite = Message::Invite {
                display_name: display_name.to_string(),
            };
            send_message(&channel, &mut stream, &invite).await?;
            match read_message(&channel, &mut stream).await? {
                Message::InviteAccepted { display_name } => display_name,
                other => return Err(unexpected(&other)),
            }
        }
        Side::Responder => {
            let name = match read_message(&channel, &mut stream).await? {
                Message::Invite { display_name } => display_name,
                other => return Err(unexpected(&other)),
            };
            let accepted = Message::InviteAccepted {
                display_name: display_name.to_string(),
            };
            send_message(&channel, &mut stream, &accepted).await?;
            name
        }
    };

    Ok(Established {
        peer: PeerId {
            display_name: peer_name,
            fingerprint,
        },
        stream,
        channel,
    })
}

/// Start the reader and writer tasks of an established link.
pub fn spawn_link<S>(
    established: Established<S>,
    generation: u64,
    incoming_dir: PathBuf,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> LinkHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Established {
        peer,
        stream,
        channel,
    } = established;
    let channel = Arc::new(channel);
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

    tokio::spawn(write_loop(writer, channel.clone(), rx, generation, events.clone()));
    let inbound = InboundState {
        generation,
        incoming_dir,
        outbound: tx.clone(),
        events: events.clone(),
        current: None,
    };
    let reader = tokio::spawn(read_loop(reader, channel, inbound, events));

    tracing::info!(generation, peer = %peer, "Link up");
    LinkHandle {
        generation,
        peer,
        outbound: tx,
        reader,
    }
}

/// Stream the file at `path` as resource `transfer_id`.
///
/// Returns once every chunk and the end marker are queued; the peer's
/// verdict arrives later as a [`LinkEvent::Receipt`]. When `cancel` flips
/// the peer is told to drop its partial copy and `Cancelled` is returned.
pub async fn stream_resource<F>(
    outbound: mpsc::Sender<Message>,
    transfer_id: u64,
    path: &Path,
    name: &str,
    mut cancel: watch::Receiver<bool>,
    mut progress: F,
) -> Result<(), TransferError>
where
    F: FnMut(u64, u64) + Send,
{
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let start = Message::ResourceStart {
        transfer_id,
        name: name.to_string(),
        size,
    };
    outbound.send(start).await.map_err(|_| link_closed())?;
    tracing::debug!(transfer_id, size, "Streaming {}", name);

    let mut buf = vec![0u8; archive::CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        if *cancel.borrow() {
            return Err(notify_cancel(&outbound, transfer_id).await);
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = Message::ResourceChunk {
            transfer_id,
            data: buf[..n].to_vec(),
        };
        tokio::select! {
            biased;
            _ = cancel.changed() => {
                return Err(notify_cancel(&outbound, transfer_id).await);
            }
            res = outbound.send(chunk) => res.map_err(|_| link_closed())?,
        }
        sent += n as u64;
        progress(sent, size);
    }

    if sent != size {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} changed while it was being sent", name),
        )));
    }
    outbound
        .send(Message::ResourceEnd { transfer_id })
        .await
        .map_err(|_| link_closed())?;
    Ok(())
}

async fn notify_cancel(outbound: &mpsc::Sender<Message>, transfer_id: u64) -> TransferError {
    let notice = outbound.send(Message::ResourceCancel { transfer_id });
    if tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, notice).await.is_err() {
        tracing::warn!(transfer_id, "Could not tell the peer about the cancellation");
    }
    TransferError::Cancelled
}

fn link_closed() -> TransferError {
    TransferError::transport("link closed")
}

fn unexpected(msg: &Message) -> TransferError {
    TransferError::transport(format!("unexpected {} during invitation", msg.kind()))
}

async fn send_message<W>(
    channel: &SecureChannel,
    writer: &mut W,
    msg: &Message,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + Send,
{
    let bytes = msg
        .encode()
        .map_err(|e| TransferError::transport(format!("encoding {}: {}", msg.kind(), e)))?;
    channel.send_frame(writer, &bytes).await?;
    Ok(())
}

async fn read_message<R>(channel: &SecureChannel, reader: &mut R) -> Result<Message, TransferError>
where
    R: AsyncRead + Unpin + Send,
{
    let bytes = channel.read_frame(reader).await?;
    Message::decode(&bytes).map_err(|e| TransferError::transport(format!("undecodable message: {}", e)))
}

async fn write_loop<W>(
    mut writer: W,
    channel: Arc<SecureChannel>,
    mut rx: mpsc::Receiver<Message>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_message(&channel, &mut writer, &msg).await {
            tracing::warn!(generation, "Link write failed: {}", e);
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: e.to_string(),
            });
            return;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(generation, "Link writer finished");
}

async fn read_loop<R>(
    mut reader: R,
    channel: Arc<SecureChannel>,
    mut inbound: InboundState,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    R: AsyncRead + Unpin + Send,
{
    let generation = inbound.generation;
    let reason = loop {
        let msg = match read_message(&channel, &mut reader).await {
            Ok(msg) => msg,
            Err(TransferError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "peer closed the link".to_string();
            }
            Err(e) => break e.to_string(),
        };

        match msg {
            Message::ResourceStart {
                transfer_id,
                name,
                size,
            } => inbound.start(transfer_id, name, size).await,
            Message::ResourceChunk { transfer_id, data } => inbound.chunk(transfer_id, &data).await,
            Message::ResourceEnd { transfer_id } => inbound.end(transfer_id).await,
            Message::ResourceCancel { transfer_id } => inbound.cancel(transfer_id),
            Message::ResourceReceipt {
                transfer_id,
                ok,
                reason,
            } => {
                let _ = events.send(LinkEvent::Receipt {
                    generation,
                    transfer_id,
                    ok,
                    reason,
                });
            }
            other => tracing::debug!(generation, "Ignoring {} on a running link", other.kind()),
        }
    };

    inbound.abort("link closed mid-transfer");
    tracing::info!(generation, "Link down: {}", reason);
    let _ = events.send(LinkEvent::Closed { generation, reason });
}

struct Inbound {
    transfer_id: u64,
    name: String,
    size: u64,
    received: u64,
    file: File,
    path: TempPath,
}

/// Receiving side of a link: at most one resource at a time.
struct InboundState {
    generation: u64,
    incoming_dir: PathBuf,
    outbound: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<LinkEvent>,
    current: Option<Inbound>,
}

impl InboundState {
    async fn start(&mut self, transfer_id: u64, name: String, size: u64) {
        if let Some(prev) = self.current.take() {
            self.fail(prev, "superseded by a new resource".into()).await;
        }

        let opened = tempfile::Builder::new()
            .prefix("incoming-")
            .tempfile_in(&self.incoming_dir)
            .map(|f| f.into_parts());
        let (file, path) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(transfer_id, "Cannot store inbound resource: {}", e);
                self.receipt(transfer_id, false, Some(e.to_string())).await;
                let _ = self.events.send(LinkEvent::InboundFinished {
                    generation: self.generation,
                    transfer_id,
                    name,
                    result: Err(format!("cannot store resource: {}", e)),
                });
                return;
            }
        };

        tracing::info!(transfer_id, size, "Receiving {}", name);
        let _ = self.events.send(LinkEvent::InboundStarted {
            generation: self.generation,
            transfer_id,
            name: name.clone(),
            size,
        });
        self.current = Some(Inbound {
            transfer_id,
            name,
            size,
            received: 0,
            file: File::from_std(file),
            path,
        });
    }

    async fn chunk(&mut self, transfer_id: u64, data: &[u8]) {
        let Some(cur) = self
            .current
            .as_mut()
            .filter(|c| c.transfer_id == transfer_id)
        else {
            tracing::trace!(transfer_id, "Dropping chunk of an unknown resource");
            return;
        };

        cur.received += data.len() as u64;
        let failure = if cur.received > cur.size {
            Some(format!("more data than the announced {} bytes", cur.size))
        } else {
            cur.file
                .write_all(data)
                .await
                .err()
                .map(|e| format!("writing resource: {}", e))
        };
        let (received, size) = (cur.received, cur.size);

        match failure {
            Some(reason) => {
                if let Some(cur) = self.current.take() {
                    self.fail(cur, reason).await;
                }
            }
            None => {
                let _ = self.events.send(LinkEvent::InboundProgress {
                    generation: self.generation,
                    transfer_id,
                    received,
                    size,
                });
            }
        }
    }

    async fn end(&mut self, transfer_id: u64) {
        let Some(mut cur) = self.current.take() else {
            return;
        };
        if cur.transfer_id != transfer_id {
            self.current = Some(cur);
            return;
        }

        if cur.received != cur.size {
            let reason = format!("got {} of {} bytes", cur.received, cur.size);
            self.fail(cur, reason).await;
            return;
        }
        if let Err(e) = cur.file.flush().await {
            self.fail(cur, format!("writing resource: {}", e)).await;
            return;
        }

        self.receipt(transfer_id, true, None).await;
        let Inbound {
            name, path, file, ..
        } = cur;
        drop(file);
        tracing::info!(transfer_id, "Received {}", name);
        let _ = self.events.send(LinkEvent::InboundFinished {
            generation: self.generation,
            transfer_id,
            name,
            result: Ok(path),
        });
    }

    fn cancel(&mut self, transfer_id: u64) {
        if self.current.as_ref().map(|c| c.transfer_id) == Some(transfer_id) {
            self.abort("cancelled by sender");
        }
    }

    /// Drop the current resource without a receipt.
    fn abort(&mut self, reason: &str) {
        if let Some(cur) = self.current.take() {
            let Inbound {
                transfer_id, name, ..
            } = cur;
            tracing::info!(transfer_id, "Dropped {}: {}", name, reason);
            let _ = self.events.send(LinkEvent::InboundFinished {
                generation: self.generation,
                transfer_id,
                name,
                result: Err(reason.to_string()),
            });
        }
    }

    async fn fail(&mut self, cur: Inbound, reason: String) {
        let Inbound {
            transfer_id, name, ..
        } = cur;
        tracing::warn!(transfer_id, "Rejected {}: {}", name, reason);
        self.receipt(transfer_id, false, Some(reason.clone())).await;
        let _ = self.events.send(LinkEvent::InboundFinished {
            generation: self.generation,
            transfer_id,
            name,
            result: Err(reason),
        });
    }

    async fn receipt(&self, transfer_id: u64, ok: bool, reason: Option<String>) {
        let receipt = Message::ResourceReceipt {
            transfer_id,
            ok,
            reason,
        };
        if self.outbound.send(receipt).await.is_err() {
            tracing::debug!(transfer_id, "Link closed before the receipt went out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::duplex;

    struct Pair {
        a: LinkHandle,
        a_events: mpsc::UnboundedReceiver<LinkEvent>,
        b: LinkHandle,
        b_events: mpsc::UnboundedReceiver<LinkEvent>,
        b_incoming: TempDir,
        _a_incoming: TempDir,
    }

    async fn linked_pair() -> Pair {
        let (sa, sb) = duplex(256 * 1024);
        let ia = Identity::generate();
        let ib = Identity::generate();

        let (ea, eb) = tokio::join!(
            establish(sa, Side::Initiator, &ia, "Scanner"),
            establish(sb, Side::Responder, &ib, "Workstation")
        );
        let (ea, eb) = (ea.unwrap(), eb.unwrap());
        assert_eq!(ea.peer().display_name, "Workstation");
        assert_eq!(ea.peer().fingerprint, ib.fingerprint());
        assert_eq!(eb.peer().display_name, "Scanner");
        assert_eq!(eb.peer().fingerprint, ia.fingerprint());

        let a_incoming = TempDir::new().unwrap();
        let b_incoming = TempDir::new().unwrap();
        let (a_tx, a_events) = mpsc::unbounded_channel();
        let (b_tx, b_events) = mpsc::unbounded_channel();
        Pair {
            a: spawn_link(ea, 1, a_incoming.path().to_path_buf(), a_tx),
            a_events,
            b: spawn_link(eb, 2, b_incoming.path().to_path_buf(), b_tx),
            b_events,
            b_incoming,
            _a_incoming: a_incoming,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a link event")
            .expect("event channel closed")
    }

    /// Next event that is not a progress report.
    async fn next_settled(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        loop {
            match next(rx).await {
                LinkEvent::InboundProgress { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_resource_arrives_and_is_acknowledged() {
        let mut pair = linked_pair().await;
        let src = TempDir::new().unwrap();
        let path = src.path().join("set.zip");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut seen = Vec::new();
        stream_resource(pair.a.sender(), 7, &path, "set.zip", cancel_rx, |sent, total| {
            seen.push((sent, total))
        })
        .await
        .unwrap();

        assert!(seen.len() >= 4);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen.last(), Some(&(200_000, 200_000)));

        match next(&mut pair.b_events).await {
            LinkEvent::InboundStarted {
                generation,
                transfer_id,
                name,
                size,
            } => {
                assert_eq!((generation, transfer_id, size), (2, 7, 200_000));
                assert_eq!(name, "set.zip");
            }
            other => panic!("unexpected {:?}", other),
        }
        let mut received = Vec::new();
        loop {
            match next(&mut pair.b_events).await {
                LinkEvent::InboundProgress {
                    transfer_id,
                    received: at,
                    size,
                    ..
                } => {
                    assert_eq!((transfer_id, size), (7, 200_000));
                    received.push(at);
                }
                LinkEvent::InboundFinished {
                    result: Ok(tmp), ..
                } => {
                    assert_eq!(std::fs::read(&tmp).unwrap(), payload);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(received.last(), Some(&200_000));
        match next(&mut pair.a_events).await {
            LinkEvent::Receipt {
                generation,
                transfer_id,
                ok,
                ..
            } => assert_eq!((generation, transfer_id, ok), (1, 7, true)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_drops_partial_copy() {
        let mut pair = linked_pair().await;
        let tx = pair.a.sender();
        tx.send(Message::ResourceStart {
            transfer_id: 3,
            name: "set.zip".into(),
            size: 100,
        })
        .await
        .unwrap();
        tx.send(Message::ResourceChunk {
            transfer_id: 3,
            data: vec![1; 10],
        })
        .await
        .unwrap();
        tx.send(Message::ResourceCancel { transfer_id: 3 })
            .await
            .unwrap();

        assert!(matches!(
            next(&mut pair.b_events).await,
            LinkEvent::InboundStarted { transfer_id: 3, .. }
        ));
        match next_settled(&mut pair.b_events).await {
            LinkEvent::InboundFinished {
                result: Err(reason),
                ..
            } => assert!(reason.contains("cancelled")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(std::fs::read_dir(pair.b_incoming.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_short_resource_is_rejected() {
        let mut pair = linked_pair().await;
        let tx = pair.a.sender();
        tx.send(Message::ResourceStart {
            transfer_id: 9,
            name: "set.zip".into(),
            size: 100,
        })
        .await
        .unwrap();
        tx.send(Message::ResourceChunk {
            transfer_id: 9,
            data: vec![1; 10],
        })
        .await
        .unwrap();
        tx.send(Message::ResourceEnd { transfer_id: 9 }).await.unwrap();

        let _started = next(&mut pair.b_events).await;
        assert!(matches!(
            next_settled(&mut pair.b_events).await,
            LinkEvent::InboundFinished { result: Err(_), .. }
        ));
        match next(&mut pair.a_events).await {
            LinkEvent::Receipt {
                transfer_id,
                ok,
                reason,
                ..
            } => {
                assert_eq!(transfer_id, 9);
                assert!(!ok);
                assert!(reason.unwrap().contains("10 of 100"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_one_side_closes_the_other() {
        let mut pair = linked_pair().await;
        drop(pair.a);
        match next(&mut pair.b_events).await {
            LinkEvent::Closed { generation, .. } => assert_eq!(generation, 2),
            other => panic!("unexpected {:?}", other),
        }
        // the surviving side can no longer deliver
        drop(pair.b);
    }

    #[tokio::test]
    async fn test_preset_cancel_stops_before_streaming() {
        let pair = linked_pair().await;
        let src = TempDir::new().unwrap();
        let path = src.path().join("set.zip");
        std::fs::write(&path, vec![0u8; 300_000]).unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let err = stream_resource(pair.a.sender(), 1, &path, "set.zip", cancel_rx, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
