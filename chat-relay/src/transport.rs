//! Frames over TCP: the reliable-messaging substrate the protocol rides on.
//!
//! The codec and the loops above it only ever speak in ordered sequences of
//! byte frames. This module carries those sequences over TCP with a simple
//! multipart encoding (big-endian `u32` frame count, then per frame a
//! big-endian `u32` length and the bytes), and provides the four socket
//! roles the relay and its peers need:
//!
//! - [`RouterEndpoint`]: relay control side. Each connecting peer opens
//!   with a one-frame identity greeting; inbound messages surface with that
//!   identity prepended as frame 0, and outbound messages are routed by
//!   popping their leading identity frame. Unroutable messages are dropped.
//! - [`DealerSocket`]: peer control side; sends the identity greeting on
//!   connect, then exchanges payload frames with no identity prefix.
//! - [`PublisherEndpoint`]: relay broadcast side. Each subscriber opens
//!   with a greeting listing its topic prefixes (one per frame); a published
//!   message is delivered to every subscriber with a prefix matching the
//!   message's first frame. Delivery is best effort.
//! - [`SubscriberSocket`]: peer broadcast side.
//!
//! The stream encoding here is transport plumbing, not part of the
//! protocol's compatibility surface.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, warn};

/// One multipart message: an ordered sequence of byte frames.
pub type Frames = Vec<Vec<u8>>;

/// Upper bound on frames per message. Protocol messages use at most four.
pub const MAX_FRAMES: usize = 16;

/// Upper bound on a single frame (1 MiB). Protects against unbounded
/// allocation from a malformed length prefix.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Queue depth for per-connection writers and merged inbound queues.
const QUEUE_DEPTH: usize = 64;

/// Write one multipart message to the stream.
pub async fn write_frames<W>(writer: &mut W, frames: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() || frames.len() > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame count {} out of range", frames.len()),
        ));
    }
    // Encode the whole message once so it reaches the stream in one write.
    let mut buf = Vec::new();
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {MAX_FRAME_SIZE}", frame.len()),
            ));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one multipart message from the stream. Returns `Ok(None)` when the
/// peer closed the connection instead of sending another message.
pub async fn read_frames<R>(reader: &mut R) -> io::Result<Option<Frames>>
where
    R: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let count = u32::from_be_bytes(count_buf) as usize;
    if count == 0 || count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame count {count} out of range"),
        ));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
            ));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}

type PeerTable = Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<Frames>>>>;

/// Identity-routing control endpoint: the relay's inbound/outbound side.
pub struct RouterEndpoint {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<Frames>,
    peers: PeerTable,
    accept_task: JoinHandle<()>,
}

impl RouterEndpoint {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound) = mpsc::channel(QUEUE_DEPTH);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));

        let accept_peers = Arc::clone(&peers);
        let accept_task = tokio::spawn(async move {
            // Dropping the set on task abort tears down every connection.
            let mut connections = JoinSet::new();
            loop {
                while connections.try_join_next().is_some() {}
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let inbound_tx = inbound_tx.clone();
                        let peers = Arc::clone(&accept_peers);
                        connections.spawn(async move {
                            if let Err(err) = serve_control_peer(stream, inbound_tx, peers).await {
                                debug!(%peer, error = ?err, "control connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept control connection"),
                }
            }
        });

        Ok(Self {
            local_addr,
            inbound,
            peers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound message: identity frame followed by the payload frames.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbound.recv().await
    }

    /// [`RouterEndpoint::recv`] bounded by a timeout; `None` when nothing
    /// arrived in time.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Frames> {
        tokio::time::timeout(wait, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Route a message to the peer named by its leading identity frame.
    /// Messages for unknown, departed, or backed-up peers are dropped.
    pub fn send(&self, mut message: Frames) {
        if message.len() < 2 {
            warn!("discarding outbound control message without identity and payload");
            return;
        }
        let identity = message.remove(0);
        match self.peers.lock().get(&identity) {
            Some(queue) => {
                if queue.try_send(message).is_err() {
                    debug!("dropping control reply for a slow or departed peer");
                }
            }
            None => debug!("dropping control reply for an unknown identity"),
        }
    }
}

impl Drop for RouterEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
        // Dropping the write queues lets every writer task run down and
        // close its socket.
        self.peers.lock().clear();
    }
}

async fn serve_control_peer(
    stream: TcpStream,
    inbound: mpsc::Sender<Frames>,
    peers: PeerTable,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut greeting = match read_frames(&mut reader).await? {
        Some(frames) => frames,
        None => return Ok(()),
    };
    if greeting.len() != 1 || greeting[0].is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected a one-frame identity greeting",
        ));
    }
    let identity = greeting.remove(0);

    let (write_tx, mut write_rx) = mpsc::channel::<Frames>(QUEUE_DEPTH);
    // Last connection wins the identity; a replaced writer loses its queue
    // senders and runs down on its own.
    peers.lock().insert(identity.clone(), write_tx.clone());

    tokio::spawn(async move {
        let mut writer = write_half;
        while let Some(frames) = write_rx.recv().await {
            if let Err(err) = write_frames(&mut writer, &frames).await {
                debug!(error = ?err, "failed to write to control peer");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        match read_frames(&mut reader).await {
            Ok(Some(frames)) => {
                let mut message = Vec::with_capacity(frames.len() + 1);
                message.push(identity.clone());
                message.extend(frames);
                if inbound.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = ?err, "control peer stream error");
                break;
            }
        }
    }

    let mut table = peers.lock();
    if table
        .get(&identity)
        .is_some_and(|current| current.same_channel(&write_tx))
    {
        table.remove(&identity);
    }
    Ok(())
}

struct Subscription {
    prefixes: Vec<Vec<u8>>,
    queue: mpsc::Sender<Frames>,
}

/// Topic-filtered broadcast endpoint: the relay's outbound side.
pub struct PublisherEndpoint {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<Subscription>>>,
    accept_task: JoinHandle<()>,
}

impl PublisherEndpoint {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let subscribers: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_subscribers = Arc::clone(&subscribers);
        let accept_task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                while connections.try_join_next().is_some() {}
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let subscribers = Arc::clone(&accept_subscribers);
                        connections.spawn(async move {
                            if let Err(err) = serve_subscriber(stream, subscribers).await {
                                debug!(%peer, error = ?err, "subscriber connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept subscriber connection"),
                }
            }
        });

        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Deliver a message to every subscriber whose registered prefix is a
    /// byte-prefix of the message's first frame. Absent or backed-up
    /// subscribers are not an error.
    pub fn publish(&self, message: &Frames) {
        let Some(first) = message.first() else {
            warn!("discarding outbound broadcast without frames");
            return;
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.queue.is_closed());
        for sub in subscribers.iter() {
            if sub.prefixes.iter().any(|prefix| first.starts_with(prefix))
                && sub.queue.try_send(message.clone()).is_err()
            {
                debug!("dropping broadcast for a slow subscriber");
            }
        }
    }
}

impl Drop for PublisherEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.subscribers.lock().clear();
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    subscribers: Arc<Mutex<Vec<Subscription>>>,
) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Subscription greeting: one frame per topic prefix.
    let prefixes = match read_frames(&mut reader).await? {
        Some(frames) => frames,
        None => return Ok(()),
    };

    let (queue, mut pending) = mpsc::channel::<Frames>(QUEUE_DEPTH);
    subscribers.lock().push(Subscription { prefixes, queue });

    let mut writer = write_half;
    loop {
        select! {
            queued = pending.recv() => match queued {
                Some(frames) => write_frames(&mut writer, &frames).await?,
                None => break,
            },
            // A subscriber only ever reads; traffic here means it is gone
            // (EOF) or confused, and either way the subscription ends.
            inbound = read_frames(&mut reader) => {
                if let Ok(Some(_)) = inbound {
                    debug!("unexpected frames from a subscriber");
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Peer-side control socket carrying a fixed identity.
pub struct DealerSocket {
    reader: DealerReader,
    writer: DealerWriter,
}

/// Receiving half of a [`DealerSocket`].
pub struct DealerReader {
    reader: BufReader<OwnedReadHalf>,
}

/// Sending half of a [`DealerSocket`].
pub struct DealerWriter {
    writer: OwnedWriteHalf,
}

impl DealerSocket {
    /// Connect and announce `identity`, which the far router uses as this
    /// socket's routing prefix.
    pub async fn connect(addr: SocketAddr, identity: &[u8]) -> io::Result<Self> {
        if identity.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "identity must not be empty",
            ));
        }
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = DealerWriter { writer: write_half };
        writer.send(&[identity.to_vec()]).await?;
        Ok(Self {
            reader: DealerReader {
                reader: BufReader::new(read_half),
            },
            writer,
        })
    }

    pub async fn send(&mut self, frames: &[Vec<u8>]) -> io::Result<()> {
        self.writer.send(frames).await
    }

    pub async fn recv(&mut self) -> io::Result<Option<Frames>> {
        self.reader.recv().await
    }

    pub fn into_split(self) -> (DealerReader, DealerWriter) {
        (self.reader, self.writer)
    }

    pub async fn shutdown(self) {
        self.writer.shutdown().await;
    }
}

impl DealerReader {
    pub async fn recv(&mut self) -> io::Result<Option<Frames>> {
        read_frames(&mut self.reader).await
    }
}

impl DealerWriter {
    pub async fn send(&mut self, frames: &[Vec<u8>]) -> io::Result<()> {
        write_frames(&mut self.writer, frames).await
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = ?err, "failed to shut down control socket cleanly");
        }
    }
}

/// Peer-side broadcast socket filtered to a set of topic prefixes.
pub struct SubscriberSocket {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SubscriberSocket {
    /// Connect and register the topic prefixes this socket wants delivered.
    pub async fn connect(addr: SocketAddr, prefixes: &[Vec<u8>]) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut socket = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        write_frames(&mut socket.writer, prefixes).await?;
        Ok(socket)
    }

    pub async fn recv(&mut self) -> io::Result<Option<Frames>> {
        read_frames(&mut self.reader).await
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = ?err, "failed to shut down subscriber socket cleanly");
        }
    }
}
