//! Per-stream session state and the process-wide session table.
//!
//! A session is one tunnelled TCP stream. It owns the local peer socket's
//! write half, a bounded outbound datagram queue drained by the carrier
//! planner, a bounded peer-write queue drained towards the socket, and the
//! history map that answers RETRY requests. Queues reject instead of block:
//! back-pressure must be observable to callers.

pub mod planner;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::{Command, Datagram};
use crate::config::SocksConfig;

pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("session queue is full")]
    QueueFull,

    #[error("peer is not connected")]
    NoPeer,

    #[error("already connected")]
    AlreadyConnected,
}

struct Inner {
    closed: bool,
    number: i32,
    history: HashMap<i32, Datagram>,
    posts: HashMap<String, i64>,
    opened_at: Instant,
    activity: Instant,
    in_bytes: usize,
    out_bytes: usize,
}

/// Receiving ends of a session's queues; the engine hands them to the
/// planner worker and the peer-write drainer.
pub struct SessionChannels {
    pub datagrams: mpsc::Receiver<Datagram>,
    pub writes: mpsc::Receiver<Bytes>,
}

pub struct Session {
    id: i32,
    device: i64,
    inner: Mutex<Inner>,
    peer: tokio::sync::Mutex<Option<PeerWriter>>,
    has_peer: AtomicBool,
    connected: AtomicBool,
    datagrams_tx: mpsc::Sender<Datagram>,
    writes_tx: mpsc::Sender<Bytes>,
    closed_token: CancellationToken,
}

impl Session {
    /// Initialise a session and its queues. The caller spawns the two
    /// drainer workers on the returned channels.
    pub fn open(id: i32, device: i64, queue_size: usize) -> (std::sync::Arc<Self>, SessionChannels) {
        tracing::debug!(id, "session: open");

        let (datagrams_tx, datagrams_rx) = mpsc::channel(queue_size);
        let (writes_tx, writes_rx) = mpsc::channel(queue_size);
        let now = Instant::now();

        let session = std::sync::Arc::new(Self {
            id,
            device,
            inner: Mutex::new(Inner {
                closed: false,
                number: 0,
                history: HashMap::new(),
                posts: HashMap::new(),
                opened_at: now,
                activity: now,
                in_bytes: 0,
                out_bytes: 0,
            }),
            peer: tokio::sync::Mutex::new(None),
            has_peer: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            datagrams_tx,
            writes_tx,
            closed_token: CancellationToken::new(),
        });

        let channels = SessionChannels {
            datagrams: datagrams_rx,
            writes: writes_rx,
        };

        (session, channels)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn device(&self) -> i64 {
        self.device
    }

    /// Cancelled when the session closes; every worker loop selects on it.
    pub fn closed(&self) -> CancellationToken {
        self.closed_token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_inactive(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();

        if inner.closed || timeout.is_zero() {
            return false;
        }

        inner.activity.elapsed() > timeout
    }

    /// Fresh strictly-increasing sequence number.
    pub fn next_number(&self) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        inner.number += 1;

        inner.number
    }

    pub async fn set_peer(&self, writer: PeerWriter) {
        *self.peer.lock().await = Some(writer);
        self.has_peer.store(true, Ordering::SeqCst);
    }

    /// Mark the CONNECT as dispatched. Safe to call twice; the second call
    /// reports it instead of panicking.
    pub fn signal_connected(&self) -> Result<(), SessionError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnected);
        }

        Ok(())
    }

    pub fn history(&self, number: i32) -> Option<Datagram> {
        self.inner.lock().unwrap().history.get(&number).cloned()
    }

    /// Retain sent fragments for RETRY replay.
    pub fn record_history(&self, fragments: &[Datagram]) {
        let mut inner = self.inner.lock().unwrap();

        for fragment in fragments {
            inner.history.insert(fragment.number, fragment.clone());
        }
    }

    pub fn set_post(&self, club_id: &str, post_id: i64) {
        self.inner
            .lock()
            .unwrap()
            .posts
            .insert(club_id.to_string(), post_id);
    }

    pub fn has_posts(&self) -> bool {
        !self.inner.lock().unwrap().posts.is_empty()
    }

    pub fn posts(&self) -> Vec<(String, i64)> {
        self.inner
            .lock()
            .unwrap()
            .posts
            .iter()
            .map(|(club, post)| (club.clone(), *post))
            .collect()
    }

    /// Queue bytes for the local peer socket. Fails fast when the session
    /// is closed, the peer is not installed yet, or the queue is saturated.
    pub fn write_peer(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(SessionError::Closed);
        }

        if !self.has_peer.load(Ordering::SeqCst) {
            return Err(SessionError::NoPeer);
        }

        inner.activity = Instant::now();
        inner.in_bytes += data.len();
        drop(inner);

        self.writes_tx
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|_| SessionError::QueueFull)
    }

    /// Queue a datagram for the carrier planner. Stamps the session id when
    /// absent; a CONNECT additionally takes its sequence number here so no
    /// later FORWARD can overtake it.
    pub fn send_datagram(&self, mut dg: Datagram) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().unwrap();

            if inner.closed {
                return Err(SessionError::Closed);
            }

            if dg.session == 0 {
                dg.session = self.id;
            }

            if dg.number == 0 && dg.command == Command::Connect {
                inner.number += 1;
                dg.number = inner.number;
            }

            inner.activity = Instant::now();
            inner.out_bytes += dg.payload.len();
        }

        self.datagrams_tx
            .try_send(dg)
            .map_err(|_| SessionError::QueueFull)
    }

    /// Idempotent close: stops the workers, shuts the peer socket down and
    /// publishes the close signal.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();

            if inner.closed {
                return;
            }

            inner.closed = true;

            tracing::debug!(
                id = self.id,
                in_bytes = inner.in_bytes,
                out_bytes = inner.out_bytes,
                duration = inner.opened_at.elapsed().as_secs(),
                fragments = inner.history.len(),
                "session: close"
            );
        }

        self.closed_token.cancel();

        let mut peer = self.peer.lock().await;

        if let Some(mut writer) = peer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Peer-write drainer: moves queued chunks onto the local socket under
    /// the write deadline. A write failure closes the session.
    pub async fn run_writes(
        self: std::sync::Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        cfg: SocksConfig,
        log_payload: bool,
    ) {
        loop {
            let data = tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(data) => data,
                    None => return,
                },
                _ = self.closed_token.cancelled() => return,
            };

            if log_payload {
                tracing::debug!(id = self.id, out = %hex::encode(&data), "session: payload");
            }

            if let Err(err) = self.write_to_peer(&data, cfg.write_timeout()).await {
                tracing::error!(id = self.id, err = %err, "session: write");
                self.close().await;
                return;
            }
        }
    }

    /// Immediate peer write, bypassing the queue. The SOCKS stages use it
    /// for protocol replies that must hit the socket before the stream
    /// advances or closes.
    pub(crate) async fn write_peer_direct(
        &self,
        data: &[u8],
        deadline: Duration,
    ) -> std::io::Result<()> {
        self.write_to_peer(data, deadline).await
    }

    async fn write_to_peer(&self, data: &[u8], deadline: Duration) -> std::io::Result<()> {
        let mut peer = self.peer.lock().await;

        let writer = peer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "peer is not connected")
        })?;

        tokio::time::timeout(deadline, writer.write_all(data))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline"))?
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Mapping session-id → session plus the monotonic id generator for
/// locally-initiated streams.
pub struct SessionTable {
    sessions: Mutex<HashMap<i32, std::sync::Arc<Session>>>,
    next_id: AtomicI32,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(0),
        }
    }

    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, id: i32) -> Option<std::sync::Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn insert(&self, session: std::sync::Arc<Session>) {
        self.sessions.lock().unwrap().insert(session.id(), session);
    }

    /// True while at least one session is live; the storage watcher idles
    /// otherwise.
    pub fn any_open(&self) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .any(|session| !session.is_closed())
    }

    /// Sessions whose inactivity exceeded the timeout, for the reaper.
    pub fn inactive(&self, timeout: Duration) -> Vec<std::sync::Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| session.is_inactive(timeout))
            .cloned()
            .collect()
    }

    /// Drop closed sessions from the table.
    pub fn remove_closed(&self) {
        self.sessions
            .lock()
            .unwrap()
            .retain(|_, session| !session.is_closed());
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
