//! Engine lifecycle: construction, wiring and teardown.
//!
//! The engine owns every piece of process-wide state (device id, session
//! table, handler queues, storage namespace, carrier handle) so nothing
//! hides in globals. `start` binds the SOCKS listener, spawns the carrier
//! pollers and reapers, and returns a handle that supervises them until
//! shutdown or the first fatal error.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::carrier::qr::{QrCodec, QrError};
use crate::carrier::{Carrier, CarrierError};
use crate::codec::Datagram;
use crate::config::{Config, ConfigError};
use crate::crypto::KEY_LEN;
use crate::handler::queue::QueueClosed;
use crate::handler::{CommandHandler, QueueTable};
use crate::session::planner::Planner;
use crate::session::{Session, SessionTable};
use crate::socks::{PeerLoop, Stage};
use crate::storage::StorageKeys;

/// Long-poll events a working tunnel depends on.
const REQUIRED_EVENTS: [&str; 5] = [
    "message_reply",
    "wall_post_new",
    "wall_reply_new",
    "photo_new",
    "group_change_settings",
];

const REAP_INTERVAL: Duration = Duration::from_secs(10);
const CLEAN_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("carrier: {0}")]
    Carrier(#[from] CarrierError),

    #[error("qr: {0}")]
    Qr(#[from] QrError),
}

pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) device: i64,
    pub(crate) secret: Option<[u8; KEY_LEN]>,
    pub(crate) carrier: Arc<dyn Carrier>,
    pub(crate) qr: Arc<QrCodec>,
    pub(crate) sessions: SessionTable,
    pub(crate) queues: QueueTable,
    pub(crate) storage: Arc<StorageKeys>,
    pub(crate) planner: Arc<Planner>,
    pub(crate) handler: Arc<CommandHandler>,
    dispatch_lock: Mutex<()>,
    pub(crate) shutdown: CancellationToken,
}

impl Engine {
    /// Build an engine whose device id is the startup time in epoch millis.
    pub fn new(cfg: Config, carrier: Arc<dyn Carrier>) -> Result<Arc<Self>, EngineError> {
        let device = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        Self::with_device(cfg, carrier, device)
    }

    /// Build an engine with an explicit device id; tests pair two engines
    /// with known, distinct identities.
    pub fn with_device(
        cfg: Config,
        carrier: Arc<dyn Carrier>,
        device: i64,
    ) -> Result<Arc<Self>, EngineError> {
        let secret = cfg.session.secret_key().map_err(ConfigError::Secret)?;
        let storage = Arc::new(StorageKeys::new(device));
        let qr = Arc::new(QrCodec::new(cfg.qr.clone()));

        let planner = Arc::new(Planner::new(
            cfg.clone(),
            device,
            carrier.clone(),
            qr.clone(),
            storage.clone(),
        ));

        let handler = Arc::new(CommandHandler::new(
            device,
            secret,
            cfg.socks.clone(),
            cfg.log.payload,
        ));

        Ok(Arc::new(Self {
            cfg,
            device,
            secret,
            carrier,
            qr,
            sessions: SessionTable::new(),
            queues: QueueTable::new(),
            storage,
            planner,
            handler,
            dispatch_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn device(&self) -> i64 {
        self.device
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn has_open_sessions(&self) -> bool {
        self.sessions.any_open()
    }

    /// Open a session and its two drainer workers.
    pub(crate) fn spawn_session(&self, id: i32) -> Arc<Session> {
        let (session, channels) = Session::open(id, self.device, self.cfg.session.queue_size);

        tokio::spawn(
            self.planner
                .clone()
                .run(session.clone(), channels.datagrams),
        );
        tokio::spawn(session.clone().run_writes(
            channels.writes,
            self.cfg.socks.clone(),
            self.cfg.log.payload,
        ));

        self.sessions.insert(session.clone());

        session
    }

    /// Session for a locally accepted SOCKS stream.
    pub fn open_local_session(&self) -> Arc<Session> {
        self.spawn_session(self.sessions.next_id())
    }

    /// Route an inbound datagram to its session's reorder queue, opening
    /// the session on first sight of an unknown id (the remote-initiated
    /// case).
    pub fn dispatch_datagram(&self, dg: Datagram) -> Result<(), QueueClosed> {
        let _guard = self.dispatch_lock.lock().unwrap();

        let session = match self.sessions.get(dg.session) {
            Some(session) => session,
            None => {
                let session = self.spawn_session(dg.session);
                self.queues.remove(session.id());
                session
            }
        };

        let queue = self.queues.get_or_open(&session, self.handler.clone());

        queue.add(dg)
    }

    /// Probe the platform credentials and the QR toolchain before serving.
    pub async fn validate_platform(&self) -> Result<(), EngineError> {
        for club in &self.cfg.clubs {
            self.carrier.check_club(club).await?;

            let settings = self.carrier.long_poll_settings(club).await?;

            if !settings.is_enabled {
                tracing::warn!(club = %club.name, "carrier: long poll disabled");
            }

            for event in REQUIRED_EVENTS {
                if !settings.events.get(event).copied().unwrap_or(false) {
                    tracing::warn!(club = %club.name, event, "carrier: event disabled");
                }
            }
        }

        if !self.cfg.api.unathorized {
            for user in &self.cfg.users {
                self.carrier.check_user(user).await?;
            }
        }

        self.qr.self_test().await?;

        Ok(())
    }

    /// Bind the SOCKS listener and spawn every background worker. The
    /// returned handle supervises them.
    pub async fn start(self: Arc<Self>) -> Result<EngineHandle, EngineError> {
        let listener = TcpListener::bind(self.cfg.socks.listen_addr()).await?;
        let socks_addr = listener.local_addr()?;

        tracing::info!(addr = %socks_addr, "socks: listening");

        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(16);

        tokio::spawn(run_accept(self.clone(), listener));

        for club in self.cfg.clubs.clone() {
            let engine = self.clone();
            let tx = err_tx.clone();
            let watcher_club = club.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run_long_poll(club).await {
                    let _ = tx.send(err).await;
                }
            });

            let engine = self.clone();
            let tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run_storage_watch(watcher_club).await {
                    let _ = tx.send(err).await;
                }
            });
        }

        tokio::spawn(run_session_reaper(self.clone()));
        tokio::spawn(run_table_cleaner(self.clone()));

        let engine = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = engine.shutdown.cancelled() => Ok(()),
                maybe = err_rx.recv() => match maybe {
                    Some(err) => {
                        engine.shutdown.cancel();
                        Err(err)
                    }
                    None => Ok(()),
                },
            }
        });

        Ok(EngineHandle {
            socks_addr,
            engine: self,
            task,
        })
    }
}

/// Serve the local SOCKS port: every accepted stream becomes a session
/// with its own peer loop starting at the handshake stage.
async fn run_accept(engine: Arc<Engine>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                let session = engine.open_local_session();
                tracing::debug!(remote = %remote, ses = %session, "socks: accept");

                let (read, write) = stream.into_split();
                let engine = engine.clone();

                tokio::spawn(async move {
                    session.set_peer(Box::new(write)).await;

                    let peer_loop = PeerLoop {
                        session,
                        cfg: engine.cfg.socks.clone(),
                        log_payload: engine.cfg.log.payload,
                        device: engine.device,
                        secret: engine.secret,
                    };
                    peer_loop.run(read, Stage::Handshake).await;
                });
            }
            Err(err) => {
                tracing::error!(err = %err, "socks: accept");
            }
        }
    }
}

/// Close sessions that sat idle past the configured timeout.
async fn run_session_reaper(engine: Arc<Engine>) {
    let timeout = engine.cfg.session.timeout();

    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(REAP_INTERVAL) => {}
        }

        for session in engine.sessions.inactive(timeout) {
            tracing::warn!(ses = %session, "session: timeout");
            tokio::spawn(async move { session.close().await });
        }
    }
}

/// Drop closed sessions and handler queues from their tables.
async fn run_table_cleaner(engine: Arc<Engine>) {
    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(CLEAN_INTERVAL) => {}
        }

        engine.sessions.remove_closed();
        engine.queues.remove_closed();
    }
}

/// A started engine. Dropping the handle does not stop the engine; call
/// `shutdown` (or let the first fatal worker error do it) and `wait`.
pub struct EngineHandle {
    pub socks_addr: SocketAddr,
    engine: Arc<Engine>,
    task: JoinHandle<Result<(), EngineError>>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn shutdown(&self) {
        self.engine.shutdown.cancel();
    }

    pub async fn wait(self) -> Result<(), EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(EngineError::Io(std::io::Error::other(join))),
        }
    }
}
