//! Inbound command dispatch.
//!
//! Datagrams that survived decoding and reordering land here. CONNECT dials
//! the requested target and turns the session into a live forwarder; FORWARD
//! feeds the peer socket; RETRY replays sent fragments from history; CLOSE
//! tears the session down without notifying back.

pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::codec::{CodecError, Command, ConnectPayload, Datagram, RetryPayload};
use crate::config::SocksConfig;
use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::session::{Session, SessionError};
use crate::socks::{PeerLoop, Stage};

use queue::HandlerQueue;

/// Hard deadline for dialing a CONNECT target.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("connect payload: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("dial timed out")]
    DialTimeout,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("unsupported command {0}")]
    Unsupported(i16),
}

pub struct CommandHandler {
    device: i64,
    secret: Option<[u8; KEY_LEN]>,
    socks: SocksConfig,
    log_payload: bool,
}

impl CommandHandler {
    pub fn new(
        device: i64,
        secret: Option<[u8; KEY_LEN]>,
        socks: SocksConfig,
        log_payload: bool,
    ) -> Self {
        Self {
            device,
            secret,
            socks,
            log_payload,
        }
    }

    pub async fn handle(&self, session: &Arc<Session>, dg: &Datagram) -> Result<(), HandlerError> {
        tracing::debug!(dg = %dg, "handler: command");

        if self.log_payload {
            tracing::debug!(ses = %session, payload = %hex::encode(&dg.payload), "handler: payload");
        }

        match dg.command {
            Command::Connect => {
                self.connect(session, dg).await?;
                tracing::info!(ses = %session, "handler: forwarding");
            }
            Command::Forward => session.write_peer(&dg.payload)?,
            Command::Close => session.close().await,
            Command::Retry => self.retry(session, dg)?,
            Command::Other(code) => return Err(HandlerError::Unsupported(code)),
        }

        Ok(())
    }

    /// Dial the tunnelled target, install it as the session peer and start
    /// the forward read loop towards the carrier.
    async fn connect(&self, session: &Arc<Session>, dg: &Datagram) -> Result<(), HandlerError> {
        let payload = match &self.secret {
            Some(key) => crypto::decrypt(&dg.payload, key)?,
            None => dg.payload.clone(),
        };

        let connect = ConnectPayload::decode(&payload)?;
        let addr = connect.address();

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| HandlerError::DialTimeout)??;

        let (read, write) = stream.into_split();
        session.set_peer(Box::new(write)).await;

        let peer_loop = PeerLoop {
            session: session.clone(),
            cfg: self.socks.clone(),
            log_payload: self.log_payload,
            device: self.device,
            secret: self.secret,
        };
        tokio::spawn(peer_loop.run(read, Stage::Forward));

        Ok(())
    }

    /// Replay a retained fragment; a miss is only worth a log line.
    fn retry(&self, session: &Arc<Session>, dg: &Datagram) -> Result<(), HandlerError> {
        let request = RetryPayload::decode(&dg.payload)?;

        match session.history(request.number) {
            Some(found) => session.send_datagram(found)?,
            None => {
                tracing::debug!(ses = %session, number = request.number, "handler: history miss")
            }
        }

        Ok(())
    }
}

/// Table of per-session reorder queues, living next to the session table
/// for the lifetime of their sessions plus a cleanup period.
pub struct QueueTable {
    queues: Mutex<HashMap<i32, Arc<HandlerQueue>>>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue for the session, spawning a fresh driver when none exists.
    pub fn get_or_open(
        &self,
        session: &Arc<Session>,
        handler: Arc<CommandHandler>,
    ) -> Arc<HandlerQueue> {
        let mut queues = self.queues.lock().unwrap();

        if let Some(queue) = queues.get(&session.id()) {
            return queue.clone();
        }

        let queue = HandlerQueue::open(session.clone());
        queues.insert(session.id(), queue.clone());

        tokio::spawn(queue.clone().run(handler));

        queue
    }

    /// Drop a stale queue, e.g. when a session id gets reused by the peer.
    pub fn remove(&self, id: i32) {
        self.queues.lock().unwrap().remove(&id);
    }

    pub fn remove_closed(&self) {
        self.queues
            .lock()
            .unwrap()
            .retain(|_, queue| !queue.is_closed());
    }

    pub fn len(&self) -> usize {
        self.queues.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().unwrap().is_empty()
    }
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> CommandHandler {
        CommandHandler::new(42, None, SocksConfig::default(), false)
    }

    #[tokio::test]
    async fn retry_replays_identical_fragment() {
        let (session, mut channels) = Session::open(7, 42, 8);
        let retained = Datagram::new(42, 7, 3, Command::Forward, vec![0xAB]);
        session.record_history(std::slice::from_ref(&retained));

        let request = Datagram::new(
            999,
            7,
            0,
            Command::Retry,
            RetryPayload { number: 3 }.encode(),
        );
        handler().handle(&session, &request).await.unwrap();

        assert_eq!(channels.datagrams.recv().await.unwrap(), retained);
    }

    #[tokio::test]
    async fn retry_miss_is_not_an_error() {
        let (session, mut channels) = Session::open(7, 42, 8);

        let request = Datagram::new(
            999,
            7,
            0,
            Command::Retry,
            RetryPayload { number: 9 }.encode(),
        );
        handler().handle(&session, &request).await.unwrap();

        assert!(channels.datagrams.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_without_peer_fails() {
        let (session, _channels) = Session::open(7, 42, 8);

        let dg = Datagram::new(999, 7, 2, Command::Forward, vec![1]);
        let err = handler().handle(&session, &dg).await.unwrap_err();

        assert!(matches!(
            err,
            HandlerError::Session(SessionError::NoPeer)
        ));
    }

    #[tokio::test]
    async fn unknown_command_is_unsupported() {
        let (session, _channels) = Session::open(7, 42, 8);

        let dg = Datagram::new(999, 7, 1, Command::Other(77), Vec::new());
        let err = handler().handle(&session, &dg).await.unwrap_err();

        assert!(matches!(err, HandlerError::Unsupported(77)));
    }

    #[tokio::test]
    async fn close_is_applied() {
        let (session, _channels) = Session::open(7, 42, 8);

        let dg = Datagram::new(999, 7, 1, Command::Close, Vec::new());
        handler().handle(&session, &dg).await.unwrap();

        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn queue_table_reuses_and_cleans() {
        let table = QueueTable::new();
        let (session, _channels) = Session::open(7, 42, 8);
        let handler = Arc::new(handler());

        let first = table.get_or_open(&session, handler.clone());
        let second = table.get_or_open(&session, handler.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);

        session.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        table.remove_closed();
        assert!(table.is_empty());
    }
}
