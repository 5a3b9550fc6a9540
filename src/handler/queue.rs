//! Per-session inbound reorder queue.
//!
//! Carriers deliver datagrams late, duplicated and out of order. The queue
//! stages arrivals, dispatches them strictly by sequence number, and probes
//! a persistent gap with RETRY frames. A gap surviving three consecutive
//! probes marks the session lost: CLOSE is sent to the peer and applied
//! locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::codec::{Command, Datagram, RetryPayload};
use crate::session::Session;

use super::CommandHandler;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

const MAX_PROBES: u32 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("queue is closed")]
pub struct QueueClosed;

struct State {
    staged: Vec<Datagram>,
    pending: HashMap<i32, Datagram>,
    next: i32,
    probe_at: i32,
    probes: u32,
}

pub struct HandlerQueue {
    session: Arc<Session>,
    state: Mutex<State>,
    signal: Notify,
    closed: AtomicBool,
}

impl HandlerQueue {
    pub fn open(session: Arc<Session>) -> Arc<Self> {
        tracing::debug!(ses = %session, "handler: queue open");

        Arc::new(Self {
            session,
            state: Mutex::new(State {
                staged: Vec::new(),
                pending: HashMap::new(),
                next: 1,
                probe_at: 0,
                probes: 0,
            }),
            signal: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        tracing::debug!(ses = %self.session, "handler: queue close");

        let mut state = self.state.lock().unwrap();
        state.staged.clear();
        state.pending.clear();

        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stage an arrival and wake the driver.
    pub fn add(&self, dg: Datagram) -> Result<(), QueueClosed> {
        if self.is_closed() {
            return Err(QueueClosed);
        }

        self.state.lock().unwrap().staged.push(dg);
        self.signal.notify_one();

        Ok(())
    }

    /// Driver loop: dispatch in order on arrivals, probe the gap on the
    /// retry timer, leave on session close.
    pub async fn run(self: Arc<Self>, handler: Arc<CommandHandler>) {
        loop {
            let closed = self.session.closed();
            let stop = tokio::select! {
                _ = self.signal.notified() => self.drain(&handler).await,
                _ = tokio::time::sleep(RETRY_INTERVAL) => self.probe(),
                _ = closed.cancelled() => {
                    self.close();
                    return;
                }
            };

            if stop {
                self.send_control(Command::Close, Vec::new());
                self.session.close().await;
                self.close();
                return;
            }
        }
    }

    /// Move staged arrivals into the pending map and dispatch every
    /// consecutive datagram starting at `next`. A dispatch error stops the
    /// queue.
    async fn drain(&self, handler: &CommandHandler) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            let staged = std::mem::take(&mut state.staged);

            for dg in staged {
                state.pending.insert(dg.number, dg);
            }
        }

        loop {
            let dg = {
                let mut state = self.state.lock().unwrap();
                let next = state.next;
                state.pending.remove(&next)
            };

            let Some(dg) = dg else {
                return false;
            };

            if let Err(err) = handler.handle(&self.session, &dg).await {
                tracing::error!(dg = %dg, err = %err, "handler: command");
                return true;
            }

            self.state.lock().unwrap().next += 1;
        }
    }

    /// Retry-timer tick. Emits RETRY for the missing number unless it is
    /// already staged; the third consecutive probe of the same gap gives
    /// the session up.
    fn probe(&self) -> bool {
        let next = {
            let mut state = self.state.lock().unwrap();
            let next = state.next;

            if state.pending.contains_key(&next) {
                return false;
            }

            if state.staged.iter().any(|dg| dg.number == next) {
                return false;
            }

            if next == state.probe_at {
                state.probes += 1;

                if state.probes >= MAX_PROBES {
                    return true;
                }
            } else {
                state.probe_at = next;
                state.probes = 1;
            }

            next
        };

        let payload = RetryPayload { number: next }.encode();
        self.send_control(Command::Retry, payload);

        false
    }

    fn send_control(&self, command: Command, payload: Vec<u8>) {
        let dg = Datagram::new(self.session.device(), 0, 0, command, payload);

        if let Err(err) = self.session.send_datagram(dg) {
            tracing::error!(ses = %self.session, cmd = %command, err = %err, "handler: send");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RetryPayload;
    use crate::config::SocksConfig;
    use crate::session::SessionChannels;

    fn forward(number: i32, payload: &[u8]) -> Datagram {
        Datagram::new(999, 7, number, Command::Forward, payload.to_vec())
    }

    async fn setup() -> (
        Arc<Session>,
        SessionChannels,
        Arc<HandlerQueue>,
        tokio::io::DuplexStream,
    ) {
        let (session, channels) = Session::open(7, 42, 32);

        let (local, remote) = tokio::io::duplex(4096);
        let (_read, write) = tokio::io::split(remote);
        session.set_peer(Box::new(write)).await;

        let queue = HandlerQueue::open(session.clone());

        (session, channels, queue, local)
    }

    fn spawn_driver(queue: &Arc<HandlerQueue>) {
        let handler = Arc::new(CommandHandler::new(
            42,
            None,
            SocksConfig::default(),
            false,
        ));
        tokio::spawn(queue.clone().run(handler));
    }

    #[tokio::test(start_paused = true)]
    async fn reordered_arrivals_deliver_in_order() {
        let (session, mut channels, queue, local) = setup().await;
        spawn_driver(&queue);
        tokio::spawn(
            session
                .clone()
                .run_writes(channels.writes, SocksConfig::default(), false),
        );

        queue.add(forward(3, b"C")).unwrap();
        queue.add(forward(1, b"A")).unwrap();
        queue.add(forward(2, b"B")).unwrap();

        let (mut read, _write) = tokio::io::split(local);
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut read, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"ABC");

        // No gap was ever probed, so no RETRY went out.
        assert!(channels.datagrams.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn gap_is_probed_then_session_closed() {
        let (session, mut channels, queue, _local) = setup().await;
        spawn_driver(&queue);

        queue.add(forward(1, b"A")).unwrap();
        queue.add(forward(3, b"C")).unwrap();

        // First retry interval: probe for the missing number 2.
        tokio::time::sleep(RETRY_INTERVAL + Duration::from_millis(100)).await;

        let probe = channels.datagrams.recv().await.unwrap();
        assert_eq!(probe.command, Command::Retry);
        assert_eq!(RetryPayload::decode(&probe.payload).unwrap().number, 2);

        // Second probe.
        tokio::time::sleep(RETRY_INTERVAL + Duration::from_millis(100)).await;
        let probe = channels.datagrams.recv().await.unwrap();
        assert_eq!(probe.command, Command::Retry);

        // Third consecutive probe gives up: CLOSE is sent and applied.
        tokio::time::sleep(RETRY_INTERVAL + Duration::from_millis(100)).await;
        let close = channels.datagrams.recv().await.unwrap();
        assert_eq!(close.command, Command::Close);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_closed());
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_probes_the_expected_number() {
        let (_session, mut channels, queue, _local) = setup().await;
        spawn_driver(&queue);

        tokio::time::sleep(RETRY_INTERVAL + Duration::from_millis(100)).await;

        let probe = channels.datagrams.recv().await.unwrap();
        assert_eq!(probe.command, Command::Retry);
        assert_eq!(RetryPayload::decode(&probe.payload).unwrap().number, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_applies_locally_without_notify() {
        let (session, mut channels, queue, _local) = setup().await;
        spawn_driver(&queue);

        queue
            .add(Datagram::new(999, 7, 1, Command::Close, Vec::new()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.is_closed());
        assert!(channels.datagrams.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_closes_with_notify() {
        let (session, mut channels, queue, _local) = setup().await;
        spawn_driver(&queue);

        queue
            .add(Datagram::new(999, 7, 1, Command::Other(42), Vec::new()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let close = channels.datagrams.recv().await.unwrap();
        assert_eq!(close.command, Command::Close);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closed_queue_rejects_arrivals() {
        let (_session, _channels, queue, _local) = setup().await;

        queue.close();

        assert_eq!(queue.add(forward(1, b"A")), Err(QueueClosed));
    }
}
