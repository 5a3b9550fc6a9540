//! SOCKS front end and peer forwarding.
//!
//! The accepting side speaks SOCKS5 (no auth) and SOCKS4/4a (CONNECT only).
//! Parsing is incremental: stages accumulate bytes and recognise short
//! input explicitly instead of failing on it. Once a stream reaches the
//! forward stage, reads are batched for an interval and chopped into
//! bounded FORWARD datagrams, turning bursty socket traffic into a
//! predictable number of carrier calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::codec::{Command, ConnectPayload, Datagram};
use crate::config::SocksConfig;
use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::session::{Session, SessionError};

const SOCKS5_VER: u8 = 0x05;
const SOCKS4_VER: u8 = 0x04;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPT: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const V4_GRANTED: u8 = 0x5A;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unacceptable")]
    Unacceptable,

    #[error("unsupported")]
    Unsupported,

    #[error("partial read")]
    PartialRead,

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("connect payload: {0}")]
    Crypto(#[from] CryptoError),

    #[error("forward: {0}")]
    Forward(String),
}

/// A parse failure plus the reply owed to the peer before hanging up.
#[derive(Debug)]
pub struct SocksFailure {
    pub reply: Option<Vec<u8>>,
    pub error: SocksError,
}

impl SocksFailure {
    fn new(reply: Option<Vec<u8>>, error: SocksError) -> Self {
        Self { reply, error }
    }

    fn partial() -> Self {
        Self::new(None, SocksError::PartialRead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    ConnectV5,
    ConnectV4,
    Forward,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SocksEvent {
    /// Bytes owed to the local peer.
    Reply(Vec<u8>),

    /// A parsed CONNECT; the reply goes out after the tunnel CONNECT is
    /// on its way.
    Connect {
        host: String,
        port: u16,
        reply: Vec<u8>,
    },

    /// Application bytes for the forward batcher.
    Data(Vec<u8>),
}

/// Incremental SOCKS parser. Feed raw reads, act on the returned events;
/// bytes of half-received messages stay buffered across calls.
pub struct SocksMachine {
    stage: Stage,
    buf: Vec<u8>,
}

impl SocksMachine {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            buf: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<SocksEvent>, SocksFailure> {
        self.buf.extend_from_slice(input);

        let mut events = Vec::new();

        while !self.buf.is_empty() {
            let step = match self.stage {
                Stage::Handshake => self.step_handshake(),
                Stage::ConnectV5 => self.step_connect(parse_connect_v5),
                Stage::ConnectV4 => self.step_connect(parse_connect_v4),
                Stage::Forward => {
                    events.push(SocksEvent::Data(std::mem::take(&mut self.buf)));
                    break;
                }
            };

            match step {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(failure) if matches!(failure.error, SocksError::PartialRead) => break,
                Err(failure) => return Err(failure),
            }
        }

        Ok(events)
    }

    fn step_handshake(&mut self) -> Result<Option<SocksEvent>, SocksFailure> {
        match self.buf[0] {
            // SOCKS4 has no method negotiation; the first message is the
            // CONNECT itself.
            SOCKS4_VER => {
                self.stage = Stage::ConnectV4;
                Ok(None)
            }
            SOCKS5_VER => {
                if self.buf.len() < 2 {
                    return Err(SocksFailure::partial());
                }

                let nmethods = self.buf[1] as usize;

                if self.buf.len() < 2 + nmethods {
                    return Err(SocksFailure::partial());
                }

                let methods = &self.buf[2..2 + nmethods];

                if !methods.contains(&METHOD_NO_AUTH) {
                    return Err(SocksFailure::new(
                        Some(vec![SOCKS5_VER, METHOD_NO_ACCEPT]),
                        SocksError::Unsupported,
                    ));
                }

                self.buf.drain(..2 + nmethods);
                self.stage = Stage::ConnectV5;

                Ok(Some(SocksEvent::Reply(vec![SOCKS5_VER, METHOD_NO_AUTH])))
            }
            _ => Err(SocksFailure::new(None, SocksError::Unacceptable)),
        }
    }

    fn step_connect(
        &mut self,
        parse: fn(&[u8]) -> Result<ConnectRequest, SocksFailure>,
    ) -> Result<Option<SocksEvent>, SocksFailure> {
        let request = parse(&self.buf)?;

        self.buf.drain(..request.consumed);
        self.stage = Stage::Forward;

        Ok(Some(SocksEvent::Connect {
            host: request.host,
            port: request.port,
            reply: request.reply,
        }))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub reply: Vec<u8>,
    pub consumed: usize,
}

/// SOCKS5 CONNECT: `VER CMD RSV ATYP addr port`. The reply is the request
/// itself with the command byte zeroed.
pub fn parse_connect_v5(buf: &[u8]) -> Result<ConnectRequest, SocksFailure> {
    if buf[0] != SOCKS5_VER {
        return Err(SocksFailure::new(None, SocksError::Unacceptable));
    }

    if buf.len() < 5 {
        return Err(SocksFailure::partial());
    }

    if buf[1] != CMD_CONNECT {
        return Err(SocksFailure::new(None, SocksError::Unsupported));
    }

    let (naddr, offset) = match buf[3] {
        ATYP_IPV4 => (4, 4),
        ATYP_DOMAIN => (buf[4] as usize, 5),
        ATYP_IPV6 => (16, 4),
        _ => return Err(SocksFailure::new(None, SocksError::Unsupported)),
    };

    let consumed = offset + naddr + 2;

    if buf.len() < consumed {
        return Err(SocksFailure::partial());
    }

    let addr = &buf[offset..offset + naddr];

    let host = match buf[3] {
        ATYP_DOMAIN => String::from_utf8_lossy(addr).into_owned(),
        ATYP_IPV4 => {
            let octets: [u8; 4] = addr.try_into().unwrap();
            std::net::Ipv4Addr::from(octets).to_string()
        }
        _ => {
            let octets: [u8; 16] = addr.try_into().unwrap();
            std::net::Ipv6Addr::from(octets).to_string()
        }
    };

    let port = u16::from_be_bytes([buf[offset + naddr], buf[offset + naddr + 1]]);

    let mut reply = buf[..consumed].to_vec();
    reply[1] = 0x00;

    Ok(ConnectRequest {
        host,
        port,
        reply,
        consumed,
    })
}

/// SOCKS4 CONNECT: `VN CD port ip user\0`, plus a trailing `hostname\0`
/// when the ip is 0.0.0.X (the 4a extension). Reply: `0x00 0x5A port ip`.
pub fn parse_connect_v4(buf: &[u8]) -> Result<ConnectRequest, SocksFailure> {
    if buf[0] != SOCKS4_VER {
        return Err(SocksFailure::new(None, SocksError::Unacceptable));
    }

    if buf.len() < 9 {
        return Err(SocksFailure::partial());
    }

    if buf[1] != CMD_CONNECT {
        return Err(SocksFailure::new(None, SocksError::Unsupported));
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = [buf[4], buf[5], buf[6], buf[7]];

    let user_end = match buf[8..].iter().position(|&b| b == 0) {
        Some(pos) => 8 + pos,
        None => return Err(SocksFailure::partial()),
    };

    let is_v4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    let (host, consumed) = if is_v4a {
        let host_start = user_end + 1;

        let host_end = match buf[host_start..].iter().position(|&b| b == 0) {
            Some(pos) => host_start + pos,
            None => return Err(SocksFailure::partial()),
        };

        let host = String::from_utf8_lossy(&buf[host_start..host_end]).into_owned();
        (host, host_end + 1)
    } else {
        (std::net::Ipv4Addr::from(ip).to_string(), user_end + 1)
    };

    let reply = vec![0x00, V4_GRANTED, buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]];

    Ok(ConnectRequest {
        host,
        port,
        reply,
        consumed,
    })
}

struct BatchState {
    data: Vec<u8>,
    failed: Option<String>,
}

/// Lock-guarded staging buffer between the read loop and the batcher.
struct BatchBuffer {
    state: Mutex<BatchState>,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            state: Mutex::new(BatchState {
                data: Vec::new(),
                failed: None,
            }),
        }
    }

    fn push(&self, bytes: &[u8]) -> Result<(), SocksError> {
        let mut state = self.state.lock().unwrap();

        if let Some(failed) = &state.failed {
            return Err(SocksError::Forward(failed.clone()));
        }

        state.data.extend_from_slice(bytes);

        Ok(())
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().data)
    }

    fn fail(&self, message: String) {
        self.state.lock().unwrap().failed = Some(message);
    }
}

/// One side's pump between a local socket and the tunnel: the read loop
/// drives the SOCKS stages, the batcher converts buffered bytes into
/// numbered FORWARD datagrams.
pub struct PeerLoop {
    pub session: Arc<Session>,
    pub cfg: SocksConfig,
    pub log_payload: bool,
    pub device: i64,
    pub secret: Option<[u8; KEY_LEN]>,
}

impl PeerLoop {
    pub async fn run<R>(self, mut reader: R, stage: Stage)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tracing::debug!(ses = %self.session, ?stage, "socks: accepted");

        let batch = Arc::new(BatchBuffer::new());
        let done = CancellationToken::new();

        let batcher = tokio::spawn(run_batcher(
            self.session.clone(),
            batch.clone(),
            done.clone(),
            self.device,
            self.cfg.forward_interval(),
            self.cfg.forward_size,
        ));

        let result = self.read_loop(&mut reader, stage, &batch).await;

        // Flush what the batcher still holds before the CLOSE goes out.
        done.cancel();
        let _ = batcher.await;

        let close = Datagram::new(self.device, self.session.id(), 0, Command::Close, Vec::new());
        let _ = self.session.send_datagram(close);

        match result {
            Ok(()) => tracing::debug!(ses = %self.session, "socks: closed"),
            Err(err) => tracing::error!(ses = %self.session, err = %err, "socks: closed"),
        }

        self.session.close().await;
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        stage: Stage,
        batch: &BatchBuffer,
    ) -> Result<(), SocksError>
    where
        R: AsyncRead + Unpin,
    {
        let mut machine = SocksMachine::new(stage);
        let mut buf = vec![0u8; self.cfg.read_size];

        loop {
            let closed = self.session.closed();
            let n = tokio::select! {
                _ = closed.cancelled() => return Ok(()),
                read = tokio::time::timeout(self.cfg.read_timeout(), reader.read(&mut buf)) => {
                    match read {
                        Err(_) => return Err(SocksError::ReadTimeout),
                        Ok(result) => result?,
                    }
                }
            };

            if n == 0 {
                return Ok(());
            }

            tracing::debug!(ses = %self.session, len = n, "socks: read");

            if self.log_payload {
                tracing::debug!(ses = %self.session, payload = %hex::encode(&buf[..n]), "socks: payload");
            }

            let events = match machine.feed(&buf[..n]) {
                Ok(events) => events,
                Err(failure) => {
                    if let Some(reply) = failure.reply {
                        let _ = self.reply(&reply).await;
                    }

                    return Err(failure.error);
                }
            };

            for event in events {
                match event {
                    SocksEvent::Reply(out) => self.reply(&out).await?,
                    SocksEvent::Connect { host, port, reply } => {
                        self.start_connect(host, port)?;
                        self.reply(&reply).await?;
                    }
                    SocksEvent::Data(data) => batch.push(&data)?,
                }
            }
        }
    }

    /// Protocol replies go straight onto the socket under the write
    /// deadline; queueing them would let a close race the last reply out.
    async fn reply(&self, out: &[u8]) -> Result<(), SocksError> {
        if self.log_payload {
            tracing::debug!(ses = %self.session, payload = %hex::encode(out), "socks: payload");
        }

        self.session
            .write_peer_direct(out, self.cfg.write_timeout())
            .await?;

        Ok(())
    }

    /// Seal the target address and put the CONNECT on the tunnel. The
    /// sequence number is taken synchronously so no FORWARD can precede it.
    fn start_connect(&self, host: String, port: u16) -> Result<(), SocksError> {
        let payload = ConnectPayload { host, port }.encode();

        let payload = match &self.secret {
            Some(key) => crypto::encrypt(&payload, key)?,
            None => payload,
        };

        let dg = Datagram::new(self.device, self.session.id(), 0, Command::Connect, payload);
        self.session.send_datagram(dg)?;

        let _ = self.session.signal_connected();

        Ok(())
    }
}

async fn run_batcher(
    session: Arc<Session>,
    batch: Arc<BatchBuffer>,
    done: CancellationToken,
    device: i64,
    interval: Duration,
    chunk_size: usize,
) {
    loop {
        let stop = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = done.cancelled() => true,
        };

        let data = batch.take();

        if !data.is_empty() {
            tracing::debug!(ses = %session, len = data.len(), "socks: forward");

            for chunk in data.chunks(chunk_size) {
                let number = session.next_number();
                let dg = Datagram::new(device, session.id(), number, Command::Forward, chunk.to_vec());

                if let Err(err) = session.send_datagram(dg) {
                    tracing::error!(ses = %session, err = %err, "socks: forward");
                    batch.fail(err.to_string());
                    break;
                }
            }
        }

        if stop {
            return;
        }
    }
}
