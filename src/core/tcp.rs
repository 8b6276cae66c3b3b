use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
    time::Duration,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    time::Instant,
};

use super::{shutdown::ShutdownToken, RESTART_DELAY};
use crate::{
    api::config::TcpConfig,
    protocol::{
        frame::{encode_tcp_reply, MbapHeader, MBAP_HEADER_LEN},
        respond, RegisterMap, Request, TransportKind,
    },
};

const LISTEN_BACKLOG: u32 = 50;
/// Pause before accepting again after a failed `accept()`, e.g. on EMFILE.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of incoming client connections.
trait Incoming {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>>;
}

impl Incoming for TcpListener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

/// Modbus/TCP slave: one listener and any number of client sessions, all
/// driven by a single task that owns the register map.
pub struct TcpRuntime {
    config: TcpConfig,
    shutdown: ShutdownToken,
    registers: Option<RegisterMap>,
}

impl TcpRuntime {
    pub fn new(config: TcpConfig, shutdown: ShutdownToken) -> Self {
        let registers = RegisterMap::try_new()
            .map_err(|err| log::error!("TCP register map allocation failed: {err}"))
            .ok();
        Self {
            config,
            shutdown,
            registers,
        }
    }

    /// Serve until the shutdown token fires, re-creating the listener
    /// after every setup failure.
    pub async fn run(mut self) {
        log::info!(
            "TCP server started on {}:{}",
            self.config.address,
            self.config.port
        );

        while !self.shutdown.is_cancelled() {
            let listener = match bind_listener(&self.config).await {
                Ok(listener) => listener,
                Err(err) => {
                    log::error!(
                        "Failed socket listening on {}:{}: {err}. Retry in {} seconds",
                        self.config.address,
                        self.config.port,
                        RESTART_DELAY.as_secs()
                    );
                    if self.shutdown.sleep(RESTART_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            match listener.local_addr() {
                Ok(local) => log::info!("Listening for Modbus/TCP clients on {local}"),
                Err(_) => log::info!("Listening for Modbus/TCP clients"),
            }

            self.serve(listener).await;
        }

        log::info!("TCP server stopped");
    }

    /// Readiness loop over the listener and every open session.
    ///
    /// Returns on shutdown. Dropping the session set closes every client
    /// socket along with the listener. A failed `accept()` only pauses
    /// accepting for a moment; established sessions keep being served.
    async fn serve<L: Incoming>(&mut self, listener: L) {
        let shutdown = self.shutdown.clone();
        let registers = &mut self.registers;
        let mut sessions: FuturesUnordered<SessionTurn> = FuturesUnordered::new();
        let mut backoff = std::pin::pin!(tokio::time::sleep(Duration::ZERO));
        let mut accepting = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Closing {} TCP session(s)", sessions.len());
                    return;
                }
                accepted = std::future::poll_fn(|cx| listener.poll_accept(cx)), if accepting => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(err) = stream.set_nodelay(true) {
                                log::debug!("Cannot disable Nagle on {peer}: {err}");
                            }
                            log::debug!("New connection from {peer}");
                            sessions.push(exchange(Session { stream, peer }, None).boxed());
                        }
                        Err(err) => {
                            log::warn!(
                                "Failed to accept a TCP client: {err} ({} session(s) kept)",
                                sessions.len()
                            );
                            accepting = false;
                            backoff.as_mut().reset(Instant::now() + ACCEPT_BACKOFF);
                        }
                    }
                }
                _ = &mut backoff, if !accepting => {
                    accepting = true;
                }
                Some((session, received)) = sessions.next(), if !sessions.is_empty() => {
                    match received {
                        Ok(frame) => {
                            let reply = answer(&frame, registers.as_mut());
                            sessions.push(exchange(session, Some(reply)).boxed());
                        }
                        Err(ReceiveError::Closed) => {
                            log::debug!("Connection closed by {}", session.peer);
                        }
                        Err(err) => {
                            log::warn!("Dropping connection from {}: {err}", session.peer);
                        }
                    }
                }
            }
        }
    }
}

/// Bind the configured address with `SO_REUSEADDR` so a stopped server's
/// port can be taken again immediately.
pub async fn bind_listener(config: &TcpConfig) -> io::Result<TcpListener> {
    let host = config.bind_host();
    let addr = tokio::net::lookup_host((host, config.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host} does not resolve to any address"),
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

struct Session {
    stream: TcpStream,
    peer: SocketAddr,
}

type SessionTurn = BoxFuture<'static, (Session, Result<Frame, ReceiveError>)>;

struct Frame {
    header: MbapHeader,
    adu: Vec<u8>,
}

#[derive(Debug)]
enum ReceiveError {
    Closed,
    Malformed(u16),
    Io(io::Error),
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::Closed => write!(f, "connection closed"),
            ReceiveError::Malformed(length) => {
                write!(f, "malformed MBAP header (length {length})")
            }
            ReceiveError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for ReceiveError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ReceiveError::Closed,
            _ => ReceiveError::Io(err),
        }
    }
}

/// One turn of a session: flush the pending reply, then wait for the next
/// query. The session travels with the result so the loop can requeue it.
async fn exchange(
    mut session: Session,
    reply: Option<Vec<u8>>,
) -> (Session, Result<Frame, ReceiveError>) {
    let received = round_trip(&mut session.stream, reply).await;
    (session, received)
}

async fn round_trip(
    stream: &mut TcpStream,
    reply: Option<Vec<u8>>,
) -> Result<Frame, ReceiveError> {
    if let Some(reply) = reply {
        stream.write_all(&reply).await?;
    }
    read_frame(stream).await
}

async fn read_frame(stream: &mut TcpStream) -> Result<Frame, ReceiveError> {
    let mut raw_header = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut raw_header).await?;

    let header = MbapHeader::parse(&raw_header);
    let pdu_len = header
        .pdu_len()
        .ok_or(ReceiveError::Malformed(header.length))?;

    let mut adu = vec![0u8; MBAP_HEADER_LEN + pdu_len];
    adu[..MBAP_HEADER_LEN].copy_from_slice(&raw_header);
    stream.read_exact(&mut adu[MBAP_HEADER_LEN..]).await?;

    Ok(Frame { header, adu })
}

fn answer(frame: &Frame, registers: Option<&mut RegisterMap>) -> Vec<u8> {
    let request = Request::new(&frame.adu, TransportKind::Tcp);
    let pdu = respond(&request, registers);
    encode_tcp_reply(&frame.header, &pdu)
}
