use std::{fmt, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    protocol::{self, HandshakeError, LineChannel, LineReader, parse_handshake},
    registry::{SharedWriter, UserRegistry, shared_writer},
};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// A session that stays silent this long is disconnected.
    pub idle_timeout: Duration,
    /// Upper bound on a single write to one recipient.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<UserRegistry<OwnedWriteHalf>>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(UserRegistry::new(config.write_timeout)),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then aborts every
    /// session still running.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(active = sessions.len(), "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, config, &mut sessions);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "session task failed");
                    }
                }
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<UserRegistry<OwnedWriteHalf>>,
    config: ServerConfig,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "accepted connection");
            let registry = Arc::clone(registry);
            sessions.spawn(async move {
                let (reader, writer) = LineChannel::from_tcp(stream).into_split();
                let session = ConnectionSession::new(registry, config);
                let outcome = session.run(reader, shared_writer(writer)).await;
                debug!(%peer, ?outcome, "connection finished");
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Active { username: String },
    Closed,
}

/// Why an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    PeerClosed,
    IdleTimeout,
    TransportError,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::PeerClosed => write!(f, "peer closed the connection"),
            Disconnect::IdleTimeout => write!(f, "idle timeout"),
            Disconnect::TransportError => write!(f, "transport error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The handshake was missing or malformed; nothing was broadcast.
    Rejected,
    Left {
        username: String,
        reason: Disconnect,
    },
}

/// One connection from handshake to teardown.
pub struct ConnectionSession<W> {
    registry: Arc<UserRegistry<W>>,
    config: ServerConfig,
    state: SessionState,
    join_notice: Option<JoinHandle<()>>,
}

impl<W> ConnectionSession<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(registry: Arc<UserRegistry<W>>, config: ServerConfig) -> Self {
        Self {
            registry,
            config,
            state: SessionState::AwaitingHandshake,
            join_notice: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn run<R>(
        mut self,
        mut reader: LineReader<R>,
        writer: SharedWriter<W>,
    ) -> SessionOutcome
    where
        R: AsyncBufRead + Unpin,
    {
        let username = match self.handshake(&mut reader).await {
            Some(username) => username,
            None => {
                self.transition(SessionState::Closed);
                if let Err(err) = writer.lock().await.close().await {
                    debug!(error = ?err, "failed to close rejected connection");
                }
                return SessionOutcome::Rejected;
            }
        };

        self.activate(&username, Arc::clone(&writer)).await;
        let reason = self.relay(&mut reader, &username).await;
        self.teardown(&username, reason).await;

        SessionOutcome::Left { username, reason }
    }

    async fn handshake<R>(&mut self, reader: &mut LineReader<R>) -> Option<String>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = match timeout(self.config.idle_timeout, reader.read_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                debug!(error = %HandshakeError::Closed, "dropping connection");
                return None;
            }
            Ok(Err(err)) => {
                warn!(error = ?err, "failed to read handshake");
                return None;
            }
            Err(_) => {
                warn!("timed out waiting for handshake");
                return None;
            }
        };

        match parse_handshake(&line) {
            Ok(username) => Some(username),
            Err(err) => {
                error!(error = %err, "invalid command from client, disconnecting");
                None
            }
        }
    }

    async fn activate(&mut self, username: &str, writer: SharedWriter<W>) {
        let online = self.registry.register(username, Arc::clone(&writer)).await;
        info!(%username, online, "user joined");

        if let Err(err) = writer.lock().await.write_line(&protocol::welcome(online)).await {
            // The relay loop will notice the dead connection on its next read.
            warn!(%username, error = ?err, "failed to send welcome");
        }

        let registry = Arc::clone(&self.registry);
        let notice = protocol::joined(username);
        self.join_notice = Some(tokio::spawn(async move {
            registry.broadcast(&notice).await;
        }));

        self.transition(SessionState::Active {
            username: username.to_string(),
        });
    }

    async fn relay<R>(&mut self, reader: &mut LineReader<R>, username: &str) -> Disconnect
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match timeout(self.config.idle_timeout, reader.read_line()).await {
                Ok(Ok(Some(line))) => {
                    self.registry.broadcast(&protocol::chat(username, &line)).await;
                }
                Ok(Ok(None)) => return Disconnect::PeerClosed,
                Ok(Err(err)) => {
                    warn!(%username, error = ?err, "error reading from client");
                    return Disconnect::TransportError;
                }
                Err(_) => {
                    info!(%username, timeout = ?self.config.idle_timeout, "client idle, disconnecting");
                    return Disconnect::IdleTimeout;
                }
            }
        }
    }

    async fn teardown(&mut self, username: &str, reason: Disconnect) {
        // Let the join notice finish so no recipient is left holding half a
        // line; each of its writes is bounded by the write timeout.
        if let Some(notice) = self.join_notice.take() {
            if let Err(err) = notice.await {
                warn!(%username, error = ?err, "join notice task failed");
            }
        }

        info!(%username, %reason, "user left");
        self.registry.broadcast(&protocol::left(username)).await;
        self.registry.deregister(username).await;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }
}

impl<W> Drop for ConnectionSession<W> {
    fn drop(&mut self) {
        if let Some(notice) = self.join_notice.take() {
            notice.abort();
        }
    }
}
