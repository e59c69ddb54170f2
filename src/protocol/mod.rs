// src/protocol/mod.rs — Persistent IRC connection to the chat relay
//
// One exclusive connection per process. A background reader task decodes
// inbound lines, answers keep-alive probes on the spot, and hands chat
// messages to the collector over an mpsc channel. The collector never shares
// session state with the reader; the channel is the only seam between them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::infra::config::{normalize_channel, IrcConfig, IrcCredentials};
use crate::infra::errors::CollectorError;

pub mod parse;

pub use parse::{ChatEvent, WireEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Connection lifecycle. Terminal on close or unrecoverable read error;
/// reconnect policy belongs to process supervision, not this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the collector needs from the chat side: join/part rooms, disconnect.
/// Abstracted so tests can drive the reconcile loop with a recording mock.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn join(&self, channel: &str) -> Result<(), CollectorError>;
    async fn part(&self, channel: &str) -> Result<(), CollectorError>;
    async fn close(&self);
}

trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

type Transport = Box<dyn Conn>;
type Writer = Arc<Mutex<Option<WriteHalf<Transport>>>>;

pub struct IrcClient {
    writer: Writer,
    state: Arc<StdMutex<ConnectionState>>,
    joined: StdMutex<HashSet<String>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl IrcClient {
    /// Connect, authenticate, request message tags, and start the background
    /// reader. Chat events arrive on `events`; if the receiver is dropped the
    /// reader stops.
    pub async fn connect(
        cfg: &IrcConfig,
        creds: &IrcCredentials,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<Self, CollectorError> {
        let state = Arc::new(StdMutex::new(ConnectionState::Connecting));
        tracing::info!(server = %cfg.server, port = cfg.port, tls = cfg.use_tls, "connecting to chat relay");

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((cfg.server.as_str(), cfg.port)),
        )
        .await
        .map_err(|_| {
            CollectorError::Protocol(format!("connect to {}:{} timed out", cfg.server, cfg.port))
        })?
        .map_err(|e| {
            CollectorError::Protocol(format!("connect to {}:{}: {e}", cfg.server, cfg.port))
        })?;

        let transport: Transport = if cfg.use_tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let name = ServerName::try_from(cfg.server.clone())
                .map_err(|e| CollectorError::Protocol(format!("bad server name: {e}")))?;
            Box::new(connector.connect(name, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let writer: Writer = Arc::new(Mutex::new(Some(write_half)));

        // Auth handshake + capability request, before the reader starts.
        send_line(&writer, &format!("PASS {}", creds.oauth)).await?;
        send_line(&writer, &format!("NICK {}", creds.nick)).await?;
        send_line(
            &writer,
            "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership",
        )
        .await?;

        set_state(&state, ConnectionState::Connected);

        let reader_task = tokio::spawn(read_loop(
            BufReader::new(read_half),
            writer.clone(),
            state.clone(),
            events,
        ));

        Ok(Self {
            writer,
            state,
            joined: StdMutex::new(HashSet::new()),
            reader_task: StdMutex::new(Some(reader_task)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn mark_joined(&self, channel: &str) -> bool {
        match self.joined.lock() {
            Ok(mut joined) => joined.insert(channel.to_string()),
            Err(_) => false,
        }
    }

    fn mark_parted(&self, channel: &str) -> bool {
        match self.joined.lock() {
            Ok(mut joined) => joined.remove(channel),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ChatTransport for IrcClient {
    /// Idempotent: a channel already joined is a no-op.
    async fn join(&self, channel: &str) -> Result<(), CollectorError> {
        let channel = normalize_channel(channel);
        if channel.is_empty() || !self.mark_joined(&channel) {
            return Ok(());
        }
        if let Err(e) = send_line(&self.writer, &format!("JOIN #{channel}")).await {
            self.mark_parted(&channel);
            return Err(e);
        }
        Ok(())
    }

    /// Idempotent: parting a channel that was never joined is a no-op.
    async fn part(&self, channel: &str) -> Result<(), CollectorError> {
        let channel = normalize_channel(channel);
        if channel.is_empty() || !self.mark_parted(&channel) {
            return Ok(());
        }
        send_line(&self.writer, &format!("PART #{channel}")).await
    }

    /// Graceful quit, best-effort. Safe to call after the connection died.
    async fn close(&self) {
        let _ = send_line(&self.writer, "QUIT").await;
        *self.writer.lock().await = None;

        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        set_state(&self.state, ConnectionState::Disconnected);
        tracing::info!("chat relay connection closed");
    }
}

/// Write one CRLF-terminated line. The async mutex serializes writers: the
/// keep-alive responder and join/part calls share the single connection.
async fn send_line(writer: &Writer, line: &str) -> Result<(), CollectorError> {
    let mut guard = writer.lock().await;
    let w = guard.as_mut().ok_or(CollectorError::Disconnected)?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}

/// Background reader: decode each line, answer PINGs immediately, forward
/// chat events. EOF and socket errors end the loop and mark the connection
/// disconnected; nothing in here can panic the task over one bad line.
async fn read_loop(
    mut reader: BufReader<ReadHalf<Transport>>,
    writer: Writer,
    state: Arc<StdMutex<ConnectionState>>,
    events: mpsc::Sender<ChatEvent>,
) {
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => {
                tracing::warn!("chat relay closed the connection");
                break;
            }
            Ok(_) => match parse::parse_line(&buf) {
                WireEvent::Ping { payload } => {
                    // The reply must precede any other queued write; sending
                    // from here under the writer lock guarantees that.
                    if let Err(e) = send_line(&writer, &format!("PONG :{payload}")).await {
                        tracing::warn!("failed to answer keep-alive: {e}");
                        break;
                    }
                }
                WireEvent::Chat(evt) => {
                    if events.send(evt).await.is_err() {
                        // Collector is gone; we are shutting down.
                        break;
                    }
                }
                WireEvent::Ignored => {}
            },
            Err(e) => {
                tracing::warn!("chat relay read error: {e}");
                break;
            }
        }
    }

    set_state(&state, ConnectionState::Disconnected);
    tracing::info!("chat relay reader stopped");
}

fn set_state(state: &Arc<StdMutex<ConnectionState>>, value: ConnectionState) {
    if let Ok(mut s) = state.lock() {
        *s = value;
    }
}
