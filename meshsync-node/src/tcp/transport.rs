//! [`MeshTransport`] over TCP streams.

use super::codec::{read_frame, write_frame, Frame, HelloFrame};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{Envelope, PROTOCOL_VERSION};
use crate::transport::{Binding, Connection, ConnectionEvent, LinkSink, MeshTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Socket address of each known transport identifier.
    pub directory: HashMap<String, SocketAddr>,
    /// How long an accepted stream may take to send its hello.
    pub hello_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            directory: HashMap::new(),
            hello_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConfig {
    /// Adds a directory entry.
    #[must_use]
    pub fn with_peer(mut self, transport_id: impl Into<String>, addr: SocketAddr) -> Self {
        self.directory.insert(transport_id.into(), addr);
        self
    }
}

struct Listening {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// TCP transport with a static address directory.
pub struct TcpTransport {
    directory: Mutex<HashMap<String, SocketAddr>>,
    hello_timeout: Duration,
    listeners: Mutex<HashMap<String, Listening>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            directory: Mutex::new(config.directory),
            hello_timeout: config.hello_timeout,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Adds or replaces a directory entry.
    pub fn register(&self, transport_id: impl Into<String>, addr: SocketAddr) {
        lock(&self.directory).insert(transport_id.into(), addr);
    }

    /// The address a bound identifier is actually listening on. Differs
    /// from the directory entry when that entry used port 0.
    pub fn local_addr(&self, transport_id: &str) -> Option<SocketAddr> {
        lock(&self.listeners).get(transport_id).map(|l| l.addr)
    }

    fn resolve(&self, transport_id: &str) -> Option<SocketAddr> {
        lock(&self.directory).get(transport_id).copied()
    }
}

#[async_trait]
impl MeshTransport for TcpTransport {
    async fn bind(&self, transport_id: &str) -> MeshResult<Binding> {
        if self.is_bound(transport_id) {
            return Err(MeshError::TransportBindFailed(format!(
                "{transport_id} is already bound"
            )));
        }
        let addr = self.resolve(transport_id).ok_or_else(|| {
            MeshError::TransportBindFailed(format!("no address for {transport_id}"))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::TransportBindFailed(format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::TransportBindFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(listener, tx, self.hello_timeout));

        let mut listeners = lock(&self.listeners);
        if listeners.get(transport_id).is_some_and(|l| !l.task.is_finished()) {
            task.abort();
            return Err(MeshError::TransportBindFailed(format!(
                "{transport_id} is already bound"
            )));
        }
        listeners.insert(
            transport_id.to_string(),
            Listening {
                addr: local_addr,
                task,
            },
        );
        drop(listeners);
        self.register(transport_id, local_addr);
        debug!("tcp transport bound {transport_id} on {local_addr}");

        Ok(Binding {
            local: transport_id.to_string(),
            incoming: rx,
        })
    }

    async fn dial(&self, local: &str, remote: &str) -> MeshResult<Connection> {
        let addr = self
            .resolve(remote)
            .ok_or_else(|| MeshError::Network(format!("no address for {remote}")))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Network(format!("connect to {remote} at {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let hello = Frame::Hello(HelloFrame {
            version: PROTOCOL_VERSION,
            from: local.to_string(),
        });
        write_frame(&mut stream, &hello)
            .await
            .map_err(|e| MeshError::Network(format!("hello to {remote}: {e}")))?;

        debug!("tcp connection to {remote} at {addr}");
        Ok(spawn_connection(stream, remote.to_string()))
    }

    fn unbind(&self, transport_id: &str) {
        if let Some(listening) = lock(&self.listeners).remove(transport_id) {
            listening.task.abort();
            debug!("tcp transport unbound {transport_id}");
        }
    }

    fn is_bound(&self, transport_id: &str) -> bool {
        lock(&self.listeners)
            .get(transport_id)
            .is_some_and(|l| !l.task.is_finished())
    }
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::UnboundedSender<Connection>,
    hello_timeout: Duration,
) {
    while !incoming.is_closed() {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tcp accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let incoming = incoming.clone();
        tokio::spawn(async move {
            match accept_connection(stream, hello_timeout).await {
                Ok(connection) => {
                    debug!("accepted {} from {peer_addr}", connection.remote);
                    let _ = incoming.send(connection);
                }
                Err(e) => warn!("rejected connection from {peer_addr}: {e}"),
            }
        });
    }
}

async fn accept_connection(
    mut stream: TcpStream,
    hello_timeout: Duration,
) -> MeshResult<Connection> {
    let frame = tokio::time::timeout(hello_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| MeshError::Protocol("timed out waiting for hello".into()))?
        .map_err(|e| MeshError::Network(e.to_string()))?;

    let hello = match frame {
        Frame::Hello(hello) => hello,
        Frame::Envelope(envelope) => {
            return Err(MeshError::Protocol(format!(
                "expected hello, got {}",
                envelope.kind()
            )));
        }
    };
    if hello.version != PROTOCOL_VERSION {
        return Err(MeshError::Protocol(format!(
            "unsupported protocol version {}",
            hello.version
        )));
    }
    let _ = stream.set_nodelay(true);
    Ok(spawn_connection(stream, hello.from))
}

enum SinkCommand {
    Send(Envelope),
    Close,
}

/// Splits a stream into a writer task fed by the sink and a reader task
/// feeding the event channel.
fn spawn_connection(stream: TcpStream, remote: String) -> Connection {
    let (reader, writer) = stream.into_split();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let _ = events_tx.send(ConnectionEvent::Opened);
    tokio::spawn(write_loop(writer, commands_rx, events_tx.clone()));
    tokio::spawn(read_loop(reader, events_tx));

    Connection {
        remote,
        sink: Box::new(TcpSink {
            commands: commands_tx,
            closed: AtomicBool::new(false),
        }),
        events: events_rx,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SinkCommand::Send(envelope) => {
                if let Err(e) = write_frame(&mut writer, &Frame::Envelope(envelope)).await {
                    let _ = events.send(ConnectionEvent::Error(format!("write failed: {e}")));
                    return;
                }
            }
            SinkCommand::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, events: mpsc::UnboundedSender<ConnectionEvent>) {
    loop {
        let event = match read_frame(&mut reader).await {
            Ok(Frame::Envelope(envelope)) => ConnectionEvent::Data(envelope),
            Ok(Frame::Hello(_)) => {
                let _ = events.send(ConnectionEvent::Error("unexpected hello mid-stream".into()));
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
            Err(e) => {
                let _ = events.send(ConnectionEvent::Error(e.to_string()));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

struct TcpSink {
    commands: mpsc::UnboundedSender<SinkCommand>,
    closed: AtomicBool,
}

impl LinkSink for TcpSink {
    fn send(&self, envelope: &Envelope) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::LinkClosed);
        }
        self.commands
            .send(SinkCommand::Send(envelope.clone()))
            .map_err(|_| MeshError::LinkClosed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(SinkCommand::Close);
        }
    }
}
