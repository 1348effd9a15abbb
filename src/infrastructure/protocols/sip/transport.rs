//! SIP listeners - the transport primitive the restart sequencer drives

use crate::domain::shared::{ReachError, Result, TransportId};
use crate::domain::transport::TransportKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Raw bytes received on a listener; SIP parsing happens above this layer
#[derive(Debug, Clone)]
pub struct IncomingData {
    pub transport: TransportId,
    pub source: SocketAddr,
    pub data: Bytes,
}

/// Create, rebind and shut down listeners.
///
/// Rebinding keeps the port and only swaps the socket; connections
/// already accepted by a recreated listener keep running.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListenerControl: Send + Sync {
    /// Bind a new listener, returning the bound address
    async fn create(&self, id: TransportId, kind: TransportKind, bind: SocketAddr) -> Result<SocketAddr>;

    /// Rebind a datagram socket in place
    async fn rebind_datagram(&self, id: TransportId, bind: SocketAddr) -> Result<SocketAddr>;

    /// Close and recreate a connection-oriented listener
    async fn recreate_listener(&self, id: TransportId, bind: SocketAddr) -> Result<SocketAddr>;

    /// Drop the connections of a connection-oriented transport so the
    /// next request opens a fresh one
    async fn shutdown(&self, id: TransportId) -> Result<()>;

    /// Close the listener for good
    async fn close(&self, id: TransportId) -> Result<()>;
}

enum Listener {
    Datagram {
        socket: Arc<UdpSocket>,
        recv_task: JoinHandle<()>,
    },
    Stream {
        local: SocketAddr,
        accept_task: JoinHandle<()>,
        connections: Arc<Mutex<Vec<AbortHandle>>>,
    },
}

impl Listener {
    fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Listener::Datagram { socket, .. } => Ok(socket.local_addr()?),
            Listener::Stream { local, .. } => Ok(*local),
        }
    }

    /// Stop receiving and wait until the socket is released, handing
    /// back the accepted connections of a stream listener
    async fn stop_listening(self) -> Option<Arc<Mutex<Vec<AbortHandle>>>> {
        match self {
            Listener::Datagram { socket, recv_task } => {
                recv_task.abort();
                let _ = recv_task.await;
                drop(socket);
                None
            }
            Listener::Stream {
                accept_task,
                connections,
                ..
            } => {
                accept_task.abort();
                let _ = accept_task.await;
                Some(connections)
            }
        }
    }

    fn drop_connections(&self) -> usize {
        match self {
            Listener::Datagram { .. } => 0,
            Listener::Stream { connections, .. } => {
                let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                let count = connections.len();
                for connection in connections.drain(..) {
                    connection.abort();
                }
                count
            }
        }
    }
}

/// UDP and TCP listeners on the tokio runtime.
///
/// TLS kinds are bound as TCP listeners; the handshake belongs to the
/// TLS layer above.
pub struct TokioListeners {
    listeners: tokio::sync::Mutex<HashMap<TransportId, Option<Listener>>>,
    tx: mpsc::Sender<IncomingData>,
    rx: Mutex<Option<mpsc::Receiver<IncomingData>>>,
}

impl TokioListeners {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Listeners whose incoming queue holds at most `capacity` items.
    ///
    /// When the queue is full, or nobody took the receiver, new data is
    /// dropped and the listeners keep reading.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Take the receiver for incoming data; only the first call gets it
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<IncomingData>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn bind_datagram(&self, id: TransportId, bind: SocketAddr) -> Result<Listener> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ReachError::Transport(format!("Failed to bind UDP socket {}: {}", bind, e)))?;
        let socket = Arc::new(socket);
        let recv_task = tokio::spawn(Self::receive_loop(id, socket.clone(), self.tx.clone()));
        Ok(Listener::Datagram { socket, recv_task })
    }

    async fn bind_stream(&self, id: TransportId, bind: SocketAddr) -> Result<Listener> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ReachError::Transport(format!("Failed to bind TCP socket {}: {}", bind, e)))?;
        let local = listener.local_addr()?;
        let connections = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(Self::accept_loop(id, listener, connections.clone(), self.tx.clone()));
        Ok(Listener::Stream {
            local,
            accept_task,
            connections,
        })
    }

    async fn receive_loop(id: TransportId, socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingData>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    Self::forward(&tx, IncomingData {
                        transport: id,
                        source,
                        data: Bytes::copy_from_slice(&buf[..size]),
                    });
                }
                Err(e) => {
                    error!("Failed to receive UDP packet on {}: {}", id, e);
                    break;
                }
            }
        }
    }

    async fn accept_loop(
        id: TransportId,
        listener: TcpListener,
        connections: Arc<Mutex<Vec<AbortHandle>>>,
        tx: mpsc::Sender<IncomingData>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {} on {}", source, id);
                    let task = tokio::spawn(Self::handle_connection(id, stream, source, tx.clone()));
                    let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                    connections.retain(|c| !c.is_finished());
                    connections.push(task.abort_handle());
                }
                Err(e) => {
                    error!("Failed to accept TCP connection on {}: {}", id, e);
                    break;
                }
            }
        }
    }

    async fn handle_connection(id: TransportId, mut stream: TcpStream, source: SocketAddr, tx: mpsc::Sender<IncomingData>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    debug!("TCP connection closed by {}", source);
                    break;
                }
                Ok(size) => {
                    Self::forward(&tx, IncomingData {
                        transport: id,
                        source,
                        data: Bytes::copy_from_slice(&buf[..size]),
                    });
                }
                Err(e) => {
                    warn!("Failed to read from TCP connection {}: {}", source, e);
                    break;
                }
            }
        }
    }

    fn forward(tx: &mpsc::Sender<IncomingData>, incoming: IncomingData) {
        match tx.try_send(incoming) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                debug!(
                    "Incoming queue full, dropping {} bytes from {} on {}",
                    dropped.data.len(),
                    dropped.source,
                    dropped.transport
                );
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                debug!("No consumer, dropping {} bytes from {}", dropped.data.len(), dropped.source);
            }
        }
    }

    /// Remove the old listener before binding so the port is free again.
    ///
    /// A failed bind leaves the slot empty and drops the accepted
    /// connections; a later retry fills the slot.
    async fn replace(&self, id: TransportId, bind: SocketAddr, datagram: bool) -> Result<SocketAddr> {
        let mut listeners = self.listeners.lock().await;
        let slot = listeners
            .get_mut(&id)
            .ok_or_else(|| ReachError::NotFound(format!("listener {}", id)))?;

        // Accepted connections are handed to the new listener untouched.
        let inherited = match slot.take() {
            Some(old) => old.stop_listening().await,
            None => None,
        };

        let bound = if datagram {
            self.bind_datagram(id, bind).await
        } else {
            self.bind_stream(id, bind).await
        };
        let mut listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                if let Some(previous) = inherited {
                    let mut previous = previous.lock().unwrap_or_else(|e| e.into_inner());
                    warn!("Rebind of {} failed, dropping {} connection(s)", id, previous.len());
                    for connection in previous.drain(..) {
                        connection.abort();
                    }
                }
                return Err(e);
            }
        };
        if let (Some(previous), Listener::Stream { connections, .. }) = (inherited, &mut listener) {
            let previous: Vec<AbortHandle> = previous.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
            connections.lock().unwrap_or_else(|e| e.into_inner()).extend(previous);
        }
        let local = listener.local_addr()?;
        *slot = Some(listener);
        Ok(local)
    }
}

impl Default for TokioListeners {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenerControl for TokioListeners {
    async fn create(&self, id: TransportId, kind: TransportKind, bind: SocketAddr) -> Result<SocketAddr> {
        info!("Starting {} transport {} on {}", kind.as_str(), id, bind);
        let listener = if kind.is_datagram() {
            self.bind_datagram(id, bind).await?
        } else {
            self.bind_stream(id, bind).await?
        };
        let local = listener.local_addr()?;
        info!("{} transport {} listening on {}", kind.as_str(), id, local);
        self.listeners.lock().await.insert(id, Some(listener));
        Ok(local)
    }

    async fn rebind_datagram(&self, id: TransportId, bind: SocketAddr) -> Result<SocketAddr> {
        let local = self.replace(id, bind, true).await?;
        info!("UDP transport {} rebound to {}", id, local);
        Ok(local)
    }

    async fn recreate_listener(&self, id: TransportId, bind: SocketAddr) -> Result<SocketAddr> {
        let local = self.replace(id, bind, false).await?;
        info!("Stream listener {} recreated on {}", id, local);
        Ok(local)
    }

    async fn shutdown(&self, id: TransportId) -> Result<()> {
        let listeners = self.listeners.lock().await;
        let slot = listeners
            .get(&id)
            .ok_or_else(|| ReachError::NotFound(format!("listener {}", id)))?;
        let dropped = slot.as_ref().map(Listener::drop_connections).unwrap_or(0);
        info!("Transport {} shut down, {} connection(s) dropped", id, dropped);
        Ok(())
    }

    async fn close(&self, id: TransportId) -> Result<()> {
        let removed = self.listeners.lock().await.remove(&id).flatten();
        if let Some(listener) = removed {
            listener.drop_connections();
            listener.stop_listening().await;
            info!("Transport {} closed", id);
        }
        Ok(())
    }
}
