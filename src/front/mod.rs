//! Front multiplexer (§4.4): bridges peer-session substreams to local TCP
//! sockets, on demand for the server role and via a persistent listener for
//! the client role.

mod substream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::connections::ConnectionRole as DescriptorRole;
use crate::error::{NetworkError, ProtocolError, WarrenError};
use crate::session::{ConnectionRole, SessionEvent, SessionManager};
use crate::tracker::TrackerClient;

#[derive(Debug, Clone)]
pub struct FrontConfig {
    pub connection_name: String,
    pub role: ConnectionRole,
    /// Server role: where to dial a local TCP client per incoming `OPEN`.
    pub connect_address: String,
    pub connect_port: u16,
    /// Client role: where to listen for local TCP clients.
    pub listen_address: String,
    pub listen_port: u16,
}

struct ActiveConnection {
    config: FrontConfig,
    session_id: Option<String>,
    next_substream_id: AtomicU32,
}

/// Owns every registered connection's TCP side: listeners for the client
/// role, on-demand dials for the server role, and the substream pumps
/// bridging each to its peer session.
pub struct FrontMultiplexer {
    session_manager: Arc<SessionManager>,
    tracker: Arc<TrackerClient>,
    connections: Mutex<HashMap<String, Arc<ActiveConnection>>>,
    substreams: Mutex<HashMap<(String, u32), mpsc::Sender<Option<Vec<u8>>>>>,
}

impl FrontMultiplexer {
    pub fn new(session_manager: Arc<SessionManager>, tracker: Arc<TrackerClient>) -> Arc<Self> {
        Arc::new(Self {
            session_manager,
            tracker,
            connections: Mutex::new(HashMap::new()),
            substreams: Mutex::new(HashMap::new()),
        })
    }

    /// Register a connection's front-end configuration. For the client
    /// role, immediately starts the persistent TCP listener; it survives
    /// across peer-session lifetimes.
    pub async fn register(self: &Arc<Self>, config: FrontConfig) -> Result<(), WarrenError> {
        let name = config.connection_name.clone();
        let active = Arc::new(ActiveConnection {
            config: config.clone(),
            session_id: None,
            next_substream_id: AtomicU32::new(1),
        });
        self.connections.lock().await.insert(name.clone(), active);

        if config.role == ConnectionRole::Client {
            self.clone().spawn_listener(config).await?;
        }
        Ok(())
    }

    pub async fn unregister(&self, connection_name: &str) {
        self.connections.lock().await.remove(connection_name);
    }

    /// The locally configured listen address/port for `connection_name`, if
    /// registered: what a peer should dial first when trying the internal
    /// path before falling back to the externally observed one.
    pub async fn local_listen_address(&self, connection_name: &str) -> Option<(String, u16)> {
        self.connections
            .lock()
            .await
            .get(connection_name)
            .map(|c| (c.config.listen_address.clone(), c.config.listen_port))
    }

    /// Whether `connection_name` currently has an established peer session.
    pub async fn is_established(&self, connection_name: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(connection_name)
            .map(|c| c.session_id.is_some())
            .unwrap_or(false)
    }

    /// Tell the tracker whether `connection_name` now has an established
    /// peer session, on every established/close transition (§4.5).
    async fn report_connected(&self, connection_name: &str, connected: bool) {
        let config = self.connections.lock().await.get(connection_name).map(|c| c.config.clone());
        let Some(config) = config else {
            return;
        };
        let role = match config.role {
            ConnectionRole::Server => DescriptorRole::Server,
            ConnectionRole::Client => DescriptorRole::Client,
        };
        self.tracker
            .report_status(connection_name, role, connected, &config.listen_address, config.listen_port)
            .await;
    }

    async fn spawn_listener(self: Arc<Self>, config: FrontConfig) -> Result<(), WarrenError> {
        let addr = format!("{}:{}", config.listen_address, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        info!(connection = %config.connection_name, %addr, "front listener bound");

        let multiplexer = self;
        tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "front listener accept failed");
                        continue;
                    }
                };
                multiplexer
                    .clone()
                    .handle_client_accept(config.connection_name.clone(), socket, peer)
                    .await;
            }
        });
        Ok(())
    }

    async fn handle_client_accept(
        self: Arc<Self>,
        connection_name: String,
        socket: TcpStream,
        peer: std::net::SocketAddr,
    ) {
        let session_id = {
            let connections = self.connections.lock().await;
            connections.get(&connection_name).and_then(|c| c.session_id.clone())
        };

        let Some(session_id) = session_id else {
            warn!(connection = %connection_name, %peer, "no established session, dropping local client");
            drop(socket);
            return;
        };

        let substream_id = {
            let connections = self.connections.lock().await;
            connections
                .get(&connection_name)
                .map(|c| c.next_substream_id.fetch_add(1, Ordering::Relaxed))
                .unwrap_or(0)
        };

        if let Err(e) = self
            .session_manager
            .send(&session_id, crate::session::open_substream(substream_id))
            .await
        {
            warn!(connection = %connection_name, substream_id, error = %e, "failed to open substream");
            return;
        }

        self.attach_substream(session_id, substream_id, socket).await;
    }

    async fn attach_substream(self: &Arc<Self>, session_id: String, substream_id: u32, socket: TcpStream) {
        let (tx, rx) = mpsc::channel(64);
        self.substreams.lock().await.insert((session_id.clone(), substream_id), tx);
        substream::spawn(self.session_manager.clone(), session_id, substream_id, socket, rx);
    }

    /// Drive a stream of `SessionEvent`s, dialing TCP for server-role
    /// incoming `OPEN`s, relaying `DATA`, and tearing down substreams on
    /// `CLOSE`/session death.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Established { session_id, connection_name } => {
                    let mut connections = self.connections.lock().await;
                    if let Some(active) = connections.get(&connection_name) {
                        let updated = Arc::new(ActiveConnection {
                            config: active.config.clone(),
                            session_id: Some(session_id),
                            next_substream_id: AtomicU32::new(
                                active.next_substream_id.load(Ordering::Relaxed),
                            ),
                        });
                        connections.insert(connection_name.clone(), updated);
                    }
                    drop(connections);
                    self.report_connected(&connection_name, true).await;
                }
                SessionEvent::SubstreamOpen { session_id, substream_id } => {
                    self.clone().handle_substream_open(session_id, substream_id).await;
                }
                SessionEvent::Data { session_id, substream_id, bytes } => {
                    let tx = self.substreams.lock().await.get(&(session_id, substream_id)).cloned();
                    if let Some(tx) = tx {
                        let _ = tx.send(Some(bytes)).await;
                    } else {
                        let err = ProtocolError::UnknownSubstream { id: substream_id };
                        warn!(substream_id, error = %err, "dropping data for unknown substream");
                    }
                }
                SessionEvent::SubstreamClose { session_id, substream_id } => {
                    let tx = self
                        .substreams
                        .lock()
                        .await
                        .remove(&(session_id, substream_id));
                    if let Some(tx) = tx {
                        let _ = tx.send(None).await;
                    }
                }
                SessionEvent::Close { session_id, connection_name } => {
                    let mut substreams = self.substreams.lock().await;
                    let dead: Vec<(String, u32)> = substreams
                        .keys()
                        .filter(|(sid, _)| *sid == session_id)
                        .cloned()
                        .collect();
                    for key in dead {
                        if let Some(tx) = substreams.remove(&key) {
                            let _ = tx.send(None).await;
                        }
                    }
                    drop(substreams);
                    self.report_connected(&connection_name, false).await;
                }
                _ => {}
            }
        }
    }

    async fn handle_substream_open(self: Arc<Self>, session_id: String, substream_id: u32) {
        let config = {
            let connections = self.connections.lock().await;
            connections
                .values()
                .find(|c| c.session_id.as_deref() == Some(session_id.as_str()))
                .map(|c| c.config.clone())
        };
        let Some(config) = config else {
            warn!(session_id, substream_id, "OPEN for unknown session, ignoring");
            return;
        };
        if config.role != ConnectionRole::Server {
            warn!(connection = %config.connection_name, "client-role connection received an OPEN, protocol violation");
            return;
        }

        if self.substreams.lock().await.contains_key(&(session_id.clone(), substream_id)) {
            let err = ProtocolError::DuplicateOpen { id: substream_id };
            warn!(connection = %config.connection_name, substream_id, error = %err, "duplicate OPEN, closing substream");
            let _ = self
                .session_manager
                .send(&session_id, crate::session::close_substream(substream_id))
                .await;
            return;
        }

        let addr = format!("{}:{}", config.connect_address, config.connect_port);
        match TcpStream::connect(&addr).await {
            Ok(socket) => {
                self.attach_substream(session_id, substream_id, socket).await;
            }
            Err(e) => {
                warn!(%addr, error = %e, "failed to dial local service for OPEN");
                let _ = self
                    .session_manager
                    .send(&session_id, crate::session::close_substream(substream_id))
                    .await;
            }
        }
    }
}
