//! Tracker client (§4.5): a framed, TLS-protected, reconnecting link to one
//! configured tracker, with `messageId` request/response correlation and
//! dispatch of server-initiated rendezvous events.

mod correlation;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::sink::SinkExt;
use futures::stream::StreamExt;
use rustls_pemfile::certs;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::LengthPrefixed;
use crate::config::TrackerConfig;
use crate::connections::{ConnectionDescriptor, ConnectionRole, ConnectionsList};
use crate::error::TrackerError;
use crate::proto::tracker::{
    client_message, server_message, AddressResponse, ClientMessage, ConnectionDescriptor as ProtoDescriptor,
    GenericKind, GenericRequest, GenericResponse, RegisterDaemonRequest, ResponseStatus, ServerMessage,
    StatusReport,
};

pub use correlation::Correlator;

/// T4: how long a single tracker request waits for its correlated response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_STEPS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];
const STEADY_STATE_BACKOFF: Duration = Duration::from_secs(16);

/// Server-initiated events dispatched to whatever subsystem wired itself up
/// to receive them (peer-session subsystem for rendezvous events,
/// supervisor for registration).
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Registered { daemon_name: String },
    ServerAvailable {
        path: String,
        internal_address: String,
        internal_port: u16,
        external_address: String,
        external_port: u16,
        server_identity: Vec<u8>,
        name: String,
    },
    PeerAvailable {
        path: String,
        internal_address: String,
        internal_port: u16,
        external_address: String,
        external_port: u16,
        peer_identity: Vec<u8>,
        name: String,
    },
    AddressRequest {
        path: String,
        requester_identity: Vec<u8>,
    },
    ConnectionRemoved { path: String },
}

type TlsRead = ReadHalf<TlsStream<TcpStream>>;
type TlsWrite = WriteHalf<TlsStream<TcpStream>>;

struct Link {
    writer: FramedWrite<TlsWrite, LengthPrefixed<ClientMessage>>,
}

/// Owns the link to one tracker. Shared resource per §5: callers reach it
/// only through the request/report operations below.
pub struct TrackerClient {
    name: String,
    config: TrackerConfig,
    ca_bundle: std::path::PathBuf,
    identity_public: [u8; 32],
    link: Arc<Mutex<Option<Link>>>,
    correlator: Arc<Correlator>,
    connections: Arc<ConnectionsList>,
    events_tx: mpsc::Sender<TrackerEvent>,
    registered: Arc<AtomicBool>,
}

impl TrackerClient {
    pub fn new(
        config: TrackerConfig,
        ca_bundle: std::path::PathBuf,
        identity_public: [u8; 32],
        connections: Arc<ConnectionsList>,
        events_tx: mpsc::Sender<TrackerEvent>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            name: config.name.clone(),
            config,
            ca_bundle,
            identity_public,
            link: Arc::new(Mutex::new(None)),
            correlator: Arc::new(Correlator::new()),
            connections,
            events_tx,
            registered: Arc::new(AtomicBool::new(false)),
        });
        client.clone().spawn_reconnect_loop();
        client
    }

    pub fn get_token(&self) -> Option<&str> {
        self.config.token.as_deref()
    }

    pub fn get_master_token(&self) -> Result<&str, TrackerError> {
        self.config.master_token.as_deref().ok_or_else(|| TrackerError::NoMasterToken {
            tracker: self.name.clone(),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// The reconnect loop never stops while the process is running: on
    /// disconnect it backs off 1s, 2s, 4s, 8s, 16s, then holds at 16s.
    fn spawn_reconnect_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                match self.connect_and_run().await {
                    Ok(()) => attempt = 0,
                    Err(e) => warn!(tracker = %self.name, error = %e, "tracker link dropped"),
                }
                self.registered.store(false, Ordering::SeqCst);
                *self.link.lock().await = None;

                let delay = BACKOFF_STEPS.get(attempt).copied().unwrap_or(STEADY_STATE_BACKOFF);
                attempt += 1;
                debug!(tracker = %self.name, ?delay, "reconnecting to tracker after delay");
                tokio::time::sleep(delay).await;
            }
        });
    }

    async fn connect_and_run(self: &Arc<Self>) -> Result<(), TrackerError> {
        let tls_stream = connect_tls(&self.config.endpoint, &self.ca_bundle).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let reader = FramedRead::new(read_half, LengthPrefixed::<ServerMessage>::default());
        let writer = FramedWrite::new(write_half, LengthPrefixed::<ClientMessage>::default());

        *self.link.lock().await = Some(Link { writer });
        info!(tracker = %self.name, "tracker link established");

        if self.config.token.is_some() {
            self.register().await?;
        }

        self.read_loop(reader).await
    }

    async fn register(self: &Arc<Self>) -> Result<(), TrackerError> {
        let message_id = Uuid::new_v4().to_string();
        let rx = self.correlator.register(message_id.clone()).await;

        let token = self.config.token.clone().unwrap_or_default();
        self.send(ClientMessage {
            payload: Some(client_message::Payload::RegisterDaemon(RegisterDaemonRequest {
                message_id,
                token,
                identity: self.identity_public.to_vec(),
                key: self.identity_public.to_vec(),
            })),
        })
        .await?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| TrackerError::Timeout { message_id: "register".into() })?
            .map_err(|_| TrackerError::Timeout { message_id: "register".into() })?;

        match reply.payload {
            Some(server_message::Payload::RegisterDaemonResponse(resp))
                if resp.status == ResponseStatus::Accepted as i32 =>
            {
                self.registered.store(true, Ordering::SeqCst);
                let _ = self
                    .events_tx
                    .send(TrackerEvent::Registered { daemon_name: resp.daemon_name })
                    .await;
                Ok(())
            }
            _ => Err(TrackerError::NotRegistered { tracker: self.name.clone() }),
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), TrackerError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| TrackerError::NoTracker { tracker: self.name.clone() })?;
        link.writer.send(msg).await.map_err(TrackerError::Io)
    }

    /// Forward a generic administrative request to the tracker and await
    /// its correlated response.
    pub async fn generic_request(
        &self,
        kind: GenericKind,
        params: HashMap<String, String>,
        use_master_token: bool,
    ) -> Result<GenericResponse, TrackerError> {
        if !self.is_registered() {
            return Err(TrackerError::NotRegistered { tracker: self.name.clone() });
        }
        let message_id = Uuid::new_v4().to_string();
        let rx = self.correlator.register(message_id.clone()).await;

        self.send(ClientMessage {
            payload: Some(client_message::Payload::GenericRequest(GenericRequest {
                message_id: message_id.clone(),
                kind: kind as i32,
                params,
                use_master_token,
            })),
        })
        .await?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(ServerMessage { payload: Some(server_message::Payload::GenericResponse(resp)) })) => Ok(resp),
            Ok(Ok(_)) | Ok(Err(_)) => Err(TrackerError::Timeout { message_id }),
            Err(_) => {
                self.correlator.cancel(&message_id).await;
                Err(TrackerError::Timeout { message_id })
            }
        }
    }

    /// Report whether the local daemon currently has an established peer
    /// session for `path`, and the internal address peers should try first.
    pub async fn report_status(
        &self,
        path: &str,
        role: ConnectionRole,
        connected: bool,
        internal_address: &str,
        internal_port: u16,
    ) {
        let proto_role = match role {
            ConnectionRole::Server => crate::proto::tracker::ConnectionRole::Server,
            ConnectionRole::Client => crate::proto::tracker::ConnectionRole::Client,
        };
        let _ = self
            .send(ClientMessage {
                payload: Some(client_message::Payload::StatusReport(StatusReport {
                    message_id: Uuid::new_v4().to_string(),
                    path: path.to_string(),
                    role: proto_role as i32,
                    connected,
                    internal_address: internal_address.to_string(),
                    internal_port: internal_port as u32,
                })),
            })
            .await;
    }

    pub async fn respond_to_address_request(&self, message_id: String, mut resp: AddressResponse) {
        resp.message_id = message_id;
        let _ = self
            .send(ClientMessage {
                payload: Some(client_message::Payload::AddressResponse(resp)),
            })
            .await;
    }

    async fn read_loop(self: &Arc<Self>, mut reader: FramedRead<TlsRead, LengthPrefixed<ServerMessage>>) -> Result<(), TrackerError> {
        while let Some(frame) = reader.next().await {
            let msg = frame.map_err(TrackerError::Io)?;
            self.dispatch(msg).await;
        }
        Err(TrackerError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "tracker link closed")))
    }

    async fn dispatch(self: &Arc<Self>, msg: ServerMessage) {
        let message_id = extract_message_id(&msg);
        if let Some(message_id) = message_id {
            if self.correlator.resolve(&message_id, msg.clone()).await {
                return;
            }
        }

        match msg.payload {
            Some(server_message::Payload::ServerAvailable(a)) => {
                let _ = self
                    .events_tx
                    .send(TrackerEvent::ServerAvailable {
                        path: a.path,
                        internal_address: a.internal_address,
                        internal_port: a.internal_port as u16,
                        external_address: a.external_address,
                        external_port: a.external_port as u16,
                        server_identity: a.server_identity,
                        name: a.name,
                    })
                    .await;
            }
            Some(server_message::Payload::PeerAvailable(p)) => {
                let _ = self
                    .events_tx
                    .send(TrackerEvent::PeerAvailable {
                        path: p.path,
                        internal_address: p.internal_address,
                        internal_port: p.internal_port as u16,
                        external_address: p.external_address,
                        external_port: p.external_port as u16,
                        peer_identity: p.peer_identity,
                        name: p.name,
                    })
                    .await;
            }
            Some(server_message::Payload::AddressRequest(req)) => {
                let _ = self
                    .events_tx
                    .send(TrackerEvent::AddressRequest {
                        path: req.path,
                        requester_identity: req.requester_identity,
                    })
                    .await;
            }
            Some(server_message::Payload::ConnectionsList(list)) => {
                self.reconcile_connections(list).await;
            }
            _ => {}
        }
    }

    /// Reconcile the tracker's advertised connections against the
    /// persistent list: remove what's no longer advertised, refresh what's
    /// known, and insert the rest as imported.
    async fn reconcile_connections(self: &Arc<Self>, list: crate::proto::tracker::ConnectionsList) {
        let advertised: HashMap<String, ProtoDescriptor> = list
            .server_connections
            .into_iter()
            .chain(list.client_connections)
            .map(|d| (d.path.clone(), d))
            .collect();

        let known = self.connections.all_connection_names(&self.name).await;
        for name in known {
            if !advertised.contains_key(&name) {
                self.connections.delete(&self.name, &name, false).await;
                let _ = self
                    .events_tx
                    .send(TrackerEvent::ConnectionRemoved { path: name })
                    .await;
            }
        }

        for (path, descriptor) in advertised {
            let role = if descriptor.role == crate::proto::tracker::ConnectionRole::Server as i32 {
                ConnectionRole::Server
            } else {
                ConnectionRole::Client
            };
            self.connections
                .update(
                    &self.name,
                    &path,
                    role == ConnectionRole::Server,
                    ConnectionDescriptor {
                        tracker: self.name.clone(),
                        path: path.clone(),
                        role,
                        encrypted: descriptor.encrypted,
                        fixed: descriptor.fixed,
                        connect_address: descriptor.connect_address,
                        connect_port: descriptor.connect_port as u16,
                        listen_address: descriptor.listen_address,
                        listen_port: descriptor.listen_port as u16,
                        peers: descriptor.peers,
                        server_name: None,
                    },
                )
                .await;
        }

        if let Err(e) = self.connections.save().await {
            warn!(tracker = %self.name, error = %e, "failed to persist connections list after reconciliation");
        }
    }
}

fn extract_message_id(msg: &ServerMessage) -> Option<String> {
    match &msg.payload {
        Some(server_message::Payload::RegisterDaemonResponse(r)) => Some(r.message_id.clone()),
        Some(server_message::Payload::GenericResponse(r)) => Some(r.message_id.clone()),
        _ => None,
    }
}

async fn connect_tls(endpoint: &str, ca_bundle: &Path) -> Result<TlsStream<TcpStream>, TrackerError> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| TrackerError::Tls {
        reason: format!("invalid tracker endpoint: {endpoint}"),
    })?;
    let port: u16 = port.parse().map_err(|_| TrackerError::Tls {
        reason: format!("invalid tracker port: {endpoint}"),
    })?;

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(TrackerError::Io)?;

    let ca_file = std::fs::read(ca_bundle).map_err(TrackerError::Io)?;
    let mut root_store = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(ca_file.as_slice());
    for cert in certs(&mut reader) {
        let cert = cert.map_err(|e| TrackerError::Tls { reason: e.to_string() })?;
        root_store
            .add(cert)
            .map_err(|e| TrackerError::Tls { reason: e.to_string() })?;
    }

    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = host.to_string().try_into().map_err(|_| TrackerError::Tls {
        reason: format!("invalid tracker hostname: {host}"),
    })?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TrackerError::Tls { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_capped() {
        let sequence: Vec<Duration> = (0..8)
            .map(|i| BACKOFF_STEPS.get(i).copied().unwrap_or(STEADY_STATE_BACKOFF))
            .collect();
        assert_eq!(
            sequence,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(16),
                Duration::from_secs(16),
                Duration::from_secs(16),
            ]
        );
    }
}
