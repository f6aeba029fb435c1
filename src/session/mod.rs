//! Peer session state machine (§4.3): dialing through a reliable-UDP
//! session, a signed ephemeral-key handshake, mutual verification against
//! tracker-supplied identity bindings, and established encrypted delivery of
//! inner substream messages to the front multiplexer.

mod handshake;

pub use handshake::{close_substream, data_substream, open_substream};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionsList;
use crate::crypto::Crypter;
use crate::error::{ProtocolError, WarrenError};
use crate::proto::peer::{outer_message, ConnectStatus};
use crate::transport::{ReliableTransport, Session as TransportSession};

/// T1: a session stuck before `established` this long is torn down.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// T2: a `closing` session that never acks its `BYE` is force-closed.
const BYE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Dialing,
    Handshake,
    Verifying,
    Established,
    Closing,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connect { session_id: String, connection_name: String },
    ConnectRequest { session_id: String, connection_name: String },
    ConnectResponse { session_id: String, accepted: bool },
    Established { session_id: String, connection_name: String },
    Data { session_id: String, substream_id: u32, bytes: Vec<u8> },
    SubstreamOpen { session_id: String, substream_id: u32 },
    SubstreamClose { session_id: String, substream_id: u32 },
    Close { session_id: String, connection_name: String },
}

struct SessionState {
    connection_name: String,
    role: ConnectionRole,
    phase: SessionPhase,
    sent_own_request: bool,
    local_accepted: Option<bool>,
    remote_accepted: Option<bool>,
    remote_peer_name: Option<String>,
    /// The connection descriptor's `encrypted` attribute, resolved once the
    /// connection name is known. Defaults to `true` while it isn't (a
    /// freshly accepted inbound session, before its peer's `ConnectRequest`
    /// names the connection) so nothing is sent in the clear prematurely.
    encrypted: bool,
}

/// Owns every in-flight and established peer session. Shared resource per
/// §5: mutated only through the operations below, never reached into
/// directly by the front multiplexer or tracker client.
pub struct SessionManager {
    transport: Arc<ReliableTransport>,
    crypter: Arc<Mutex<Crypter>>,
    tracker_name: String,
    connections: Arc<ConnectionsList>,
    sessions: Mutex<HashMap<String, SessionState>>,
    transports: Mutex<HashMap<String, Arc<TransportSession>>>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<ReliableTransport>,
        crypter: Arc<Mutex<Crypter>>,
        tracker_name: String,
        connections: Arc<ConnectionsList>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport,
            crypter,
            tracker_name,
            connections,
            sessions: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            events_tx,
        });
        manager.clone().spawn_inbound_acceptor();
        manager
    }

    /// `fixed_peers` set for `connection_name`, if that connection is
    /// configured `fixed=true`; `None` otherwise (accept any verified peer).
    async fn fixed_peers_for(&self, connection_name: &str) -> Option<HashSet<String>> {
        if connection_name.is_empty() {
            return None;
        }
        let active = self.connections.get(&self.tracker_name).await;
        let descriptor = active.active.get(connection_name)?;
        if descriptor.fixed {
            Some(allowed_peer_set(&descriptor.peers))
        } else {
            None
        }
    }

    /// Whether `connection_name` is configured `encrypted=true`. Unknown or
    /// not-yet-named connections default to encrypted.
    async fn encrypted_for(&self, connection_name: &str) -> bool {
        if connection_name.is_empty() {
            return true;
        }
        let active = self.connections.get(&self.tracker_name).await;
        active
            .active
            .get(connection_name)
            .map(|d| d.encrypted)
            .unwrap_or(true)
    }

    fn spawn_inbound_acceptor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut incoming = self.transport.accept_sessions().await;
            while let Some(transport_session) = incoming.recv().await {
                // Inbound sessions arrive without a connection name until the
                // peer's own ConnectRequest is read; the session is tracked
                // under its transport tag in the interim.
                let session_id = transport_session.tag().to_string();
                self.register(
                    session_id,
                    "".to_string(),
                    ConnectionRole::Server,
                    transport_session,
                )
                .await;
            }
        });
    }

    async fn register(
        self: &Arc<Self>,
        session_id: String,
        connection_name: String,
        role: ConnectionRole,
        transport_session: Arc<TransportSession>,
    ) {
        let encrypted = self.encrypted_for(&connection_name).await;
        self.crypter.lock().await.new_session(&session_id);
        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionState {
                connection_name,
                role,
                phase: SessionPhase::Dialing,
                sent_own_request: false,
                local_accepted: None,
                remote_accepted: None,
                remote_peer_name: None,
                encrypted,
            },
        );
        self.transports
            .lock()
            .await
            .insert(session_id.clone(), transport_session.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_session(session_id, transport_session).await;
        });
    }

    /// Begin a session toward `connection_name`. Endpoint candidates are
    /// tried in order (internal addresses first, external ones discovered
    /// via the tracker).
    pub async fn open(
        self: &Arc<Self>,
        connection_name: &str,
        role: ConnectionRole,
        endpoint_candidates: &[(String, u16)],
    ) -> Result<String, WarrenError> {
        let mut last_err = None;
        for (address, port) in endpoint_candidates {
            match self.transport.dial(address, *port).await {
                Ok(transport_session) => {
                    let session_id = Uuid::new_v4().to_string();
                    self.register(
                        session_id.clone(),
                        connection_name.to_string(),
                        role,
                        transport_session,
                    )
                    .await;
                    let _ = self
                        .events_tx
                        .send(SessionEvent::Connect {
                            session_id: session_id.clone(),
                            connection_name: connection_name.to_string(),
                        })
                        .await;
                    return Ok(session_id);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or(WarrenError::Protocol(ProtocolError::NoSession {
                connection: connection_name.to_string(),
            })))
    }

    /// Encrypt (once established) and transmit an inner substream message.
    pub async fn send(&self, session_id: &str, inner_message: Vec<u8>) -> Result<(), WarrenError> {
        let transports = self.transports.lock().await;
        let transport_session = transports
            .get(session_id)
            .ok_or_else(|| ProtocolError::NoSession {
                connection: session_id.to_string(),
            })?
            .clone();
        drop(transports);

        let (phase, encrypted) = {
            let sessions = self.sessions.lock().await;
            let state = sessions.get(session_id).ok_or_else(|| ProtocolError::NoSession {
                connection: session_id.to_string(),
            })?;
            (state.phase, state.encrypted)
        };
        if phase != SessionPhase::Established {
            return Err(ProtocolError::NotEstablished.into());
        }

        let frame = if encrypted {
            let (nonce, ciphertext) = self.crypter.lock().await.encrypt(session_id, &inner_message)?;
            handshake::encrypted_data(nonce, ciphertext)
        } else {
            handshake::plaintext_data(inner_message)
        };
        transport_session.write(frame).await.map_err(WarrenError::Network)?;
        Ok(())
    }

    /// Send `BYE` on every session for `connection_name` and release them.
    pub async fn close_connection(&self, connection_name: &str) {
        let matching: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, s)| s.connection_name == connection_name)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in matching {
            self.begin_closing(&session_id).await;
        }
    }

    async fn begin_closing(&self, session_id: &str) {
        let transport_session = self.transports.lock().await.get(session_id).cloned();
        if let Some(transport_session) = transport_session {
            let _ = transport_session.write(handshake::bye()).await;
        }
        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
            state.phase = SessionPhase::Closing;
        }
    }

    async fn run_session(self: Arc<Self>, session_id: String, transport_session: Arc<TransportSession>) {
        let handshake_deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut closing_deadline: Option<Instant> = None;
        let mut recv_buf = BytesMut::new();

        loop {
            let phase = match self.sessions.lock().await.get(&session_id) {
                Some(s) => s.phase,
                None => break,
            };

            if phase != SessionPhase::Established && phase != SessionPhase::Closing {
                if Instant::now() >= handshake_deadline {
                    warn!(session_id, "handshake timed out");
                    break;
                }
            }
            if let Some(deadline) = closing_deadline {
                if Instant::now() >= deadline {
                    debug!(session_id, "bye never acked, force-closing");
                    break;
                }
            }

            if phase == SessionPhase::Dialing {
                if let Err(e) = self.send_own_connect_request(&session_id, &transport_session).await {
                    warn!(session_id, error = %e, "failed to send connect request");
                    break;
                }
                if let Some(state) = self.sessions.lock().await.get_mut(&session_id) {
                    state.phase = SessionPhase::Handshake;
                }
            }

            let read_timeout = tokio::time::sleep(Duration::from_millis(500));
            tokio::select! {
                chunk = transport_session.read() => {
                    match chunk {
                        Some(bytes) => {
                            recv_buf.extend_from_slice(&bytes);
                            match handshake::try_decode_outer(&mut recv_buf) {
                                Ok(Some(msg)) => {
                                    if self.handle_outer_message(&session_id, &transport_session, msg, &mut closing_deadline).await {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(session_id, error = %e, "malformed outer message");
                                    break;
                                }
                            }
                        }
                        None => {
                            debug!(session_id, "transport session closed underneath peer session");
                            break;
                        }
                    }
                }
                _ = read_timeout => {}
            }
        }

        self.teardown(&session_id).await;
    }

    async fn send_own_connect_request(
        &self,
        session_id: &str,
        transport_session: &Arc<TransportSession>,
    ) -> Result<(), WarrenError> {
        let connection_name = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.connection_name.clone())
            .unwrap_or_default();

        let identity = self.crypter.lock().await.identity();
        let ephemeral = self.crypter.lock().await.local_ephemeral_public(session_id)?;
        let signature = self.crypter.lock().await.sign(session_id)?;

        let frame = handshake::connect_request(&connection_name, identity, ephemeral, signature);
        transport_session.write(frame).await.map_err(WarrenError::Network)?;

        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
            state.sent_own_request = true;
        }
        Ok(())
    }

    /// Returns `true` if the session should now be torn down.
    async fn handle_outer_message(
        self: &Arc<Self>,
        session_id: &str,
        transport_session: &Arc<TransportSession>,
        msg: crate::proto::peer::OuterMessage,
        closing_deadline: &mut Option<Instant>,
    ) -> bool {
        match msg.payload {
            Some(outer_message::Payload::ConnectRequest(req)) => {
                let connection_name = req.connection_name.clone();
                let newly_named = {
                    let mut sessions = self.sessions.lock().await;
                    match sessions.get_mut(session_id) {
                        Some(state) if state.connection_name.is_empty() => {
                            state.connection_name = connection_name.clone();
                            true
                        }
                        _ => false,
                    }
                };
                if newly_named {
                    let encrypted = self.encrypted_for(&connection_name).await;
                    if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
                        state.encrypted = encrypted;
                    }
                }
                let _ = self
                    .events_tx
                    .send(SessionEvent::ConnectRequest {
                        session_id: session_id.to_string(),
                        connection_name: connection_name.clone(),
                    })
                    .await;

                let identity: [u8; 32] = match req.identity.try_into() {
                    Ok(v) => v,
                    Err(_) => return true,
                };
                let ephemeral: [u8; 32] = match req.public_key.try_into() {
                    Ok(v) => v,
                    Err(_) => return true,
                };
                let signature: [u8; 64] = match req.signature.try_into() {
                    Ok(v) => v,
                    Err(_) => return true,
                };

                let fixed_peers = self.fixed_peers_for(&connection_name).await;
                let verify = self.crypter.lock().await.verify(
                    session_id,
                    &self.tracker_name,
                    identity,
                    ephemeral,
                    signature,
                    fixed_peers.as_ref(),
                );
                let verified = match verify {
                    Ok(result) => {
                        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
                            state.remote_peer_name = result.peer_name;
                        }
                        result.verified
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "verification error");
                        false
                    }
                };

                if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
                    state.phase = SessionPhase::Verifying;
                    state.local_accepted = Some(verified);
                }

                let _ = transport_session
                    .write(handshake::connect_response(verified))
                    .await;

                if verified {
                    let _ = self.crypter.lock().await.derive(session_id);
                } else {
                    *closing_deadline = Some(Instant::now() + BYE_TIMEOUT);
                    let _ = transport_session.write(handshake::bye()).await;
                }

                // A responder that has not yet sent its own request folds it
                // into this same session rather than opening a second one.
                let sent_own = self
                    .sessions
                    .lock()
                    .await
                    .get(session_id)
                    .map(|s| s.sent_own_request)
                    .unwrap_or(true);
                if !sent_own {
                    let _ = self.send_own_connect_request(session_id, transport_session).await;
                }

                self.maybe_establish(session_id, &connection_name).await;
                false
            }
            Some(outer_message::Payload::ConnectResponse(resp)) => {
                let accepted = resp.status == ConnectStatus::Accepted as i32;
                let connection_name = self
                    .sessions
                    .lock()
                    .await
                    .get(session_id)
                    .map(|s| s.connection_name.clone())
                    .unwrap_or_default();

                let _ = self
                    .events_tx
                    .send(SessionEvent::ConnectResponse {
                        session_id: session_id.to_string(),
                        accepted,
                    })
                    .await;

                if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
                    state.remote_accepted = Some(accepted);
                }
                if accepted {
                    let _ = self.crypter.lock().await.derive(session_id);
                }
                self.maybe_establish(session_id, &connection_name).await;
                !accepted
            }
            Some(outer_message::Payload::Bye(_)) => true,
            Some(outer_message::Payload::Data(data)) => {
                self.deliver_inner(session_id, data.inner).await;
                false
            }
            Some(outer_message::Payload::EncryptedData(enc)) => {
                let nonce: [u8; 12] = match enc.nonce.try_into() {
                    Ok(v) => v,
                    Err(_) => return true,
                };
                let plaintext = self
                    .crypter
                    .lock()
                    .await
                    .decrypt(session_id, &nonce, &enc.payload);
                match plaintext {
                    Ok(Some(bytes)) => {
                        self.deliver_inner(session_id, bytes).await;
                        false
                    }
                    Ok(None) => {
                        warn!(session_id, "decryption failed, tearing down session");
                        true
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "decrypt error");
                        true
                    }
                }
            }
            None => false,
        }
    }

    async fn deliver_inner(&self, session_id: &str, bytes: Vec<u8>) {
        let phase = self.sessions.lock().await.get(session_id).map(|s| s.phase);
        if phase != Some(SessionPhase::Established) {
            return;
        }
        let mut buf = BytesMut::from(&bytes[..]);
        if let Ok(Some(inner)) = handshake::try_decode_inner(&mut buf) {
            use crate::proto::peer::inner_message::Payload;
            match inner.payload {
                Some(Payload::Open(open)) => {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::SubstreamOpen {
                            session_id: session_id.to_string(),
                            substream_id: open.id,
                        })
                        .await;
                }
                Some(Payload::Data(data)) => {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::Data {
                            session_id: session_id.to_string(),
                            substream_id: data.id,
                            bytes: data.bytes,
                        })
                        .await;
                }
                Some(Payload::Close(close)) => {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::SubstreamClose {
                            session_id: session_id.to_string(),
                            substream_id: close.id,
                        })
                        .await;
                }
                None => {}
            }
        }
    }

    async fn maybe_establish(self: &Arc<Self>, session_id: &str, connection_name: &str) {
        let should_emit = {
            let mut sessions = self.sessions.lock().await;
            let Some(state) = sessions.get_mut(session_id) else {
                return;
            };
            if state.phase == SessionPhase::Established {
                return;
            }
            if state.local_accepted == Some(true) && state.remote_accepted == Some(true) {
                state.phase = SessionPhase::Established;
                true
            } else {
                false
            }
        };

        if should_emit {
            if self.collapse_duplicate(session_id, connection_name).await {
                return;
            }
            info!(session_id, connection_name, "peer session established");
            let _ = self
                .events_tx
                .send(SessionEvent::Established {
                    session_id: session_id.to_string(),
                    connection_name: connection_name.to_string(),
                })
                .await;
        }
    }

    /// If another established session already exists for the same
    /// connection, keep only the one whose `sessionId` sorts lexicographically
    /// smaller and close the other with `BYE`.
    async fn collapse_duplicate(&self, session_id: &str, connection_name: &str) -> bool {
        let duplicate = {
            let sessions = self.sessions.lock().await;
            sessions.iter().find(|(id, s)| {
                *id != session_id && s.connection_name == connection_name && s.phase == SessionPhase::Established
            }).map(|(id, _)| id.clone())
        };

        let Some(other_id) = duplicate else {
            return false;
        };

        let loser = if session_id < other_id.as_str() {
            other_id
        } else {
            session_id.to_string()
        };
        self.begin_closing(&loser).await;
        loser == session_id
    }

    async fn teardown(&self, session_id: &str) {
        let connection_name = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .map(|s| s.connection_name)
            .unwrap_or_default();
        self.transports.lock().await.remove(session_id);
        self.crypter.lock().await.forget_session(session_id);
        let _ = self
            .events_tx
            .send(SessionEvent::Close {
                session_id: session_id.to_string(),
                connection_name,
            })
            .await;
    }
}

/// Canonical peer names used when checking a connection's fixed-peer set.
pub fn allowed_peer_set(names: &[String]) -> HashSet<String> {
    names.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_peer_set_dedupes() {
        let set = allowed_peer_set(&["a".into(), "b".into(), "a".into()]);
        assert_eq!(set.len(), 2);
    }
}
