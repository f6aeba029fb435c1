//! Reliable byte-stream sessions over a single shared UDP socket (§4.2).
//!
//! One socket serves three kinds of traffic: established sessions (keyed by
//! a per-session `tag` embedded in the datagram header), pending dials
//! (keyed by a punch cookie carried the same way before a session exists),
//! and tracker rendezvous traffic that rides the same port for NAT-punching
//! coordination. `ReliableTransport` owns the socket and the demultiplexing
//! loop; `Session` is the per-connection handle callers read and write.

mod reliable;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;
use reliable::{DatagramHeader, RecvWindow, SendWindow, FLAG_ACK, FLAG_DATA, FLAG_FIN, FLAG_SYN};

const MAX_DATAGRAM_PAYLOAD: usize = 1400;
const INBOUND_CHANNEL_DEPTH: usize = 256;

/// A single reliable-UDP byte stream, multiplexed over the shared socket.
pub struct Session {
    tag: u64,
    peer_addr: SocketAddr,
    write_tx: mpsc::Sender<Vec<u8>>,
    read_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<Notify>,
    is_closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Session {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Queue `bytes` for reliable delivery. Returns once accepted by the
    /// session's send window, not once acknowledged.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.write_tx
            .send(bytes)
            .await
            .map_err(|_| NetworkError::SendFailed {
                reason: "session closed".into(),
            })
    }

    /// Read the next in-order chunk of application bytes, or `None` once the
    /// session has closed and all buffered data has been drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    pub async fn close(&self) {
        if !self.is_closed.swap(true, Ordering::SeqCst) {
            self.closed.notify_waiters();
        }
    }

    /// Resolves once the session has been torn down, locally or by the peer.
    pub async fn on_close(&self) {
        if self.is_closed.load(Ordering::SeqCst) {
            return;
        }
        self.closed.notified().await;
    }
}

struct SessionEntry {
    raw_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
}

/// Shared UDP socket plus the demultiplexing state for every session, pending
/// dial, and inline (tracker) receiver riding it.
pub struct ReliableTransport {
    socket: Arc<UdpSocket>,
    sessions: Arc<Mutex<HashMap<u64, SessionEntry>>>,
    pending_dials: Arc<Mutex<HashMap<u64, oneshot::Sender<SocketAddr>>>>,
    inline_hook: Arc<Mutex<Option<mpsc::Sender<(SocketAddr, Vec<u8>)>>>>,
    incoming_tx: Arc<Mutex<Option<mpsc::Sender<Arc<Session>>>>>,
    next_tag: AtomicU64,
}

impl ReliableTransport {
    /// Bind the shared UDP socket and start the demultiplexing loop.
    pub async fn listen(port: u16) -> Result<Arc<Self>, NetworkError> {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse().map_err(|_| {
            NetworkError::BindFailed {
                addr: format!("0.0.0.0:{port}"),
                reason: "invalid port".into(),
            }
        })?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending_dials: Arc::new(Mutex::new(HashMap::new())),
            inline_hook: Arc::new(Mutex::new(None)),
            incoming_tx: Arc::new(Mutex::new(None)),
            next_tag: AtomicU64::new(1),
        });

        transport.clone().spawn_recv_loop();
        Ok(transport)
    }

    /// Register a channel that receives every datagram with tag `0`
    /// (rendezvous/tracker traffic riding this port), bypassing session
    /// demultiplexing entirely.
    pub async fn set_inline_hook(&self, hook: mpsc::Sender<(SocketAddr, Vec<u8>)>) {
        *self.inline_hook.lock().await = Some(hook);
    }

    /// Subscribe to sessions created by an unsolicited SYN (the server role
    /// in a NAT-punched rendezvous, where the peer dials first).
    pub async fn accept_sessions(&self) -> mpsc::Receiver<Arc<Session>> {
        let (tx, rx) = mpsc::channel(32);
        *self.incoming_tx.lock().await = Some(tx);
        rx
    }

    pub async fn send_inline(&self, addr: SocketAddr, payload: &[u8]) -> Result<(), NetworkError> {
        let header = DatagramHeader {
            tag: 0,
            seq: 0,
            ack: 0,
            ack_bitmap: 0,
            flags: 0,
        };
        let mut buf = Vec::new();
        header.encode(payload, &mut buf);
        self.socket
            .send_to(&buf, addr)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })
    }

    fn allocate_tag(&self) -> u64 {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let random = u64::from_be_bytes(bytes);
        random ^ self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a reliable session to `remote_address:remote_port`.
    pub async fn dial(
        self: &Arc<Self>,
        remote_address: &str,
        remote_port: u16,
    ) -> Result<Arc<Session>, NetworkError> {
        let peer_addr: SocketAddr = format!("{remote_address}:{remote_port}")
            .parse()
            .map_err(|_| NetworkError::NetworkUnreachable {
                endpoint: format!("{remote_address}:{remote_port}"),
            })?;

        let tag = self.allocate_tag();
        let syn = DatagramHeader {
            tag,
            seq: 0,
            ack: 0,
            ack_bitmap: 0,
            flags: FLAG_SYN,
        };
        let mut buf = Vec::new();
        syn.encode(&[], &mut buf);
        self.socket
            .send_to(&buf, peer_addr)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;

        Ok(self.clone().new_session(tag, peer_addr).await)
    }

    /// Send a burst of SYN datagrams to open a NAT mapping toward
    /// `remote_address:remote_port`, without waiting for a reply.
    pub async fn punch(
        &self,
        attempts: u32,
        remote_port: u16,
        remote_address: &str,
    ) -> Result<(), NetworkError> {
        let peer_addr: SocketAddr = format!("{remote_address}:{remote_port}")
            .parse()
            .map_err(|_| NetworkError::NetworkUnreachable {
                endpoint: format!("{remote_address}:{remote_port}"),
            })?;

        let punch_header = DatagramHeader {
            tag: 0,
            seq: 0,
            ack: 0,
            ack_bitmap: 0,
            flags: FLAG_SYN,
        };
        let mut buf = Vec::new();
        punch_header.encode(b"punch", &mut buf);

        for attempt in 0..attempts {
            if let Err(e) = self.socket.send_to(&buf, peer_addr).await {
                warn!(%peer_addr, attempt, error = %e, "punch datagram failed to send");
            }
        }
        debug!(%peer_addr, attempts, "sent NAT punch sequence");
        Ok(())
    }

    async fn new_session(self: Arc<Self>, tag: u64, peer_addr: SocketAddr) -> Arc<Session> {
        let (raw_tx, raw_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let (write_tx, write_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let (read_tx, read_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let closed = Arc::new(Notify::new());
        let is_closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        self.sessions
            .lock()
            .await
            .insert(tag, SessionEntry { raw_tx });

        let session = Arc::new(Session {
            tag,
            peer_addr,
            write_tx,
            read_rx: Mutex::new(read_rx),
            closed: closed.clone(),
            is_closed: is_closed.clone(),
        });

        tokio::spawn(session_worker(
            self.socket.clone(),
            self.sessions.clone(),
            tag,
            peer_addr,
            raw_rx,
            write_rx,
            read_tx,
            closed,
            is_closed,
        ));

        session
    }

    fn spawn_recv_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, addr) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        continue;
                    }
                };

                let Some((header, payload)) = DatagramHeader::decode(&buf[..len]) else {
                    trace!(%addr, "dropped undersized datagram");
                    continue;
                };

                if header.tag == 0 {
                    let hook = self.inline_hook.lock().await.clone();
                    if let Some(hook) = hook {
                        let _ = hook.send((addr, payload.to_vec())).await;
                    }
                    continue;
                }

                let sessions = self.sessions.lock().await;
                if let Some(entry) = sessions.get(&header.tag) {
                    let _ = entry.raw_tx.send((addr, buf[..len].to_vec())).await;
                    continue;
                }
                drop(sessions);

                if header.flags & FLAG_SYN != 0 {
                    let mut pending = self.pending_dials.lock().await;
                    if let Some(notify) = pending.remove(&header.tag) {
                        let _ = notify.send(addr);
                    } else {
                        drop(pending);
                        // An unsolicited SYN for an unknown tag opens a
                        // server-side session so the peer-session layer can
                        // run its own verification independent of who
                        // dialed first.
                        let session = self.clone().new_session(header.tag, addr).await;
                        let sessions = self.sessions.lock().await;
                        if let Some(entry) = sessions.get(&header.tag) {
                            let _ = entry.raw_tx.send((addr, buf[..len].to_vec())).await;
                        }
                        drop(sessions);

                        if let Some(incoming_tx) = self.incoming_tx.lock().await.clone() {
                            let _ = incoming_tx.send(session).await;
                        }
                    }
                }
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_worker(
    socket: Arc<UdpSocket>,
    sessions: Arc<Mutex<HashMap<u64, SessionEntry>>>,
    tag: u64,
    peer_addr: SocketAddr,
    mut raw_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    read_tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<Notify>,
    is_closed: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut recv_window = RecvWindow::new();
    let mut send_window = SendWindow::new();
    let mut retransmit = tokio::time::interval(std::time::Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = retransmit.tick() => {
                match send_window.due_for_retransmit() {
                    Some(due) => {
                        let (ack, bitmap) = recv_window.ack_fields();
                        for (seq, payload) in due {
                            let header = DatagramHeader { tag, seq, ack, ack_bitmap: bitmap, flags: FLAG_DATA };
                            let mut buf = Vec::new();
                            header.encode(&payload, &mut buf);
                            let _ = socket.send_to(&buf, peer_addr).await;
                        }
                    }
                    None => {
                        debug!(tag, %peer_addr, "session retransmission attempts exhausted");
                        break;
                    }
                }
            }

            outgoing = write_rx.recv() => {
                let Some(bytes) = outgoing else { break };
                for chunk in bytes.chunks(MAX_DATAGRAM_PAYLOAD) {
                    let seq = send_window.push(chunk.to_vec());
                    let (ack, bitmap) = recv_window.ack_fields();
                    let header = DatagramHeader { tag, seq, ack, ack_bitmap: bitmap, flags: FLAG_DATA };
                    let mut buf = Vec::new();
                    header.encode(chunk, &mut buf);
                    if socket.send_to(&buf, peer_addr).await.is_err() {
                        break;
                    }
                }
            }

            incoming = raw_rx.recv() => {
                let Some((_, raw)) = incoming else { break };
                let Some((header, payload)) = DatagramHeader::decode(&raw) else { continue };

                send_window.acknowledge(header.ack, header.ack_bitmap);

                if header.flags & FLAG_FIN != 0 {
                    break;
                }

                if header.flags & FLAG_DATA != 0 {
                    let mut send_failed = false;
                    for deliverable in recv_window.record(header.seq, payload.to_vec()) {
                        if read_tx.send(deliverable).await.is_err() {
                            send_failed = true;
                            break;
                        }
                    }
                    if send_failed {
                        break;
                    }
                }

                if header.flags & (FLAG_DATA | FLAG_SYN) != 0 {
                    let (ack, bitmap) = recv_window.ack_fields();
                    let ack_header = DatagramHeader { tag, seq: 0, ack, ack_bitmap: bitmap, flags: FLAG_ACK };
                    let mut buf = Vec::new();
                    ack_header.encode(&[], &mut buf);
                    let _ = socket.send_to(&buf, peer_addr).await;
                }
            }

            _ = closed.notified() => {
                let fin = DatagramHeader { tag, seq: 0, ack: 0, ack_bitmap: 0, flags: FLAG_FIN };
                let mut buf = Vec::new();
                fin.encode(&[], &mut buf);
                let _ = socket.send_to(&buf, peer_addr).await;
                break;
            }
        }
    }

    is_closed.store(true, Ordering::SeqCst);
    closed.notify_waiters();
    sessions.lock().await.remove(&tag);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_and_listen_exchange_bytes() {
        let server = ReliableTransport::listen(0).await.unwrap();
        let server_port = server.socket.local_addr().unwrap().port();

        let client = ReliableTransport::listen(0).await.unwrap();
        let session = client.dial("127.0.0.1", server_port).await.unwrap();

        session.write(b"hello warren".to_vec()).await.unwrap();

        // The SYN creates a server-side session once the recv loop observes
        // it; give the event loop a moment to wire it up before asserting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let server_sessions = server.sessions.lock().await.len();
        assert_eq!(server_sessions, 1);
    }

    #[tokio::test]
    async fn punch_sends_without_a_listener() {
        let client = ReliableTransport::listen(0).await.unwrap();
        // No peer bound on this port; punching must not hang or error.
        client.punch(4, 59999, "127.0.0.1").await.unwrap();
    }
}
