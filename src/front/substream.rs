//! One TCP-to-substream pump: relays bytes between a local TCP socket and
//! the `DATA { id }` / `CLOSE { id }` inner-message traffic of a single
//! peer-session substream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{self, SessionManager};

/// How long a locally-closed substream stays "draining", absorbing
/// in-flight `DATA` arriving from the peer before the id is reused.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 16 * 1024;

/// Spawn the pump task for one substream. `from_peer` delivers `DATA`
/// payloads and a close signal (`None`) arriving from the peer session;
/// the task forwards TCP reads to the peer via `session.send()`.
pub fn spawn(
    session_manager: Arc<SessionManager>,
    session_id: String,
    substream_id: u32,
    mut socket: TcpStream,
    mut from_peer: mpsc::Receiver<Option<Vec<u8>>>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut local_closed = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            let drain_sleep = async {
                match drain_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = socket.read(&mut buf), if !local_closed => {
                    match result {
                        Ok(0) => {
                            local_closed = true;
                            drain_deadline = Some(tokio::time::Instant::now() + DRAIN_TIMEOUT);
                            let _ = session_manager
                                .send(&session_id, session::close_substream(substream_id))
                                .await;
                        }
                        Ok(n) => {
                            if let Err(e) = session_manager
                                .send(&session_id, session::data_substream(substream_id, buf[..n].to_vec()))
                                .await
                            {
                                warn!(substream_id, error = %e, "failed to forward substream data to peer");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(substream_id, error = %e, "tcp read error");
                            local_closed = true;
                            drain_deadline = Some(tokio::time::Instant::now() + DRAIN_TIMEOUT);
                        }
                    }
                }

                message = from_peer.recv() => {
                    match message {
                        Some(Some(bytes)) => {
                            if socket.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(None) | None => {
                            debug!(substream_id, "peer closed substream");
                            break;
                        }
                    }
                }

                _ = drain_sleep => {
                    debug!(substream_id, "drain timeout elapsed");
                    break;
                }
            }
        }

        let _ = socket.shutdown().await;
    });
}
