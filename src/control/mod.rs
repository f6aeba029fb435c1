//! Local control RPC (§4.7): a length-prefixed protobuf request/response
//! stream over a Unix domain socket, one task per accepted client.

mod handlers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::codec::LengthPrefixed;
use crate::connections::ConnectionsList;
use crate::error::ControlError;
use crate::proto::control::{ClientMessage, ServerMessage};
use crate::tracker::TrackerClient;

pub use handlers::HandlerContext;

/// Owns the Unix listener and the shared dispatch context handed to every
/// connection's handler task.
pub struct ControlServer {
    socket_path: PathBuf,
    ctx: Arc<HandlerContext>,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        trackers: HashMap<String, Arc<TrackerClient>>,
        connections: Arc<ConnectionsList>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            ctx: Arc::new(HandlerContext { trackers, connections }),
        }
    }

    /// Bind the socket and accept connections until cancelled. Removes any
    /// stale socket file left behind by a previous, uncleanly-terminated run.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), ControlError> {
        let listener = bind(&self.socket_path).await?;
        info!(path = %self.socket_path.display(), "control socket listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.map_err(ControlError::Io)?;
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, ctx).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn bind(path: &Path) -> Result<UnixListener, ControlError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(ControlError::Io)?;
    }
    if path.exists() {
        std::fs::remove_file(path).map_err(ControlError::Io)?;
    }

    let listener = UnixListener::bind(path).map_err(ControlError::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).map_err(ControlError::Io)?;
    }

    Ok(listener)
}

async fn handle_connection(stream: UnixStream, ctx: Arc<HandlerContext>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LengthPrefixed::<ClientMessage>::default());
    let mut writer = FramedWrite::new(write_half, LengthPrefixed::<ServerMessage>::default());

    loop {
        let request = match reader.next().await {
            Some(Ok(req)) => req,
            Some(Err(e)) => {
                warn!(error = %e, "malformed control request frame, closing connection");
                return;
            }
            None => return,
        };

        let response = handlers::handle(&ctx, request).await;
        if let Err(e) = writer.send(response).await {
            warn!(error = %e, "failed to write control response");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_sets_socket_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warren.sock");
        let listener = bind(&path).await.unwrap();
        drop(listener);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o660);
        }
    }

    #[tokio::test]
    async fn bind_removes_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warren.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind(&path).await;
        assert!(listener.is_ok());
    }
}
