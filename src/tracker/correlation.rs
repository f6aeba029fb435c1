//! `messageId` correlation between outstanding client requests and the
//! tracker's matching responses.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::proto::tracker::ServerMessage;

/// Holds exactly one pending caller per `messageId`. Unclaimed responses
/// (no registered waiter, or the waiter already timed out and dropped its
/// receiver) are silently discarded by the caller of [`Correlator::resolve`].
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, message_id: String) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id, tx);
        rx
    }

    /// Deliver `msg` to its waiter, if still registered. Returns `true` if
    /// a waiter claimed it.
    pub async fn resolve(&self, message_id: &str, msg: ServerMessage) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(message_id) {
            tx.send(msg).is_ok()
        } else {
            false
        }
    }

    /// Drop a registration without delivering anything (used after a
    /// request times out locally, so a late reply is just discarded).
    pub async fn cancel(&self, message_id: &str) {
        self.pending.lock().await.remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tracker::{server_message, RegisterDaemonResponse, ResponseStatus};

    #[tokio::test]
    async fn resolve_delivers_to_registered_waiter() {
        let correlator = Correlator::new();
        let rx = correlator.register("m1".into()).await;

        let msg = ServerMessage {
            payload: Some(server_message::Payload::RegisterDaemonResponse(RegisterDaemonResponse {
                message_id: "m1".into(),
                status: ResponseStatus::Accepted as i32,
                daemon_name: "d1".into(),
            })),
        };
        assert!(correlator.resolve("m1", msg).await);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn resolve_unclaimed_message_id_returns_false() {
        let correlator = Correlator::new();
        let msg = ServerMessage {
            payload: Some(server_message::Payload::RegisterDaemonResponse(RegisterDaemonResponse {
                message_id: "ghost".into(),
                status: ResponseStatus::Accepted as i32,
                daemon_name: "".into(),
            })),
        };
        assert!(!correlator.resolve("ghost", msg).await);
    }

    #[tokio::test]
    async fn cancel_makes_late_resolve_fail() {
        let correlator = Correlator::new();
        let _rx = correlator.register("m1".into()).await;
        correlator.cancel("m1").await;

        let msg = ServerMessage {
            payload: Some(server_message::Payload::RegisterDaemonResponse(RegisterDaemonResponse {
                message_id: "m1".into(),
                status: ResponseStatus::Accepted as i32,
                daemon_name: "".into(),
            })),
        };
        assert!(!correlator.resolve("m1", msg).await);
    }
}
