//! Proxies for namespaces owned by another broker.

use crate::connection::Connection;
use crate::protocol::{Message, Outgoing};
use crate::{BrokerError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// A connection reserved for relaying traffic to a namespace owner.
///
/// The channel carries one request/response pair at a time; concurrent
/// forwarders queue on the mutex.
#[derive(Debug)]
pub struct RemotePeer {
    id: u64,
    label: String,
    conn: Arc<Mutex<Connection>>,
}

impl RemotePeer {
    /// Reserve a shared connection for forwarding.
    pub fn new(conn: Arc<Mutex<Connection>>, label: impl Into<String>) -> Self {
        Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            conn,
        }
    }

    /// Reserve a connection nobody else holds.
    pub fn from_connection(conn: Connection) -> Self {
        let label = conn.peer().to_string();
        Self::new(Arc::new(Mutex::new(conn)), label)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send `msg` to the owner and return its reply in relayable form.
    ///
    /// Any transport failure is reported as `ConnectionLost`.
    pub async fn call(&self, msg: &Message) -> Result<Outgoing> {
        let lost = || BrokerError::ConnectionLost {
            peer: self.label.clone(),
        };

        let mut conn = self.conn.lock().await;
        conn.send(msg).await.map_err(|e| {
            debug!("forward to {} failed: {}", self.label, e);
            lost()
        })?;
        match conn.recv_outgoing().await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(lost()),
            Err(e) => {
                debug!("reply from {} failed: {}", self.label, e);
                Err(lost())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::resolve_outgoing;

    #[tokio::test]
    async fn test_call_relays_reply() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let peer = RemotePeer::from_connection(Connection::from_io(ar, aw, "owner"));
        let mut owner = Connection::from_io(br, bw, "hub");

        let responder = tokio::spawn(async move {
            let req = owner.recv().await.unwrap().unwrap();
            assert_eq!(req.kind(), "DropNamespace");
            owner.send(&Message::namespace_ok()).await.unwrap();
        });

        let reply = peer
            .call(&Message::DropNamespace {
                namespace: "n".into(),
            })
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(resolve_outgoing(reply).unwrap(), Message::namespace_ok());
    }

    #[tokio::test]
    async fn test_call_to_closed_owner_is_connection_lost() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let peer = RemotePeer::from_connection(Connection::from_io(ar, aw, "owner"));
        drop(b);

        let err = peer.call(&Message::namespace_ok()).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost { .. }));
    }

    #[test]
    fn test_peer_ids_are_unique() {
        let (a, _b) = tokio::io::duplex(16);
        let (c, _d) = tokio::io::duplex(16);
        let (ar, aw) = tokio::io::split(a);
        let (cr, cw) = tokio::io::split(c);
        let p1 = RemotePeer::from_connection(Connection::from_io(ar, aw, "x"));
        let p2 = RemotePeer::from_connection(Connection::from_io(cr, cw, "y"));
        assert_ne!(p1.id(), p2.id());
    }
}
