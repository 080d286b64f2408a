//! Bidirectional message channels.
//!
//! A [`Connection`] is any pair of byte streams: the two halves of a TCP
//! socket, the stdin/stdout pipes of a spawned subprocess, or this process's
//! own stdio. The handler and the client façade only ever see messages.

use crate::protocol::frame::{self, Outgoing};
use crate::protocol::Message;
use crate::{BrokerError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Child;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed message channel to one peer.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer: String,
    // Held so the subprocess is killed when the connection goes away.
    _child: Option<Child>,
    _slot: Option<ConnectionSlot>,
}

/// One unit of a server's connection budget, given back on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    /// Take a slot unless `max` are already in use.
    pub fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    /// Wrap arbitrary reader/writer halves.
    pub fn from_io<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
            _child: None,
            _slot: None,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown:?".to_string());
        let (reader, writer) = stream.into_split();
        Self::from_io(reader, writer, peer)
    }

    /// Talk to a subprocess over its standard input and output.
    pub fn from_child(mut child: Child, label: impl Into<String>) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Other("subprocess has no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Other("subprocess has no stdout pipe".to_string()))?;
        let mut conn = Self::from_io(stdout, stdin, label);
        conn._child = Some(child);
        Ok(conn)
    }

    /// This process's stdin/stdout as one connection.
    pub fn stdio() -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }

    /// Keep `slot` taken for as long as this connection is open, whoever
    /// ends up owning it.
    pub fn holding(mut self, slot: ConnectionSlot) -> Self {
        self._slot = Some(slot);
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let bytes = frame::encode(msg)?;
        frame::write_frame(&mut self.writer, &bytes).await
    }

    /// Send an encoded reply, size-hinted if the receiver allows it.
    pub async fn send_encoded(&mut self, kind: &str, encoded: Vec<u8>, recv_caps: u32) -> Result<()> {
        let outgoing = frame::prepare_outgoing(kind, encoded, recv_caps)?;
        self.send_outgoing(outgoing).await
    }

    /// Send frames exactly as prepared (or as received, when relaying).
    pub async fn send_outgoing(&mut self, outgoing: Outgoing) -> Result<()> {
        match outgoing {
            Outgoing::Plain(bytes) => frame::write_frame(&mut self.writer, &bytes).await,
            Outgoing::Hinted { hint, payload } => {
                self.send(&hint).await?;
                frame::write_frame_blocks(&mut self.writer, &payload).await
            }
        }
    }

    /// Next raw frame, `None` on clean EOF.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        frame::read_frame(&mut self.reader).await
    }

    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.recv_frame().await? {
            Some(bytes) => frame::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Next reply in relayable form: a plain frame kept as bytes, or a hint
    /// together with the payload frame it announces.
    pub async fn recv_outgoing(&mut self) -> Result<Option<Outgoing>> {
        let Some(bytes) = self.recv_frame().await? else {
            return Ok(None);
        };
        match frame::decode(&bytes) {
            Ok(hint @ Message::DataSizeHint { .. }) => {
                let payload = self.recv_hinted_payload(&hint).await?;
                Ok(Some(Outgoing::Hinted { hint, payload }))
            }
            _ => Ok(Some(Outgoing::Plain(bytes))),
        }
    }

    /// Next message, transparently resolving a size hint.
    pub async fn recv_resolved(&mut self) -> Result<Option<Message>> {
        match self.recv().await? {
            Some(hint @ Message::DataSizeHint { .. }) => {
                let payload = self.recv_hinted_payload(&hint).await?;
                resolve_outgoing(Outgoing::Hinted { hint, payload }).map(Some)
            }
            other => Ok(other),
        }
    }

    pub(crate) async fn recv_hinted_payload(&mut self, hint: &Message) -> Result<Vec<u8>> {
        let Message::DataSizeHint { length, .. } = hint else {
            return Err(BrokerError::protocol("expected DataSizeHint"));
        };
        let payload = self
            .recv_frame()
            .await?
            .ok_or_else(|| BrokerError::ConnectionLost {
                peer: self.peer.clone(),
            })?;
        if payload.len() as u64 != *length {
            return Err(BrokerError::protocol(format!(
                "payload of {} B does not match announced {} B",
                payload.len(),
                length
            )));
        }
        Ok(payload)
    }
}

/// Decode whatever message an [`Outgoing`] carries.
pub fn resolve_outgoing(outgoing: Outgoing) -> Result<Message> {
    match outgoing {
        Outgoing::Plain(bytes) => frame::decode(&bytes),
        Outgoing::Hinted {
            hint: Message::DataSizeHint { format, .. },
            payload,
        } => frame::decode_hinted(&format, &payload),
        Outgoing::Hinted { hint, .. } => Err(BrokerError::protocol(format!(
            "payload announced by {} instead of DataSizeHint",
            hint.kind()
        ))),
    }
}
