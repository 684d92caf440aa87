use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use ditto_core::{ClientError, ConnectFailureKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SessionConfig;

/// One established connection: outbound text frames and inbound text frames.
/// The inbound receiver ends when the connection drops.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens connections to the backend.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<TransportLink, ClientError>> + Send;
}

/// In-process transport whose far end is a [`MemoryPeer`].
pub struct MemoryTransport {
    buffer: usize,
    planned_failures: Mutex<VecDeque<ClientError>>,
    attempts: AtomicU32,
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

/// Backend side of a [`MemoryTransport`].
pub struct MemoryPeer {
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// Backend side of one connection.
pub struct MemoryConnection {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
}

impl MemoryTransport {
    pub fn pair(buffer: usize) -> (Arc<Self>, MemoryPeer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                buffer: buffer.max(1),
                planned_failures: Mutex::new(VecDeque::new()),
                attempts: AtomicU32::new(0),
                accept_tx,
            }),
            MemoryPeer { accept_rx },
        )
    }

    /// A pair whose connections buffer `config.outbound_buffer` frames.
    pub fn for_config(config: &SessionConfig) -> (Arc<Self>, MemoryPeer) {
        Self::pair(config.outbound_buffer)
    }

    /// Make the next connect attempt fail with `err`.
    pub fn fail_next(&self, err: ClientError) {
        self.planned_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    fn open(&self) -> Result<TransportLink, ClientError> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let planned = self
            .planned_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = planned {
            debug!(attempt, error = %err, "memory transport refusing connection");
            return Err(err);
        }

        let (outbound, from_client) = mpsc::channel(self.buffer);
        let (to_client, inbound) = mpsc::channel(self.buffer);
        self.accept_tx
            .send(MemoryConnection {
                from_client,
                to_client,
            })
            .map_err(|_| ClientError::connect(ConnectFailureKind::Default, "memory peer is gone"))?;
        debug!(attempt, "memory transport connected");
        Ok(TransportLink { outbound, inbound })
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<TransportLink, ClientError> {
        self.open()
    }
}

impl MemoryPeer {
    /// Wait for the client's next connection.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accept_rx.recv().await
    }
}

impl MemoryConnection {
    /// Next frame sent by the client, `None` once it disconnected.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn send(&self, frame: impl Into<String>) -> Result<(), ClientError> {
        self.to_client
            .send(frame.into())
            .await
            .map_err(|_| ClientError::session_closed())
    }

    /// Sender for frames to the client, usable from other tasks.
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.to_client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_core::ErrorCategory;

    #[tokio::test]
    async fn exchanges_frames_both_ways() {
        let (transport, mut peer) = MemoryTransport::pair(8);
        let mut link = transport.connect().await.expect("connect should work");
        let mut conn = peer.accept().await.expect("peer should see the connection");

        link.outbound
            .send("START-SEND-EVENTS".into())
            .await
            .expect("send to peer");
        assert_eq!(conn.recv().await.as_deref(), Some("START-SEND-EVENTS"));

        conn.send("START-SEND-EVENTS:ACK").await.expect("send to client");
        assert_eq!(
            link.inbound.recv().await.as_deref(),
            Some("START-SEND-EVENTS:ACK")
        );

        drop(conn);
        assert_eq!(link.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn plays_back_planned_failures() {
        let (transport, _peer) = MemoryTransport::pair(8);
        transport.fail_next(ClientError::connect(ConnectFailureKind::Timeout, "slow"));

        let err = transport.connect().await.expect_err("planned failure");
        assert_eq!(err.category, ErrorCategory::Connect);
        assert_eq!(err.connect_failure_kind(), Some(ConnectFailureKind::Timeout));

        transport.connect().await.expect("second attempt connects");
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn sizes_connection_buffers_from_config() {
        let config = SessionConfig {
            outbound_buffer: 2,
            ..SessionConfig::default()
        };
        let (transport, _peer) = MemoryTransport::for_config(&config);
        let link = transport.connect().await.expect("connect should work");

        link.outbound.try_send("one".into()).expect("first slot");
        link.outbound.try_send("two".into()).expect("second slot");
        assert!(link.outbound.try_send("three".into()).is_err());
    }

    #[tokio::test]
    async fn fails_when_peer_is_gone() {
        let (transport, peer) = MemoryTransport::pair(8);
        drop(peer);
        let err = transport.connect().await.expect_err("nobody accepts");
        assert_eq!(err.connect_failure_kind(), Some(ConnectFailureKind::Default));
    }
}
