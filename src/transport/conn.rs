//! Framed connection shared by both sides of the control channel
//!
//! One task per connection runs `listen`, reading frames in order and
//! dispatching each to the owner's `MessageHandler` before reading the next.
//! Sends may come from any task; they are serialized by the writer lock.

use crate::error::TransportError;
use crate::protocol::{decode_message, encode_message, read_frame, Message};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callbacks invoked from a connection's receive loop
///
/// `handle_message` runs on the receive loop itself, so frames are handled
/// strictly in arrival order. Long-running work must be spawned.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, conn: &Arc<Connection>, msg: Message);

    /// Called exactly once, after the receive loop has exited.
    async fn connection_closed(&self, conn: &Arc<Connection>);
}

/// A framed control-channel connection
pub struct Connection {
    id: RwLock<String>,
    peer_addr: Option<SocketAddr>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an established stream. The connection gets a transient id until
    /// the peer identifies itself.
    pub fn new(stream: TcpStream) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            id: RwLock::new(format!("unknown-{}", Uuid::new_v4().simple())),
            peer_addr,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed,
        })
    }

    /// Dial a peer
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Arc<Self>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    pub fn id(&self) -> String {
        self.id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the transient id with the one the peer declared
    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = id.into();
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Run the receive loop until the stream fails or `close` is called.
    ///
    /// Any read or decode error ends the loop; the socket is then closed and
    /// `connection_closed` fires once.
    pub async fn listen<H>(self: Arc<Self>, handler: Arc<H>)
    where
        H: MessageHandler + ?Sized,
    {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut reader) = reader else {
            warn!(conn_id = %self.id(), "Connection is already being listened on");
            return;
        };

        info!(conn_id = %self.id(), peer = ?self.peer_addr, "Started listening for events");

        let mut closed_rx = self.closed.subscribe();
        let result = loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = closed_rx.wait_for(|closed| *closed) => break Ok(()),
            };

            let (event_id, body) = match frame {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };

            debug!(conn_id = %self.id(), event_id, len = body.len(), "Incoming message");

            let msg = match decode_message(event_id, body) {
                Ok(msg) => msg,
                Err(e) => break Err(TransportError::from(e)),
            };

            handler.handle_message(&self, msg).await;
        };

        match result {
            Ok(()) => {}
            Err(TransportError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!(conn_id = %self.id(), "Connection closed by peer");
            }
            Err(e) => {
                error!(conn_id = %self.id(), error = %e, "Error while handling connection");
            }
        }

        drop(reader);
        self.close().await;
        info!(conn_id = %self.id(), "Connection closed");

        handler.connection_closed(&self).await;
    }

    /// Encode and send a message
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = encode_message(msg)?;
        debug!(
            conn_id = %self.id(),
            event = %msg.event_type(),
            len = frame.len(),
            "Sending message"
        );
        self.send_frame(&frame).await
    }

    /// Send a pre-encoded frame
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let w = writer
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.id()))?;
        w.write_all(frame).await?;
        Ok(())
    }

    /// Same as `send` but logs failures, for fire-and-forget paths
    pub async fn send_or_log(&self, msg: &Message) {
        if let Err(e) = self.send(msg).await {
            error!(
                conn_id = %self.id(),
                event = %msg.event_type(),
                error = %e,
                "Failed sending message"
            );
        }
    }

    /// Close the connection. The receive loop exits and no further sends
    /// succeed. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.send_replace(true);

        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StartShardsData, StopShardData};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Recorder {
        messages: mpsc::UnboundedSender<Message>,
        closed: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, _conn: &Arc<Connection>, msg: Message) {
            let _ = self.messages.send(msg);
        }

        async fn connection_closed(&self, conn: &Arc<Connection>) {
            let _ = self.closed.send(conn.id());
        }
    }

    async fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Connection::connect(addr), listener.accept());
        (client.unwrap(), Connection::new(accepted.unwrap().0))
    }

    fn recorder() -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ctx, crx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                messages: tx,
                closed: ctx,
            }),
            rx,
            crx,
        )
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (client, server) = pair().await;
        let (handler, mut rx, _closed) = recorder();
        tokio::spawn(server.listen(handler));

        for shard_id in 0..20 {
            client
                .send(&Message::StopShard(StopShardData { shard_id }))
                .await
                .unwrap();
        }

        for expected in 0..20 {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, Message::StopShard(StopShardData { shard_id: expected }));
        }
    }

    #[tokio::test]
    async fn close_handler_fires_once_when_peer_disconnects() {
        let (client, server) = pair().await;
        server.set_id("node-under-test");
        let (handler, _rx, mut closed) = recorder();
        let task = tokio::spawn(server.clone().listen(handler));

        client
            .send(&Message::StartShards(StartShardsData { shard_ids: vec![1] }))
            .await
            .unwrap();
        client.close().await;

        let id = tokio::time::timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "node-under-test");

        task.await.unwrap();
        assert!(closed.try_recv().is_err());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn local_close_stops_listen_and_rejects_sends() {
        let (_client, server) = pair().await;
        let (handler, _rx, mut closed) = recorder();
        let task = tokio::spawn(server.clone().listen(handler));

        server.close().await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(closed.recv().await.is_some());

        let err = server.send(&Message::Shutdown).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }

    #[tokio::test]
    async fn unknown_event_closes_connection() {
        let (client, server) = pair().await;
        let (handler, mut rx, mut closed) = recorder();
        tokio::spawn(server.listen(handler));

        client
            .send_frame(&crate::protocol::encode_frame(55, &[]))
            .await
            .unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transient_ids_are_unique() {
        let (a, b) = pair().await;
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("unknown-"));
    }
}
