use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use futures::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::WebSocketError;
use crate::hub::registry::ConnectionRegistry;

/// The broadcast engine: owns the [`ConnectionRegistry`] and runs the full
/// lifecycle of every client connection.
///
/// Each inbound text frame is fanned out, best-effort, to every other
/// registered connection. There is no persistence, no retry, and no
/// per-client queueing beyond the outbound channel drained by that
/// connection's send task.
pub struct BroadcastHub {
    registry: Arc<ConnectionRegistry>,
    config: HubConfig,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            config,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accept loop: hands every incoming stream to its own
    /// `handle_connection` task. A failed accept (e.g. a client aborting
    /// mid-connect) is logged and the loop keeps going; only dropping the
    /// listener stops it.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        hub.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                }
            }
        }
    }

    /// Full lifecycle for one client: handshake, register, pump frames until
    /// the connection ends, unregister.
    ///
    /// Registration is released on every exit path. The receive loop and the
    /// send task each run in their own spawned task and resolve to a
    /// [`WebSocketError`] classification of why they ended; a panic in either
    /// is confined to that connection, and the supervising select still
    /// reaches the registry removal below it.
    pub async fn handle_connection(
        self: Arc<Self>,
        raw_stream: TcpStream,
        addr: std::net::SocketAddr,
    ) {
        info!("New WebSocket connection from: {}", addr);

        let ws_stream = match tokio_tungstenite::accept_async(raw_stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Never registered, so there is nothing to clean up
                let err = WebSocketError::HandshakeFailed(e.to_string());
                error!("Connection from {} rejected: {}", addr, err);
                return;
            }
        };

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        self.registry.add(id, tx.clone()).await;

        // Forward queued outbound frames to the WebSocket sink. Each write is
        // bounded by the configured send timeout so one stuck client cannot
        // hold its queue forever.
        let send_timeout = self.config.send_timeout();
        let mut send_task = tokio::spawn(async move {
            let result = forward_outbound(&mut rx, &mut ws_sink, send_timeout).await;

            if let Err(e) = ws_sink.close().await {
                debug!("Error closing WebSocket connection {}: {}", id, e);
            }

            result
        });

        // Receive loop: each text frame is broadcast before the next read,
        // which preserves this sender's frame order for every destination.
        let hub = self.clone();
        let mut receive_task = tokio::spawn(async move {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(Message::Text(payload)) => {
                        hub.broadcast(Some(id), &payload).await;
                    }
                    Ok(Message::Ping(data)) => {
                        if tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(WebSocketError::ConnectionClosed);
                    }
                    Ok(_) => {
                        debug!("Ignoring non-text frame on connection {}", id);
                    }
                    Err(e) => {
                        return Err(WebSocketError::ReceiveFailed(e.to_string()));
                    }
                }
            }

            // End of stream without a close frame
            Ok(())
        });

        // Either side finishing ends the connection; abort the survivor so
        // no task outlives the registry entry.
        let outcome = tokio::select! {
            result = &mut send_task => {
                receive_task.abort();
                result
            }
            result = &mut receive_task => {
                send_task.abort();
                result
            }
        };

        self.registry.remove(&id).await;

        match outcome {
            Ok(Ok(())) => info!("Connection {} closed", id),
            Ok(Err(e @ WebSocketError::ConnectionClosed)) => {
                info!("Connection {} closed: {}", id, e);
            }
            Ok(Err(e)) => warn!("Connection {} closed: {}", id, e),
            Err(e) => error!("Connection {} task failed: {}", id, e),
        }
    }

    /// Fan one payload out to every registered connection, excluding the
    /// source unless echo is configured.
    ///
    /// Iterates a snapshot, so no lock is held while queueing and concurrent
    /// registrations are unaffected. A destination whose channel is gone is
    /// dropped from the registry; that failure never reaches the sender and
    /// never aborts delivery to the remaining connections.
    pub async fn broadcast(&self, source: Option<Uuid>, payload: &str) {
        let snapshot = self.registry.snapshot().await;
        let exclude = if self.config.echo_to_sender { None } else { source };
        let message = Message::Text(payload.to_string());

        for (id, sender) in snapshot {
            if Some(id) == exclude {
                continue;
            }

            if sender.send(message.clone()).is_err() {
                // Its send task is already gone; the connection's own receive
                // loop will race us to remove it, and remove is idempotent.
                let err = WebSocketError::SendFailed("outbound channel closed".to_string());
                warn!("Removing connection {} from registry: {}", id, err);
                self.registry.remove(&id).await;
            }
        }
    }
}

/// Drain the outbound queue into the sink until the queue closes, a write
/// fails, or a write exceeds `send_timeout`. The sink is injected so the
/// timeout bound is testable without a socket.
async fn forward_outbound<S>(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    sink: &mut S,
    send_timeout: Duration,
) -> Result<(), WebSocketError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(message) = rx.recv().await {
        match timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(WebSocketError::SendFailed(e.to_string()));
            }
            Err(_) => {
                return Err(WebSocketError::SendFailed(format!(
                    "write exceeded {:?}",
                    send_timeout
                )));
            }
        }
    }

    // Queue closed: the connection is being torn down
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn test_config(echo_to_sender: bool) -> HubConfig {
        HubConfig {
            send_timeout_secs: 1,
            echo_to_sender,
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = BroadcastHub::new(test_config(false));
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        hub.registry.add(id1, tx1).await;
        hub.registry.add(id2, tx2).await;

        hub.broadcast(Some(id1), "draw:line:10,10,20,20").await;

        match rx2.try_recv() {
            Ok(Message::Text(payload)) => assert_eq!(payload, "draw:line:10,10,20,20"),
            other => panic!("Expected broadcast on connection 2, got {:?}", other),
        }
        assert!(rx2.try_recv().is_err(), "connection 2 received a duplicate");
        assert!(rx1.try_recv().is_err(), "sender received its own broadcast");
    }

    #[tokio::test]
    async fn test_broadcast_echo_to_sender() {
        let hub = BroadcastHub::new(test_config(true));
        let (tx1, mut rx1) = mpsc::unbounded_channel();

        let id1 = Uuid::new_v4();
        hub.registry.add(id1, tx1).await;

        hub.broadcast(Some(id1), "draw:dot:5,5").await;

        match rx1.try_recv() {
            Ok(Message::Text(payload)) => assert_eq!(payload, "draw:dot:5,5"),
            other => panic!("Expected echo to sender, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_removes_dead_connection() {
        let hub = BroadcastHub::new(test_config(false));
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        hub.registry.add(id1, tx1).await;
        hub.registry.add(id2, tx2).await;

        // Simulate connection 1's send task having exited
        drop(rx1);

        hub.broadcast(None, "draw:clear").await;

        // Delivery to connection 2 is unaffected by the failure
        match rx2.try_recv() {
            Ok(Message::Text(payload)) => assert_eq!(payload, "draw:clear"),
            other => panic!("Expected broadcast on connection 2, got {:?}", other),
        }

        // The dead destination was dropped from the registry
        assert_eq!(hub.registry.len().await, 1);
        assert!(!hub.registry.remove(&id1).await);
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_registry_is_noop() {
        let hub = BroadcastHub::new(test_config(false));
        hub.broadcast(None, "draw:line:0,0,1,1").await;
        assert!(hub.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_without_source_reaches_everyone() {
        let hub = BroadcastHub::new(test_config(false));
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        hub.registry.add(Uuid::new_v4(), tx1).await;
        hub.registry.add(Uuid::new_v4(), tx2).await;

        hub.broadcast(None, "draw:clear").await;

        assert!(matches!(rx1.try_recv(), Ok(Message::Text(_))));
        assert!(matches!(rx2.try_recv(), Ok(Message::Text(_))));
    }

    /// Accepts every frame and never completes a flush.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = &'static str;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    /// Fails every write outright.
    struct BrokenSink;

    impl Sink<Message> for BrokenSink {
        type Error = &'static str;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Err("broken pipe"))
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Err("broken pipe")
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Err("broken pipe"))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_forward_outbound_ends_cleanly_when_queue_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = futures::sink::drain();

        tx.send(Message::Text("draw:dot:1,1".to_string())).unwrap();
        drop(tx);

        let result = forward_outbound(&mut rx, &mut sink, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_forward_outbound_classifies_write_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = BrokenSink;

        tx.send(Message::Text("draw:dot:1,1".to_string())).unwrap();

        let result = forward_outbound(&mut rx, &mut sink, Duration::from_secs(1)).await;
        match result {
            Err(WebSocketError::SendFailed(reason)) => assert!(reason.contains("broken pipe")),
            other => panic!("Expected SendFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_outbound_enforces_send_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = StalledSink;

        tx.send(Message::Text("draw:dot:1,1".to_string())).unwrap();

        // The stalled destination is given up on once the bound elapses
        let result = forward_outbound(&mut rx, &mut sink, Duration::from_millis(50)).await;
        match result {
            Err(WebSocketError::SendFailed(reason)) => assert!(reason.contains("exceeded")),
            other => panic!("Expected SendFailed, got {:?}", other),
        }
    }
}
