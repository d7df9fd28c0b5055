//! Signaling channel
//!
//! A duplex queue of [`SignalingMessage`]s. The websocket flavor bridges a
//! tokio-tungstenite connection to mpsc queues through a reader and a writer
//! task; the in-memory flavor connects two channels back to back.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use super::signaling::SignalingMessage;
use crate::error::{AppError, Result};

const CHANNEL_CAPACITY: usize = 64;

/// Cloneable handle for sending on a [`SignalingChannel`]
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingMessage>,
}

impl SignalingSender {
    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        trace!("Signaling out: {} id={:?}", message.kind, message.id);
        self.tx
            .send(message)
            .await
            .map_err(|_| AppError::ChannelClosed("signaling".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Duplex signaling message channel
pub struct SignalingChannel {
    sender: SignalingSender,
    inbound: mpsc::Receiver<SignalingMessage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Connect to a websocket signaling server
    pub async fn connect(url: &str, span: Span) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AppError::Signaling(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to signaling server {}", url);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SignalingMessage>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<SignalingMessage>(CHANNEL_CAPACITY);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(4);
        let cancel = CancellationToken::new();

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(
            async move {
                loop {
                    let next = tokio::select! {
                        _ = reader_cancel.cancelled() => break,
                        next = ws_rx.next() => next,
                    };
                    let text = match next {
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = pong_tx.try_send(data.to_vec());
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Signaling server closed the connection: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Signaling connection error: {}", e);
                            break;
                        }
                        None => break,
                    };

                    match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed signaling message: {}", e),
                    }
                }
                debug!("Signaling reader stopped");
            }
            .instrument(span.clone()),
        );

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(
            async move {
                loop {
                    let frame = tokio::select! {
                        _ = writer_cancel.cancelled() => break,
                        Some(data) = pong_rx.recv() => Message::Pong(data.into()),
                        message = out_rx.recv() => match message {
                            Some(message) => match message.to_json() {
                                Ok(json) => Message::Text(json.into()),
                                Err(e) => {
                                    warn!("Failed to serialize signaling message: {}", e);
                                    continue;
                                }
                            },
                            None => break,
                        },
                    };
                    if let Err(e) = ws_tx.send(frame).await {
                        warn!("Signaling send failed: {}", e);
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                debug!("Signaling writer stopped");
            }
            .instrument(span),
        );

        Ok(Self {
            sender: SignalingSender { tx: out_tx },
            inbound: in_rx,
            cancel,
            tasks: vec![reader, writer],
        })
    }

    /// Two channels connected back to back
    ///
    /// What one side sends, the other receives.
    pub fn in_memory() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let local = Self {
            sender: SignalingSender { tx: a_tx },
            inbound: b_rx,
            cancel: CancellationToken::new(),
            tasks: vec![],
        };
        let remote = Self {
            sender: SignalingSender { tx: b_tx },
            inbound: a_rx,
            cancel: CancellationToken::new(),
            tasks: vec![],
        };
        (local, remote)
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.sender.send(message).await
    }

    /// Next inbound message, `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.recv().await
    }

    /// Stop the bridge tasks; pending inbound messages are dropped
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.inbound.close();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pair() {
        let (local, mut remote) = SignalingChannel::in_memory();
        let sender = local.sender();

        sender.send(SignalingMessage::connected(false)).await.unwrap();
        let received = remote.recv().await.unwrap();
        assert!(received.sender);

        remote
            .send(SignalingMessage::error("viewer", "bye"))
            .await
            .unwrap();
        let mut local = local;
        assert_eq!(local.recv().await.unwrap().data, "bye");
    }

    #[tokio::test]
    async fn test_closed_peer_ends_stream() {
        let (mut local, remote) = SignalingChannel::in_memory();
        let sender = local.sender();
        drop(remote);

        assert!(local.recv().await.is_none());
        assert!(sender.send(SignalingMessage::connected(false)).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let result = SignalingChannel::connect("ws://127.0.0.1:1/ws", Span::none()).await;
        assert!(matches!(result, Err(AppError::Signaling(_))));
    }
}
