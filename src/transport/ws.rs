//! WebSocket transport backed by tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Transport, TransportEvent, TransportFactory};
use crate::error::TransportError;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_BUFFER: usize = 100;

pub struct WebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let mut guard = self.ws_sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        debug!(target: "Calls/Transport", "--> {} bytes", text.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct WebSocketFactory;

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn dial(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        debug!(target: "Calls/Transport", "dialing {url}");
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let (sink, stream) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        events_tx
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::Closed)?;

        tokio::spawn(read_pump(stream, events_tx));

        let transport = Arc::new(WebSocketTransport {
            ws_sink: Mutex::new(Some(sink)),
        });
        Ok((transport, events_rx))
    }
}

async fn read_pump(mut stream: WsStream, events: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Calls/Transport", "<-- {} bytes", text.len());
                if events
                    .send(TransportEvent::MessageReceived(text.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                // Binary and ping/pong frames are not part of the contract.
            }
            Some(Err(e)) => {
                warn!(target: "Calls/Transport", "websocket read error: {e}");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Disconnected).await;
}
