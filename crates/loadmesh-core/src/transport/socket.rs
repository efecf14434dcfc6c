use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::transport::envelope::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected persistent-socket transport, split into independent
/// send/receive halves so the read pump and write pump can run as separate
/// tasks without contending on a single lock — the pattern used for every
/// bidirectional stream in this codebase.
pub struct SocketTransport {
    outbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: mpsc::Receiver<Envelope>,
}

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

impl SocketTransport {
    /// Connect to `url` (a `ws://` or `wss://` address) and spawn the read
    /// and write pump tasks. Returns once the initial handshake succeeds.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut write_half, mut read_half) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    maybe_envelope = outbound_rx.recv() => {
                        let Some(envelope) = maybe_envelope else { break };
                        let Ok(text) = serde_json::to_string(&envelope) else { continue };
                        if write_half.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if write_half.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("socket write pump exiting");
        });

        tokio::spawn(async move {
            while let Some(message) = read_half.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "dropping malformed envelope"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "socket read error");
                        break;
                    }
                }
            }
            debug!("socket read pump exiting");
        });

        Ok(Self {
            outbound_tx,
            inbound_rx,
        })
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| Error::Connection("socket write pump closed".to_string()))
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound_rx.recv().await
    }
}

/// Reconnect backoff schedule: `5s, 10s, 20s, 40s, 60s`, capped at `60s`
/// thereafter.
pub fn backoff_delay(attempt: u32) -> Duration {
    const SCHEDULE: [u64; 5] = [5, 10, 20, 40, 60];
    let index = (attempt as usize).min(SCHEDULE.len() - 1);
    Duration::from_secs(SCHEDULE[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_doubling_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(4), Duration::from_secs(60));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
        assert_eq!(backoff_delay(1000), Duration::from_secs(60));
    }
}
