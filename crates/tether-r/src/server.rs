use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::Relay;
use tether_engine::protocol::{ObserverMessage, RelayMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// How long a fresh connection may take to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket endpoint in-page observers connect to.
#[derive(Clone)]
pub struct ObserverServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
}

pub struct ServerHandle {
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting new observers. Established connections keep running
    /// until their sessions end.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl ObserverServer {
    pub fn new(addr: SocketAddr, relay: Arc<Relay>) -> Self {
        Self { addr, relay }
    }

    pub async fn start(&self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Observer endpoint listening on: {}", local_addr);

        let relay = self.relay.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted TCP connection from: {}", peer);
                        tokio::spawn(accept_connection(stream, relay.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(ServerHandle { local_addr, task })
    }
}

async fn accept_connection(stream: TcpStream, relay: Arc<Relay>) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Error during the websocket handshake occurred: {}", e);
            return;
        }
    };

    let (window_id, url) = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut ws_stream)).await
    {
        Ok(Some(hello)) => hello,
        Ok(None) => {
            warn!("Observer closed or misbehaved before hello");
            let _ = ws_stream.close(None).await;
            return;
        }
        Err(_) => {
            warn!("Observer did not say hello in time");
            let _ = ws_stream.close(None).await;
            return;
        }
    };

    let mut link = match relay.attach_observer(&window_id, url) {
        Ok(link) => link,
        Err(e) => {
            warn!(window_id = %window_id, error = %e, "Attach failed");
            let _ = ws_stream.close(None).await;
            return;
        }
    };
    let session_id = link.session_id.clone();

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let attached = RelayMessage::Attached {
        session_id: session_id.clone(),
    };
    if let Err(e) = send_json(&mut ws_sender, &attached).await {
        error!(session_id = %session_id, "Failed to acknowledge observer: {}", e);
        relay.detach(&session_id);
        return;
    }

    // Commands from the relay go out; observer emissions come in.
    loop {
        tokio::select! {
            command = link.commands.recv() => {
                let Some(command) = command else {
                    info!(session_id = %session_id, "Session closed by relay, hanging up");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = send_json(&mut ws_sender, &command).await {
                    error!(session_id = %session_id, "Failed to send message to WS: {}", e);
                    break;
                }
            }

            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ObserverMessage>(&text) {
                            Ok(message) => {
                                if let Err(e) = relay.ingest(&session_id, message).await {
                                    warn!(session_id = %session_id, error = %e, "Session no longer accepts input");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, "Failed to parse observer message: {} | Text: {}", e, text);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(session_id = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    relay.detach(&session_id);
}

/// Wait for the observer's `hello`. Anything else first is a protocol error.
async fn read_hello(ws: &mut WebSocketStream<TcpStream>) -> Option<(String, Option<String>)> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ObserverMessage>(&text) {
                    Ok(ObserverMessage::Hello { window_id, url, .. }) => Some((window_id, url)),
                    Ok(other) => {
                        warn!("Expected hello, got {:?}", other);
                        None
                    }
                    Err(e) => {
                        warn!("Failed to parse hello: {} | Text: {}", e, text);
                        None
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send_json<S>(sink: &mut S, message: &RelayMessage) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
