//! TCP event/command socket: the only channel between the player core and a
//! decoupled presentation layer.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use playdeck_proto::protocol::{Command, Event, Message, PlayerState, PROTOCOL_VERSION};

use crate::Outbound;

pub fn start_server(
    bind_address: String,
    port: u16,
    shared_state: Arc<RwLock<PlayerState>>,
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<Outbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let state = shared_state.clone();
                    let tx = cmd_tx.clone();
                    let events_rx = events_tx.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, state, id, tx, events_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    shared_state: Arc<RwLock<PlayerState>>,
    client_id: usize,
    cmd_tx: mpsc::Sender<Command>,
    mut events_rx: broadcast::Receiver<Outbound>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    if let Ok(encoded) = encode_hello(&shared_state).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 {
                                break;
                            }
                            let frame_len = u32::from_be_bytes([
                                read_buf[0], read_buf[1], read_buf[2], read_buf[3],
                            ]) as usize;
                            if read_buf.len() < 4 + frame_len {
                                break;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    if cmd_tx.send(cmd).await.is_err() {
                                        warn!("core inbox closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    // Full frame that does not parse: drop it
                                    // rather than wedging the stream.
                                    warn!("Client {} sent undecodable frame: {}", client_id, e);
                                    read_buf.drain(..4 + frame_len);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = events_rx.recv() => {
                match msg {
                    Ok(outbound) => {
                        let message = Message::Event {
                            context: outbound.context,
                            event: outbound.event,
                        };
                        if let Ok(encoded) = message.encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} events", client_id, n);
                        if let Ok(encoded) = encode_state(&shared_state).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn encode_hello(shared_state: &Arc<RwLock<PlayerState>>) -> anyhow::Result<Vec<u8>> {
    let state = shared_state.read().await.clone();
    Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        state,
    }
    .encode()
}

/// Fresh full-state snapshot for clients that lagged behind the broadcast.
async fn encode_state(shared_state: &Arc<RwLock<PlayerState>>) -> anyhow::Result<Vec<u8>> {
    let state = shared_state.read().await.clone();
    let context = state.context;
    Message::Event {
        context,
        event: Event::State { data: state },
    }
    .encode()
}
