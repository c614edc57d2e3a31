use crate::BroadcastMessage;
use dubline_engine::EngineEvent;
use dubline_proto::protocol::{Broadcast, Command, EngineState, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_rx: watch::Receiver<EngineState>,
    event_tx: mpsc::Sender<EngineEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
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
        serve(listener, state_rx, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    state_rx: watch::Receiver<EngineState>,
    event_tx: mpsc::Sender<EngineEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let state_rx = state_rx.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    handle_client(stream, id, state_rx, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    client_id: usize,
    mut state_rx: watch::Receiver<EngineState>,
    event_tx: mpsc::Sender<EngineEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: state_rx.borrow_and_update().clone(),
    };
    if let Ok(encoded) = Message::Broadcast(hello).encode() {
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
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(Command::GetState), consumed)) => {
                                    read_buf.drain(..consumed);
                                    let state = state_rx.borrow().clone();
                                    if let Ok(encoded) = encode_state(state) {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(EngineEvent::Command(cmd)).await.is_err() {
                                        warn!("Engine event channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if let Ok(encoded) = encode_state(state) {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::Caption(text)) => Broadcast::Caption { text },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        continue;
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn encode_state(state: EngineState) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
