//! TCP front end of the game server.
//!
//! One accept loop hands each connection to its own task. Inside a
//! connection the reader decodes request envelopes and spawns a handler task
//! per call; replies go through a queue drained by a dedicated writer task,
//! so slow calls never hold up the socket. When the peer disconnects the
//! server waits for in-flight calls, then evicts any player the connection
//! registered and nobody else claims.

use crate::client_manager::ClientManager;
use crate::service::SyncService;
use crate::store::AuthoritativeStore;
use log::{debug, error, info, warn};
use shared::framing::{read_envelope, write_envelope, FrameConfig, FrameError};
use shared::Envelope;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// RPC server owning the authoritative store.
pub struct Server {
    listener: TcpListener,
    service: SyncService,
    clients: Arc<Mutex<ClientManager>>,
    frame_config: FrameConfig,
}

impl Server {
    /// Binds to `addr`; connections beyond `max_clients` are closed on accept.
    pub async fn bind(addr: &str, max_clients: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("[RPC] Server listening on {}", listener.local_addr()?);

        let clients = Arc::new(Mutex::new(ClientManager::new(max_clients)));
        let service = SyncService::new(Arc::new(AuthoritativeStore::new()), Arc::clone(&clients));

        Ok(Server {
            listener,
            service,
            clients,
            frame_config: FrameConfig::default(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<AuthoritativeStore> {
        Arc::clone(self.service.store())
    }

    /// Accepts connections forever.
    pub async fn run(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let client_id = self.clients.lock().await.add_client(addr);
            let Some(client_id) = client_id else {
                warn!("Server full, refusing connection from {}", addr);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
            }

            let connection = Connection {
                client_id,
                service: self.service.clone(),
                frame_config: self.frame_config.clone(),
            };
            tokio::spawn(connection.serve(stream));
        }
    }
}

/// State for one accepted connection.
struct Connection {
    client_id: u32,
    service: SyncService,
    frame_config: FrameConfig,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer_task = tokio::spawn(Self::write_replies(
            writer,
            reply_rx,
            self.frame_config.clone(),
            self.client_id,
        ));

        let mut calls = self.read_requests(reader, reply_tx).await;
        while calls.join_next().await.is_some() {}
        // Every reply sender is gone now, so the writer drains and exits.
        if let Err(e) = writer_task.await {
            error!("Writer task for connection {} panicked: {}", self.client_id, e);
        }

        let evicted = self.service.disconnect(self.client_id).await;
        info!(
            "Connection {} closed, {} players evicted",
            self.client_id,
            evicted.len()
        );
    }

    /// Reads until the peer goes away, spawning a task per call.
    async fn read_requests(
        &self,
        mut reader: OwnedReadHalf,
        reply_tx: mpsc::UnboundedSender<Envelope>,
    ) -> JoinSet<()> {
        let mut calls = JoinSet::new();

        loop {
            let request = match read_envelope(&mut reader, &self.frame_config).await {
                Ok(request) => request,
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    warn!("Dropping connection {}: {}", self.client_id, e);
                    break;
                }
            };

            let service = self.service.clone();
            let reply_tx = reply_tx.clone();
            let client_id = self.client_id;
            calls.spawn(async move {
                let reply = service.handle(client_id, request.packet).await;
                // The writer is gone only if the socket failed; the peer will
                // see the call fail and retry.
                let _ = reply_tx.send(Envelope::new(request.call_id, reply));
            });

            // Reap finished calls so the set does not grow without bound.
            while calls.try_join_next().is_some() {}
        }

        calls
    }

    async fn write_replies(
        mut writer: OwnedWriteHalf,
        mut reply_rx: mpsc::UnboundedReceiver<Envelope>,
        frame_config: FrameConfig,
        client_id: u32,
    ) {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = write_envelope(&mut writer, &reply, &frame_config).await {
                warn!("Failed to send reply to connection {}: {}", client_id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Packet;

    async fn start_server(max_clients: usize) -> (SocketAddr, Arc<AuthoritativeStore>) {
        let server = Server::bind("127.0.0.1:0", max_clients).await.unwrap();
        let addr = server.local_addr().unwrap();
        let store = server.store();
        tokio::spawn(server.run());
        (addr, store)
    }

    async fn call(stream: &mut TcpStream, call_id: u64, packet: Packet) -> Envelope {
        let config = FrameConfig::default();
        write_envelope(stream, &Envelope::new(call_id, packet), &config)
            .await
            .unwrap();
        read_envelope(stream, &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_reply_echoes_call_id() {
        let (addr, _store) = start_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = call(&mut stream, 41, Packet::GetGameState).await;
        assert_eq!(reply.call_id, 41);
        assert!(matches!(reply.packet, Packet::GameState { .. }));
    }

    #[tokio::test]
    async fn test_pipelined_calls_all_answered() {
        let (addr, _store) = start_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let config = FrameConfig::default();

        for call_id in 1..=5u64 {
            let packet = Packet::UpdatePlayerState {
                player_id: "alice".to_string(),
                row: call_id as i32,
                col: 0,
                seq_num: call_id,
            };
            write_envelope(&mut stream, &Envelope::new(call_id, packet), &config)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let reply = read_envelope(&mut stream, &config).await.unwrap();
            assert!(matches!(reply.packet, Packet::MoveReply { .. }));
            seen.push(reply.call_id);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_dropped_connection_evicts_its_players() {
        let (addr, store) = start_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        call(
            &mut stream,
            1,
            Packet::RegisterPlayer {
                player_id: "ghost".to_string(),
            },
        )
        .await;
        assert!(store.get_game_state().await.get("ghost").is_some());

        drop(stream);

        let evicted = tokio::time::timeout(Duration::from_secs(2), async {
            while store.get_game_state().await.get("ghost").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(evicted.is_ok(), "ghost player was not evicted");
    }

    #[tokio::test]
    async fn test_full_server_closes_extra_connection() {
        let (addr, _store) = start_server(1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        call(&mut first, 1, Packet::GetGameState).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let config = FrameConfig::default();
        // The write may or may not succeed before the close is noticed.
        let _ = write_envelope(&mut second, &Envelope::new(1, Packet::GetGameState), &config).await;
        assert!(read_envelope(&mut second, &config).await.is_err());
    }
}
