//! Request/reply transport over one TCP connection.
//!
//! Calls are tagged with a call id and may overlap: a reader task routes each
//! reply to the caller waiting on that id, so a slow snapshot request never
//! holds up a move.

use log::{debug, warn};
use shared::framing::{read_envelope, write_frame, FrameConfig, FrameError};
use shared::{Envelope, Packet};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// A call that did not produce a reply.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed before the reply arrived")]
    ConnectionClosed,
}

/// Something that can carry one request to the server and bring back its reply.
///
/// A server-side rejection comes back as `Ok(Packet::Error { .. })`; `Err`
/// always means the call itself failed and may be retried.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, request: Packet) -> impl Future<Output = Result<Packet, RpcError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Packet>>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Pending {
    /// Fails every outstanding call and refuses new ones. Frames already
    /// queued are still written before the writer shuts the stream down.
    fn shut(&mut self) {
        self.waiters.clear();
        self.outgoing = None;
    }
}

/// RPC client for the grid server.
///
/// Frames are written by one writer task fed through a queue, so a caller
/// that gives up on a call can never leave half a frame on the stream.
pub struct RpcClient {
    peer: SocketAddr,
    pending: Arc<Mutex<Pending>>,
    next_call_id: AtomicU64,
    frame_config: FrameConfig,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("frame_config", &self.frame_config)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub async fn connect(addr: &str, frame_config: FrameConfig) -> Result<Self, RpcError> {
        let connect_error = |source| RpcError::Connect {
            addr: addr.to_string(),
            source,
        };

        let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
        let peer = stream.peer_addr().map_err(connect_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(Pending {
            outgoing: Some(outgoing_tx),
            ..Pending::default()
        }));

        let reader = tokio::spawn(Self::read_replies(
            reader,
            Arc::clone(&pending),
            frame_config.clone(),
        ));
        let writer = tokio::spawn(Self::write_requests(
            writer,
            outgoing_rx,
            Arc::clone(&pending),
            frame_config.clone(),
        ));

        Ok(RpcClient {
            peer,
            pending,
            next_call_id: AtomicU64::new(1),
            frame_config,
            reader,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends `request` and waits for its reply.
    ///
    /// Dropping the returned future abandons the reply only; a request that
    /// was queued still goes out whole.
    pub async fn call(&self, request: Packet) -> Result<Packet, RpcError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let payload = Envelope::new(call_id, request)
            .encode()
            .map_err(FrameError::from)?;
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if size > self.frame_config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.frame_config.max_payload_size,
            }
            .into());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let queued = pending
                .outgoing
                .as_ref()
                .is_some_and(|outgoing| outgoing.send(payload).is_ok());
            if !queued {
                return Err(RpcError::ConnectionClosed);
            }
            pending.waiters.insert(call_id, reply_tx);
        }

        reply_rx.await.map_err(|_| RpcError::ConnectionClosed)
    }

    /// Shuts the connection down once queued frames are written; outstanding
    /// calls fail with [`RpcError::ConnectionClosed`].
    pub async fn close(&self) {
        self.pending.lock().await.shut();
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                debug!("Writer task for {} ended abnormally: {}", self.peer, e);
            }
        }
        self.reader.abort();
    }

    async fn write_requests(
        mut writer: OwnedWriteHalf,
        mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
        pending: Arc<Mutex<Pending>>,
        frame_config: FrameConfig,
    ) {
        while let Some(payload) = outgoing.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload, &frame_config).await {
                warn!("Sending to server failed: {}", e);
                pending.lock().await.shut();
                return;
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of connection failed: {}", e);
        }
    }

    async fn read_replies(
        mut reader: OwnedReadHalf,
        pending: Arc<Mutex<Pending>>,
        frame_config: FrameConfig,
    ) {
        loop {
            match read_envelope(&mut reader, &frame_config).await {
                Ok(reply) => {
                    let waiter = pending.lock().await.waiters.remove(&reply.call_id);
                    match waiter {
                        // The caller may have given up on this call already.
                        Some(reply_tx) => {
                            let _ = reply_tx.send(reply.packet);
                        }
                        None => debug!("Reply for unknown call {}", reply.call_id),
                    }
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Connection to server failed: {}", e);
                    break;
                }
            }
        }

        pending.lock().await.shut();
    }
}

impl Transport for RpcClient {
    async fn call(&self, request: Packet) -> Result<Packet, RpcError> {
        RpcClient::call(self, request).await
    }

    async fn close(&self) {
        RpcClient::close(self).await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}
