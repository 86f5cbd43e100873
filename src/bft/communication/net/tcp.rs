//! A minimal tokio TCP transport.
//!
//! Grounded on `sug0-bafomet`'s own `Node<O>` connect/accept task-spawning
//! pattern (`tx_side_connect_task`/`rx_side_accept_task`), stripped of its
//! TLS handshake: the spec's signature layer already authenticates every
//! envelope end-to-end, so a second, transport-level security layer isn't
//! needed by the core. Frames are length-prefixed `bincode`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::bft::async_runtime as rt;
use crate::bft::communication::message::Envelope;
use crate::bft::communication::{NodeId, Transport};

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// A tokio-backed `Transport`. Outgoing frames are queued on a per-peer
/// channel drained by a dedicated writer task; incoming frames are decoded
/// by the accept loop and pushed onto the shared inbound channel.
pub struct TcpTransport<O> {
    id: NodeId,
    out: Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>>,
    _marker: std::marker::PhantomData<O>,
}

impl<O> Clone for TcpTransport<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            out: Arc::clone(&self.out),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<O> Transport<O> for TcpTransport<O>
where
    O: Serialize + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, envelope: Envelope<O>) {
        let bytes = match bincode::serialize(&envelope) {
            Ok(b) => b,
            Err(_) => return,
        };
        if let Some(tx) = self.out.lock().get(&to) {
            let _ = tx.send(bytes);
        }
    }
}

impl<O> TcpTransport<O>
where
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Binds a listener for `id` and starts connecting to every peer in
    /// `peer_addrs`. Returns the transport handle plus the receiving end of
    /// the inbound envelope channel.
    pub async fn bind(
        id: NodeId,
        bind_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Envelope<O>>)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let out = Arc::new(Mutex::new(HashMap::new()));
        for (&peer_id, &addr) in &peer_addrs {
            if peer_id == id {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            out.lock().insert(peer_id, tx);
            rt::spawn(writer_task(addr, rx));
        }

        rt::spawn(accept_task(listener, inbound_tx));

        Ok((
            Self {
                id,
                out,
                _marker: std::marker::PhantomData,
            },
            inbound_rx,
        ))
    }
}

async fn writer_task(addr: SocketAddr, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    const RETRY_DELAY: Duration = Duration::from_millis(500);

    let mut stream = None;
    while let Some(frame) = rx.recv().await {
        loop {
            if stream.is_none() {
                stream = TcpStream::connect(addr).await.ok();
                if stream.is_none() {
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            }
            let sock = stream.as_mut().unwrap();
            match write_frame(sock, &frame).await {
                Ok(()) => break,
                Err(_) => {
                    stream = None;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

async fn accept_task<O>(listener: TcpListener, inbound_tx: mpsc::UnboundedSender<Envelope<O>>)
where
    O: DeserializeOwned + Send + 'static,
{
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => continue,
        };
        let inbound_tx = inbound_tx.clone();
        rt::spawn(connection_task(stream, inbound_tx));
    }
}

async fn connection_task<O>(mut stream: TcpStream, inbound_tx: mpsc::UnboundedSender<Envelope<O>>)
where
    O: DeserializeOwned + Send + 'static,
{
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let envelope: Envelope<O> = match bincode::deserialize(&frame) {
            Ok(envelope) => envelope,
            Err(_) => continue,
        };
        if inbound_tx.send(envelope).is_err() {
            return;
        }
    }
}
