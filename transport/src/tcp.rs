//! Reference wire transport: one TCP connection per RPC, carrying a 4-byte
//! big-endian length prefix followed by a `serde_json`-encoded payload. Not
//! the only possible transport — anything implementing `TransportSender` /
//! `TransportListener` plugs into the core the same way — but it's the one
//! this crate ships so the core is runnable over a real network out of the
//! box.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use kad_logic::rpc::{
    Request, Response, TransportError, TransportListener as KadTransportListener, TransportSender,
};
use kad_logic::Contact;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{instrument, warn};

use crate::shutdown::ShutdownReceiver;

/// Frames larger than this are rejected outright rather than read into
/// memory; comfortably above the default `StorageConfig::max_value_size`
/// (128 KiB) plus JSON/envelope overhead.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await
}

async fn read_frame(stream: &mut TcpStream, max_len: u32) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds the maximum allowed size",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

fn io_err(err: impl ToString) -> TransportError {
    TransportError::Transport(err.to_string())
}

/// The RPC client half: dials `to`'s host/port fresh for every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSender;

impl TransportSender for TcpSender {
    type Fut = Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send>>;

    fn send(&self, to: &Contact, request: Request) -> Self::Fut {
        let addr = SocketAddr::new(to.host(), to.port());
        Box::pin(async move {
            let mut stream = TcpStream::connect(addr).await.map_err(io_err)?;
            let payload = serde_json::to_vec(&request).map_err(io_err)?;
            write_frame(&mut stream, &payload).await.map_err(io_err)?;
            let reply = read_frame(&mut stream, MAX_FRAME_BYTES)
                .await
                .map_err(io_err)?;
            serde_json::from_slice(&reply).map_err(io_err)
        })
    }
}

async fn handle_connection<L: KadTransportListener>(
    mut stream: TcpStream,
    source_host: IpAddr,
    listener: Arc<L>,
) -> std::io::Result<()> {
    let payload = read_frame(&mut stream, MAX_FRAME_BYTES).await?;
    let request: Request = serde_json::from_slice(&payload)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let response = listener.on_request(source_host, request).await;
    let payload = serde_json::to_vec(&response)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    write_frame(&mut stream, &payload).await
}

/// Accepts connections on `addr` and dispatches each one into `listener`,
/// until `shutdown` fires. One task is spawned per accepted connection so a
/// slow or malicious peer can't stall the others.
#[instrument(skip(listener, shutdown))]
pub async fn serve<L: KadTransportListener + 'static>(
    addr: SocketAddr,
    listener: Arc<L>,
    mut shutdown: ShutdownReceiver,
) -> std::io::Result<()> {
    let tcp = TcpListener::bind(addr).await?;
    loop {
        tokio::select! {
            accepted = tcp.accept() => {
                let (stream, peer) = accepted?;
                let listener = listener.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer.ip(), listener).await {
                        warn!(%peer, %err, "connection failed");
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }
    Ok(())
}
