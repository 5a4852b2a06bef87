//! One-shot TCP exchanges of length-prefixed envelopes.
//!
//! Each frame is a big endian `u32` length followed by that many bytes of
//! bincode. A connection carries one request and at most one response; the
//! PUT path writes one frame and closes.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use derive_more::Display;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::{TcpListener, TcpSocket, TcpStream},
    time::sleep,
};
use tracing::warn;

use crate::envelope::Envelope;

pub const MAX_FRAME_LEN: usize = 65536;

pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Display)]
pub enum WireError {
    #[display(fmt = "transport failure: {}", _0)]
    Transport(io::Error),
    #[display(fmt = "malformed envelope: {}", _0)]
    Decode(bincode::Error),
    #[display(fmt = "frame of {} bytes exceeds limit", _0)]
    FrameTooLarge(usize),
}

impl std::error::Error for WireError {}

impl WireError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub async fn write_envelope<W>(stream: &mut W, envelope: &Envelope) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = envelope.encode()?;
    async {
        stream.write_u32(buf.len() as _).await?;
        stream.write_all(&buf).await?;
        stream.flush().await
    }
    .await
    .map_err(WireError::Transport)?;
    Ok(())
}

pub async fn read_envelope<R>(stream: &mut R) -> crate::Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await.map_err(WireError::Transport)? as usize;
    if len > MAX_FRAME_LEN {
        Err(WireError::FrameTooLarge(len))?
    }
    let mut buf = vec![0; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(WireError::Transport)?;
    Envelope::decode(&buf)
}

pub async fn connect(remote_addr: SocketAddr) -> crate::Result<BufStream<TcpStream>> {
    let stream = TcpStream::connect(remote_addr)
        .await
        .map_err(WireError::Transport)?;
    stream.set_nodelay(true).map_err(WireError::Transport)?;
    Ok(BufStream::new(stream))
}

/// Delivers `envelope` on a fresh connection without waiting for an answer.
pub async fn send_to(remote_addr: SocketAddr, envelope: &Envelope) -> crate::Result<()> {
    let mut stream = connect(remote_addr).await?;
    write_envelope(&mut stream, envelope).await?;
    stream
        .get_mut()
        .shutdown()
        .await
        .map_err(WireError::Transport)?;
    Ok(())
}

/// Sends `envelope` on a fresh connection and blocks for the single response.
pub async fn call(remote_addr: SocketAddr, envelope: &Envelope) -> crate::Result<Envelope> {
    let mut stream = connect(remote_addr).await?;
    write_envelope(&mut stream, envelope).await?;
    read_envelope(&mut stream).await
}

pub fn bind(addr: SocketAddr) -> crate::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(4096)?)
}

/// Accepts the next connection. Failures such as descriptor exhaustion are
/// logged and retried after [`ACCEPT_BACKOFF`], never returned.
pub async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    accept_retrying(move || listener.accept()).await
}

async fn accept_retrying<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                warn!("accept failed: {err}, retrying in {ACCEPT_BACKOFF:?}");
                sleep(ACCEPT_BACKOFF).await
            }
        }
    }
}
