use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Connection to an origin, with the timeouts the [`Connector`](crate::Connector)
/// was configured with.
///
/// Writes through [`Socket::write_all`] and [`Socket::flush`] fail with
/// `TimedOut` once the write timeout passes. The read timeout is not applied
/// here; it bounds reading a whole response.
#[derive(Debug)]
pub struct Socket {
  stream: Upstream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

#[derive(Debug)]
enum Upstream {
  Plain(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
  pub(crate) fn new(
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Socket {
      stream: Upstream::Plain(stream),
      read_timeout,
      write_timeout,
    }
  }

  /// Hand the plain stream to `handshake` and keep the TLS stream it returns.
  pub(crate) async fn tls<F, Fut>(self, handshake: F) -> io::Result<Self>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = io::Result<TlsStream<TcpStream>>>,
  {
    let Upstream::Plain(tcp) = self.stream else {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "connection is already encrypted",
      ));
    };
    Ok(Socket {
      stream: Upstream::Tls(Box::new(handshake(tcp).await?)),
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
    })
  }

  /// Bound on reading one whole response from this socket.
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }

  /// Write all of `buf`, within the write timeout.
  pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    let timeout = self.write_timeout;
    deadline(timeout, AsyncWriteExt::write_all(self, buf)).await
  }

  /// Flush buffered bytes to the origin, within the write timeout.
  pub async fn flush(&mut self) -> io::Result<()> {
    let timeout = self.write_timeout;
    deadline(timeout, AsyncWriteExt::flush(self)).await
  }
}

async fn deadline<F>(timeout: Option<Duration>, op: F) -> io::Result<()>
where
  F: Future<Output = io::Result<()>>,
{
  match timeout {
    Some(t) => tokio::time::timeout(t, op).await?,
    None => op.await,
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match &mut self.get_mut().stream {
      Upstream::Plain(s) => Pin::new(s).poll_read(cx, buf),
      Upstream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match &mut self.get_mut().stream {
      Upstream::Plain(s) => Pin::new(s).poll_write(cx, buf),
      Upstream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match &mut self.get_mut().stream {
      Upstream::Plain(s) => Pin::new(s).poll_flush(cx),
      Upstream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match &mut self.get_mut().stream {
      Upstream::Plain(s) => Pin::new(s).poll_shutdown(cx),
      Upstream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  async fn pair(write_timeout: Option<Duration>) -> (Socket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp = TcpStream::connect(listener.local_addr().unwrap())
      .await
      .unwrap();
    let (peer, _) = listener.accept().await.unwrap();
    (Socket::new(tcp, None, write_timeout), peer)
  }

  #[tokio::test]
  async fn timed_writes_reach_the_peer() {
    let (mut socket, mut peer) = pair(Some(Duration::from_secs(5))).await;
    socket.write_all(b"ping").await.unwrap();
    socket.flush().await.unwrap();
    let mut got = [0; 4];
    peer.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"ping");
  }

  #[tokio::test]
  async fn failed_handshake_surfaces_its_error() {
    let (socket, _peer) = pair(None).await;
    let err = socket
      .tls(|_tcp| async { Err(io::Error::new(io::ErrorKind::InvalidData, "bad hello")) })
      .await
      .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }
}
