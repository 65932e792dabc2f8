//! Wraps a TCP stream with the listener-level timeouts spec §5 calls for:
//! a per-read/per-write inactivity timeout and an overall idle timeout.
//! hyper's own `header_read_timeout` covers request-line/header parsing;
//! this covers everything hyper doesn't already time-bound.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

pub struct TimeoutIo<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    read_deadline: Pin<Box<Sleep>>,
    write_deadline: Pin<Box<Sleep>>,
    idle_deadline: Pin<Box<Sleep>>,
}

impl<S: Unpin> TimeoutIo<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration, idle_timeout: Duration) -> Self {
        let now = Instant::now();
        TimeoutIo {
            inner,
            read_timeout,
            write_timeout,
            idle_timeout,
            read_deadline: Box::pin(tokio::time::sleep_until(now + read_timeout)),
            write_deadline: Box::pin(tokio::time::sleep_until(now + write_timeout)),
            idle_deadline: Box::pin(tokio::time::sleep_until(now + idle_timeout)),
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection timed out")
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutIo<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.read_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }
        if this.idle_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    let now = Instant::now();
                    this.read_deadline.set(tokio::time::sleep_until(now + this.read_timeout));
                    this.idle_deadline.set(tokio::time::sleep_until(now + this.idle_timeout));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }
        if this.idle_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(timed_out()));
        }

        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) if n > 0 => {
                let now = Instant::now();
                this.write_deadline.set(tokio::time::sleep_until(now + this.write_timeout));
                this.idle_deadline.set(tokio::time::sleep_until(now + this.idle_timeout));
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn read_timeout_errors_when_no_data_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut wrapped = TimeoutIo::new(server, Duration::from_millis(20), Duration::from_secs(30), Duration::from_secs(30));
        let mut buf = [0u8; 16];
        let result = wrapped.read(&mut buf).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn activity_resets_the_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut wrapped = TimeoutIo::new(server, Duration::from_millis(200), Duration::from_secs(30), Duration::from_secs(30));
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
