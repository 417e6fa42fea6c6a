//! Accept-side sockets.

use std::io;

/// How a client reached the server; drives auth method selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transport {
    Tcp,
    Unix,
}

/// An accepted client stream, either TCP or a unix socket, implementing
/// `AsyncRead` and `AsyncWrite` transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Socket {
    pub fn transport(&self) -> Transport {
        match self.kind {
            Kind::Tcp(_) => Transport::Tcp,
            #[cfg(unix)]
            Kind::Unix(_) => Transport::Unix,
        }
    }
}

/// A listening endpoint handing out [`Socket`]s.
pub struct Listener {
    kind: ListenerKind,
}

enum ListenerKind {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    pub async fn bind_tcp(addr: &str) -> io::Result<Listener> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Listener { kind: ListenerKind::Tcp(listener) })
    }

    #[cfg(unix)]
    pub fn bind_unix(path: &str) -> io::Result<Listener> {
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Listener { kind: ListenerKind::Unix(listener) })
    }

    pub async fn accept(&self) -> io::Result<Socket> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (socket, _) = listener.accept().await?;
                socket.set_nodelay(true)?;
                Ok(Socket { kind: Kind::Tcp(socket) })
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (socket, _) = listener.accept().await?;
                Ok(Socket { kind: Kind::Unix(socket) })
            }
        }
    }
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_shutdown(cx),
        }
    }
}
