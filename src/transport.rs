use std::{
    fmt,
    io::{Read, Write},
    net::SocketAddr,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// A real connection to be shared by virtual sockets.
pub enum Transport {
    /// Serviced by the shared readiness-driven input task.
    Async(AsyncTransport),
    /// Gets a dedicated reader thread; for streams without readiness support.
    Blocking(BlockingTransport),
}

impl Transport {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Async(t) => t.local_addr,
            Transport::Blocking(t) => t.local_addr,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Async(t) => t.peer_addr,
            Transport::Blocking(t) => t.peer_addr,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Transport::Async(_) => "Async",
            Transport::Blocking(_) => "Blocking",
        };
        f.debug_struct("Transport")
            .field("kind", &kind)
            .field("local_addr", &self.local_addr())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl From<tokio::net::TcpStream> for Transport {
    fn from(stream: tokio::net::TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Transport::Async(AsyncTransport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr,
            peer_addr,
        })
    }
}

impl From<AsyncTransport> for Transport {
    fn from(transport: AsyncTransport) -> Self {
        Transport::Async(transport)
    }
}

impl From<BlockingTransport> for Transport {
    fn from(transport: BlockingTransport) -> Self {
        Transport::Blocking(transport)
    }
}

pub struct AsyncTransport {
    pub(crate) reader: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) writer: Box<dyn AsyncWrite + Send + Unpin>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl AsyncTransport {
    /// Wraps any duplex async stream, e.g. one end of `tokio::io::duplex`.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(reader, writer)
    }

    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr: None,
            peer_addr: None,
        }
    }

    /// Addresses used to index the group for connection reuse.
    pub fn with_addresses(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }
}

pub struct BlockingTransport {
    pub(crate) reader: Box<dyn Read + Send>,
    pub(crate) writer: Box<dyn Write + Send>,
    /// Unblocks the reader thread when the group terminates.
    pub(crate) closer: Option<Box<dyn FnOnce() + Send>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl BlockingTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: None,
            local_addr: None,
            peer_addr: None,
        }
    }

    /// Runs `closer` on termination; it must make a pending read return.
    pub fn with_closer<F>(mut self, closer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.closer = Some(Box::new(closer));
        self
    }

    pub fn with_addresses(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    pub fn from_std_tcp(stream: std::net::TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Ok(Self::new(reader, stream)
            .with_closer(move || {
                let _ = closer.shutdown(std::net::Shutdown::Both);
            })
            .with_addresses(local, peer))
    }
}
