use crate::{error::MuxError, group::GroupShared, output::Bracket, socket_id::SocketId};
use bytes::{Buf, Bytes};
use futures::StreamExt;
use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the demultiplexor hands to a virtual socket's inbound buffer.
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Data(Bytes),
    /// The peer will send nothing more.
    End,
    Failed(io::ErrorKind, Arc<str>),
}

#[derive(Debug)]
enum Finished {
    End,
    Failed(io::ErrorKind, Arc<str>),
}

/// Reading half of a virtual socket.
///
/// Yields the bytes the peer wrote to this socket's id, in order. Reads block
/// until data arrives, the peer shuts down its output (end of stream), or the
/// shared connection fails (error).
pub struct VirtualInputStream {
    id: SocketId,
    events: flume::r#async::RecvStream<'static, Inbound>,
    current: Bytes,
    finished: Option<Finished>,
}

impl VirtualInputStream {
    pub(crate) fn new(id: SocketId, events: flume::Receiver<Inbound>) -> Self {
        Self {
            id,
            events: events.into_stream(),
            current: Bytes::new(),
            finished: None,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// True once end of stream or an error has been observed.
    pub fn is_finished(&self) -> bool {
        self.current.is_empty() && self.finished.is_some()
    }
}

impl std::fmt::Debug for VirtualInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualInputStream")
            .field("id", &self.id)
            .field("buffered", &self.current.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl AsyncRead for VirtualInputStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }

            match &this.finished {
                Some(Finished::End) => return Poll::Ready(Ok(())),
                Some(Finished::Failed(kind, reason)) => {
                    return Poll::Ready(Err(io::Error::new(*kind, reason.to_string())));
                }
                None => {}
            }

            match this.events.poll_next_unpin(cx) {
                Poll::Ready(Some(Inbound::Data(data))) => this.current = data,
                Poll::Ready(Some(Inbound::End)) | Poll::Ready(None) => {
                    this.finished = Some(Finished::End);
                }
                Poll::Ready(Some(Inbound::Failed(kind, reason))) => {
                    this.finished = Some(Finished::Failed(kind, reason));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Local view of one outbound destination.
#[derive(Debug, Default)]
pub(crate) struct OutboundState {
    /// Local side shut down its output.
    closed: AtomicBool,
    /// The peer socket behind the destination disconnected.
    peer_closed: AtomicBool,
}

impl OutboundState {
    /// Returns true if the stream was open.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_peer_closed(&self) {
        self.peer_closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }
}

/// Writing half of a virtual socket.
///
/// Writes are queued on the owning group's output queue and return at once;
/// the shared output task puts them on the wire. Shutting the stream down
/// tells the peer that this destination will receive no more bytes.
pub struct VirtualOutputStream {
    destination: SocketId,
    group: Arc<GroupShared>,
    state: Arc<OutboundState>,
}

impl VirtualOutputStream {
    pub(crate) fn new(
        destination: SocketId,
        group: Arc<GroupShared>,
        state: Arc<OutboundState>,
    ) -> Self {
        Self {
            destination,
            group,
            state,
        }
    }

    pub fn destination(&self) -> SocketId {
        self.destination
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual output stream is shut down",
            ));
        }
        if self.state.is_peer_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer virtual socket disconnected",
            ));
        }
        self.group.check_writable().map_err(io::Error::from)
    }

    /// Queues `data` without going through `AsyncWrite`.
    pub fn write_now(&self, data: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.group
            .enqueue(self.destination, data, Bracket::None)
            .map_err(io::Error::from)?;
        Ok(data.len())
    }

    /// Marks the stream closed and, unless the peer already went away, tells
    /// it that no more bytes follow. The notice is ordered after every byte
    /// already queued for this destination.
    pub fn shutdown_output(&self) -> Result<(), MuxError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.is_peer_closed() || self.group.is_terminated() {
            return Ok(());
        }
        self.group.notify_output_shutdown(self.destination)
    }
}

impl std::fmt::Debug for VirtualOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualOutputStream")
            .field("destination", &self.destination)
            .field("group", &self.group.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncWrite for VirtualOutputStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.write_now(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.group.check_writable().map_err(io::Error::from))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shutdown_output().map_err(io::Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_input_stream_reads_in_order() {
        let (tx, rx) = flume::unbounded();
        let mut stream = VirtualInputStream::new(SocketId::new(4), rx);

        tx.send(Inbound::Data(Bytes::from_static(b"hello "))).unwrap();
        tx.send(Inbound::Data(Bytes::from_static(b"world"))).unwrap();
        tx.send(Inbound::End).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert!(stream.is_finished());

        // Reads after end of stream keep returning 0
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_input_stream_small_reads() {
        let (tx, rx) = flume::unbounded();
        let mut stream = VirtualInputStream::new(SocketId::new(4), rx);
        tx.send(Inbound::Data(Bytes::from_static(b"abcdef"))).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_input_stream_sender_drop_is_eof() {
        let (tx, rx) = flume::unbounded();
        let mut stream = VirtualInputStream::new(SocketId::new(9), rx);
        tx.send(Inbound::Data(Bytes::from_static(b"x"))).unwrap();
        drop(tx);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"x");
    }

    #[tokio::test]
    async fn test_input_stream_error_after_data() {
        let (tx, rx) = flume::unbounded();
        let mut stream = VirtualInputStream::new(SocketId::new(2), rx);
        tx.send(Inbound::Data(Bytes::from_static(b"ok"))).unwrap();
        tx.send(Inbound::Failed(io::ErrorKind::InvalidData, Arc::from("corrupt")))
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);

        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // The error is sticky
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_input_stream_waits_for_data() {
        let (tx, rx) = flume::unbounded();
        let mut stream = VirtualInputStream::new(SocketId::new(2), rx);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.map(|_| buf)
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tx.send(Inbound::Data(Bytes::from_static(b"a"))).unwrap();
        tx.send(Inbound::Data(Bytes::from_static(b"bc"))).unwrap();

        assert_eq!(&reader.await.unwrap().unwrap(), b"abc");
    }
}
