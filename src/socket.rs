use crate::{
    error::{MuxError, Result},
    group::ConnectionGroup,
    socket_id::SocketId,
    stream::{VirtualInputStream, VirtualOutputStream},
};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected virtual socket: one local id paired with one peer id.
///
/// Dropping the socket without [`close`](Self::close) still tells the peer
/// and releases the id, from the deferred-action task.
#[derive(Debug)]
pub struct VirtualSocket {
    group: ConnectionGroup,
    local: SocketId,
    remote: SocketId,
    input: VirtualInputStream,
    output: VirtualOutputStream,
    open: bool,
}

impl VirtualSocket {
    /// Opens a virtual socket to the peer's acceptor on `group`.
    pub async fn connect(group: &ConnectionGroup, timeout: Duration) -> Result<Self> {
        let allocator = group.shared.allocator();
        let local = allocator.allocate(timeout).await?;

        let connected = async {
            let remote = group.send_connect(local, timeout).await?;
            let (input, output) = group.register_virtual_socket(local, remote).await?;
            if let Err(e) = group.shared.send_connect_verified(remote) {
                let _ = group.unregister_virtual_socket(local);
                return Err(e);
            }
            Ok((remote, input, output))
        }
        .await;

        match connected {
            Ok((remote, input, output)) => {
                tracing::debug!("virtual socket {} connected to {}", local, remote);
                Ok(Self::new(group.clone(), local, remote, input, output))
            }
            Err(e) => {
                allocator.release(local);
                Err(e)
            }
        }
    }

    fn new(
        group: ConnectionGroup,
        local: SocketId,
        remote: SocketId,
        input: VirtualInputStream,
        output: VirtualOutputStream,
    ) -> Self {
        Self {
            group,
            local,
            remote,
            input,
            output,
            open: true,
        }
    }

    pub fn local_id(&self) -> SocketId {
        self.local
    }

    pub fn remote_id(&self) -> SocketId {
        self.remote
    }

    pub fn group(&self) -> &ConnectionGroup {
        &self.group
    }

    /// Borrows the two halves for concurrent reading and writing.
    pub fn split(&mut self) -> (&mut VirtualInputStream, &mut VirtualOutputStream) {
        (&mut self.input, &mut self.output)
    }

    /// Tells the peer that nothing more will be written.
    pub fn shutdown_output(&self) -> Result<()> {
        self.output.shutdown_output()
    }

    /// Disconnects from the peer and releases the id. Bytes already written
    /// reach the peer before the disconnect does.
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        close_registration(&self.group, self.local, self.remote)
    }
}

fn close_registration(group: &ConnectionGroup, local: SocketId, remote: SocketId) -> Result<()> {
    let notified = if group.is_shutdown() {
        Ok(())
    } else {
        group.notify_disconnect(remote)
    };
    let unregistered = group.unregister_virtual_socket(local);
    group.shared.allocator().release(local);
    tracing::debug!("virtual socket {} closed", local);
    notified.and(unregistered)
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let group = self.group.clone();
        let (local, remote) = (self.local, self.remote);
        self.group.shared.defer(async move {
            if let Err(e) = close_registration(&group, local, remote) {
                tracing::debug!("cleanup of dropped socket {} failed: {}", local, e);
            }
        });
    }
}

impl AsyncRead for VirtualSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for VirtualSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.output).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.output).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.output).poll_shutdown(cx)
    }
}

/// Accepts virtual sockets the peer opens on a group.
#[derive(Debug)]
pub struct Acceptor {
    group: ConnectionGroup,
    requests: flume::Receiver<SocketId>,
    open: bool,
}

impl Acceptor {
    pub(crate) fn new(group: ConnectionGroup, requests: flume::Receiver<SocketId>) -> Self {
        Self {
            group,
            requests,
            open: true,
        }
    }

    pub fn group(&self) -> &ConnectionGroup {
        &self.group
    }

    /// Waits for the next connect that completes its handshake.
    ///
    /// A connect the client never confirms is dropped and the wait goes on.
    pub async fn accept(&self) -> Result<VirtualSocket> {
        loop {
            let client = self
                .requests
                .recv_async()
                .await
                .map_err(|_| MuxError::GroupShutdown)?;

            let allocator = self.group.shared.allocator();
            let timeout = self.group.config().connect_timeout;
            let assigned = match allocator.allocate(timeout).await {
                Ok(id) => id,
                Err(e) => {
                    let _ = self.group.shared.refuse_connect(client);
                    return Err(e);
                }
            };

            match self.group.answer_connect(assigned, client).await {
                Ok((input, output)) => {
                    return Ok(VirtualSocket::new(
                        self.group.clone(),
                        assigned,
                        client,
                        input,
                        output,
                    ));
                }
                Err(e) => {
                    allocator.release(assigned);
                    if self.group.is_shutdown() {
                        return Err(e);
                    }
                    tracing::debug!("connect from {} abandoned: {}", client, e);
                }
            }
        }
    }

    /// Stops accepting and withdraws the announcement from the peer.
    pub async fn close(mut self) -> Result<()> {
        self.open = false;
        self.group.unregister_acceptor().await
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let group = self.group.clone();
        self.group.shared.defer(async move {
            if let Err(e) = group.unregister_acceptor().await {
                tracing::debug!("cleanup of dropped acceptor failed: {}", e);
            }
        });
    }
}
