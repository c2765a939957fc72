use crate::{
    codec::FrameCodec,
    config::Config,
    error::{MuxError, Result, is_transient},
    frame::Segment,
    group::GroupShared,
};
use bytes::BytesMut;
use futures::{
    StreamExt,
    stream::{BoxStream, SelectAll},
};
use std::{
    io::{self, Read},
    sync::Arc,
    thread,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::{codec::Decoder, sync::CancellationToken};

/// Decode state of one real connection's read side.
#[derive(Debug)]
pub(crate) struct FrameReader {
    codec: FrameCodec,
    buf: BytesMut,
    read_size: usize,
    errors: u32,
    max_errors: u32,
}

impl FrameReader {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            codec: FrameCodec::new(config),
            buf: BytesMut::with_capacity(config.input_buffer_size),
            read_size: config.input_buffer_size,
            errors: 0,
            max_errors: config.input_max_errors,
        }
    }

    fn buffer(&mut self) -> &mut BytesMut {
        self.buf.reserve(self.read_size);
        &mut self.buf
    }

    /// Hands every complete or partial payload in the buffer to `deliver`.
    pub(crate) fn dispatch<F>(&mut self, mut deliver: F) -> Result<()>
    where
        F: FnMut(Segment) -> Result<()>,
    {
        self.errors = 0;
        while let Some(segment) = self.codec.decode(&mut self.buf)? {
            deliver(segment)?;
        }
        Ok(())
    }

    /// End of stream. Stopping inside a frame is corruption.
    pub(crate) fn on_eof(&self) -> Option<MuxError> {
        if self.codec.in_frame() || !self.buf.is_empty() {
            return Some(MuxError::ProtocolViolation(
                "connection closed in the middle of a frame".to_string(),
            ));
        }
        None
    }

    /// Returns the error to fail with, or `None` to read again.
    pub(crate) fn on_error(&mut self, error: io::Error) -> Option<MuxError> {
        if is_transient(error.kind()) {
            self.errors += 1;
            if self.errors < self.max_errors {
                tracing::debug!("transient read error {}: {}", self.errors, error);
                return None;
            }
        }
        Some(MuxError::Io(error))
    }
}

/// The read side of a group serviced by the shared input task.
pub(crate) struct GroupReader {
    group: Arc<GroupShared>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    frames: FrameReader,
    done: bool,
}

impl GroupReader {
    pub(crate) fn new(group: Arc<GroupShared>, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        let frames = FrameReader::new(group.config());
        Self {
            group,
            reader,
            frames,
            done: false,
        }
    }

    /// One read and the deliveries it allows.
    async fn pump(mut self) -> Option<((), Self)> {
        if self.done {
            return None;
        }

        let failure = match self.reader.read_buf(self.frames.buffer()).await {
            Ok(0) => Some(self.frames.on_eof()),
            Ok(_) => {
                let group = &self.group;
                match self.frames.dispatch(|segment| group.deliver(segment)) {
                    Ok(()) => None,
                    Err(e) => Some(Some(e)),
                }
            }
            Err(e) => self.frames.on_error(e).map(Some),
        };

        if let Some(error) = failure {
            self.group.on_read_closed(error);
            self.done = true;
        }
        Some(((), self))
    }

    fn into_stream(self) -> BoxStream<'static, ()> {
        let cancel = self.group.read_cancel().clone();
        futures::stream::unfold(self, GroupReader::pump)
            .take_until(cancel.cancelled_owned())
            .boxed()
    }
}

/// Shared input task: one task reading every async transport.
///
/// Each group's read side becomes a stream in a `SelectAll`, so whichever
/// connection has bytes ready is serviced next.
pub(crate) struct InputDemultiplexor {
    register_tx: flume::Sender<GroupReader>,
    register_rx: flume::Receiver<GroupReader>,
}

impl InputDemultiplexor {
    pub(crate) fn new() -> Self {
        let (register_tx, register_rx) = flume::unbounded();
        Self {
            register_tx,
            register_rx,
        }
    }

    pub(crate) fn register(&self, reader: GroupReader) {
        if self.register_tx.send(reader).is_err() {
            tracing::error!("input demultiplexor is gone");
        }
    }

    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut readers: SelectAll<BoxStream<'static, ()>> = SelectAll::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                reader = self.register_rx.recv_async() => match reader {
                    Ok(reader) => {
                        tracing::debug!("group {} joined the input task", reader.group.id());
                        readers.push(reader.into_stream());
                    }
                    Err(_) => break,
                },
                Some(()) = readers.next(), if !readers.is_empty() => {}
            }
        }
        tracing::debug!("input demultiplexor stopped");
    }
}

/// Reads a blocking transport on its own thread until EOF, failure or
/// cancellation of the group's read side.
pub(crate) fn spawn_blocking_reader(
    group: Arc<GroupShared>,
    mut reader: Box<dyn Read + Send>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("vsmux-reader-{}", group.id()))
        .spawn(move || {
            let mut frames = FrameReader::new(group.config());
            let mut chunk = vec![0u8; group.config().input_buffer_size];
            let cancel = group.read_cancel().clone();

            let error = loop {
                if cancel.is_cancelled() {
                    return;
                }
                match reader.read(&mut chunk) {
                    Ok(0) => break frames.on_eof(),
                    Ok(n) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        frames.buffer().extend_from_slice(&chunk[..n]);
                        if let Err(e) = frames.dispatch(|segment| group.deliver(segment)) {
                            break Some(e);
                        }
                    }
                    Err(e) => {
                        if let Some(error) = frames.on_error(e) {
                            break Some(error);
                        }
                    }
                }
            };

            if !cancel.is_cancelled() {
                group.on_read_closed(error);
            }
            tracing::debug!("blocking reader for group {} stopped", group.id());
        })
}
