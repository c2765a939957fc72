use crate::{
    codec::FrameCodec,
    config::Config,
    error::{MuxError, Result, is_connection_lost},
    frame::HEADER_SIZE,
    group::GroupId,
    socket_id::SocketId,
};
use bytes::{Buf, Bytes, BytesMut};
use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Notify,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Ordering constraint of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    None,
    /// Sent after every message queued before it on the same connection.
    All,
    /// Sent after every message queued before it for the given destination.
    After(SocketId),
}

#[derive(Debug)]
struct QueuedMessage {
    destination: SocketId,
    bracket: Bracket,
    data: BytesMut,
}

impl QueuedMessage {
    /// True if this message may not be overtaken by a remainder for `destination`.
    fn pins(&self, destination: SocketId) -> bool {
        self.destination == destination
            || self.bracket == Bracket::All
            || self.bracket == Bracket::After(destination)
    }
}

/// Recycled message buffers.
#[derive(Debug)]
pub(crate) struct MessagePool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    message_size: usize,
}

impl MessagePool {
    pub(crate) fn new(capacity: usize, message_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
            message_size,
        }
    }

    fn acquire(&self) -> BytesMut {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.message_size))
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() < self.message_size {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The real connection's write side.
pub(crate) enum FrameSink {
    Async(Box<dyn AsyncWrite + Send + Unpin>),
    /// Writes run on the blocking pool.
    Blocking(Arc<Mutex<Box<dyn Write + Send>>>),
}

enum Progress {
    Done,
    /// The deadline passed before the sink took every byte.
    Stalled,
}

/// Writes encoded frames without waiting past a turn's deadline.
///
/// Bytes the sink has not taken yet stay in `unsent`, and a blocking write
/// still running when its turn ends is joined first on the next turn, so a
/// frame is never torn or reordered.
pub(crate) struct FrameWriter {
    sink: FrameSink,
    unsent: Bytes,
    in_flight: Option<JoinHandle<(Bytes, io::Result<()>)>>,
}

impl FrameWriter {
    pub(crate) fn new(sink: FrameSink) -> Self {
        Self {
            sink,
            unsent: Bytes::new(),
            in_flight: None,
        }
    }

    async fn write(&mut self, frame: Bytes, deadline: Instant) -> io::Result<Progress> {
        self.unsent = frame;
        self.finish(deadline).await
    }

    /// Pushes out whatever an earlier write left behind.
    async fn finish(&mut self, deadline: Instant) -> io::Result<Progress> {
        loop {
            if let Some(handle) = self.in_flight.as_mut() {
                let Ok(joined) = tokio::time::timeout_at(deadline, handle).await else {
                    return Ok(Progress::Stalled);
                };
                self.in_flight = None;
                // A lost blocking write leaves the stream position unknown
                let (rest, result) =
                    joined.map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
                self.unsent = rest;
                result?;
            }
            if self.unsent.is_empty() {
                return Ok(Progress::Done);
            }

            match &mut self.sink {
                FrameSink::Async(writer) => {
                    let written =
                        tokio::time::timeout_at(deadline, writer.write(&self.unsent)).await;
                    match written {
                        Err(_) => return Ok(Progress::Stalled),
                        Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(Ok(n)) => self.unsent.advance(n),
                        Ok(Err(e)) => return Err(e),
                    }
                }
                FrameSink::Blocking(writer) => {
                    let writer = Arc::clone(writer);
                    let frame = std::mem::take(&mut self.unsent);
                    self.in_flight = Some(tokio::task::spawn_blocking(move || {
                        write_blocking(&writer, frame)
                    }));
                }
            }
        }
    }

    async fn flush(&mut self, deadline: Instant) -> io::Result<()> {
        match &mut self.sink {
            FrameSink::Async(writer) => {
                match tokio::time::timeout_at(deadline, writer.flush()).await {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                }
            }
            FrameSink::Blocking(writer) => {
                let writer = Arc::clone(writer);
                let flush = tokio::task::spawn_blocking(move || {
                    writer.lock().unwrap_or_else(|e| e.into_inner()).flush()
                });
                match tokio::time::timeout_at(deadline, flush).await {
                    Ok(joined) => joined.map_err(io::Error::other)?,
                    Err(_) => Ok(()),
                }
            }
        }
    }

    async fn shutdown(mut self, deadline: Instant) -> io::Result<()> {
        if let FrameSink::Async(writer) = &mut self.sink {
            return match tokio::time::timeout_at(deadline, writer.shutdown()).await {
                Ok(result) => result,
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            };
        }
        self.flush(deadline).await
    }
}

/// Returns the bytes left unwritten along with the outcome.
fn write_blocking(writer: &Mutex<Box<dyn Write + Send>>, mut frame: Bytes) -> (Bytes, io::Result<()>) {
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    while !frame.is_empty() {
        match writer.write(&frame) {
            Ok(0) => return (frame, Err(io::ErrorKind::WriteZero.into())),
            Ok(n) => frame.advance(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (frame, Err(e)),
        }
    }
    (frame, Ok(()))
}

struct Chunk {
    destination: SocketId,
    data: BytesMut,
    /// The chunk is a whole message whose buffer can go back to the pool.
    whole: bool,
}

enum Next {
    Chunk(Chunk),
    Empty,
    Close,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    /// In the ready set or being drained.
    scheduled: bool,
    closing: bool,
    failure: Option<io::ErrorKind>,
    errors: u32,
    queued_bytes: usize,
}

/// Write queue of one connection group.
pub(crate) struct OutputQueue {
    group: GroupId,
    state: Mutex<QueueState>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    closed: CancellationToken,
}

impl OutputQueue {
    pub(crate) fn new(group: GroupId, writer: FrameWriter) -> Self {
        Self {
            group,
            state: Mutex::new(QueueState::default()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn failure(&self) -> Option<io::ErrorKind> {
        self.lock().failure
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }

    /// Cancelled once the writer has been released.
    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Appends `data`; returns true if the queue must be put in the ready set.
    fn push(
        &self,
        pool: &MessagePool,
        destination: SocketId,
        data: &[u8],
        bracket: Bracket,
    ) -> Result<bool> {
        let mut state = self.lock();
        if let Some(kind) = state.failure {
            return Err(MuxError::WriteFailed(kind));
        }
        if state.closing {
            return Err(MuxError::GroupShutdown);
        }

        let mut coalesced = false;
        if bracket == Bracket::None {
            if let Some(last) = state.messages.back_mut() {
                if last.destination == destination
                    && last.bracket == Bracket::None
                    && last.data.len() + data.len() <= pool.message_size
                {
                    last.data.extend_from_slice(data);
                    coalesced = true;
                }
            }
        }

        if !coalesced {
            let mut buf = pool.acquire();
            buf.extend_from_slice(data);
            state.messages.push_back(QueuedMessage {
                destination,
                bracket,
                data: buf,
            });
        }
        state.queued_bytes += data.len();

        Ok(!std::mem::replace(&mut state.scheduled, true))
    }

    /// Takes the next chunk of at most `max_chunk` bytes.
    ///
    /// The remainder of a longer message moves back behind messages for other
    /// destinations, but never behind one it must precede.
    fn next_chunk(&self, max_chunk: usize) -> Next {
        let mut state = self.lock();
        let Some(mut message) = state.messages.pop_front() else {
            if state.closing {
                return Next::Close;
            }
            state.scheduled = false;
            return Next::Empty;
        };

        if message.data.len() <= max_chunk {
            state.queued_bytes -= message.data.len();
            return Next::Chunk(Chunk {
                destination: message.destination,
                data: message.data,
                whole: true,
            });
        }

        let data = message.data.split_to(max_chunk);
        state.queued_bytes -= data.len();
        let destination = message.destination;
        let position = state
            .messages
            .iter()
            .position(|queued| queued.pins(destination))
            .unwrap_or(state.messages.len());
        state.messages.insert(position, message);

        Next::Chunk(Chunk {
            destination,
            data,
            whole: false,
        })
    }

    fn record_error(&self) -> u32 {
        let mut state = self.lock();
        state.errors += 1;
        state.errors
    }

    fn fail(&self, kind: io::ErrorKind) {
        let mut state = self.lock();
        state.failure.get_or_insert(kind);
        state.messages.clear();
        state.queued_bytes = 0;
        state.scheduled = false;
    }

    /// Stops accepting writes; the queue drains and then releases the writer.
    /// Returns true if the queue must be put in the ready set.
    fn close(&self) -> bool {
        let mut state = self.lock();
        state.closing = true;
        if state.failure.is_some() {
            drop(state);
            self.closed.cancel();
            return false;
        }
        !std::mem::replace(&mut state.scheduled, true)
    }
}

enum Turn {
    Finished,
    Yield,
}

/// Shared output task: drains every group's queue onto its connection.
///
/// Each round takes a snapshot of the ready groups and gives each one turn,
/// bounded by `output_max_time_slice` and `output_max_data_slice`. A group
/// with data left over re-enters the ready set behind the others.
pub(crate) struct OutputMultiplexor {
    config: Arc<Config>,
    ready: Mutex<VecDeque<Arc<OutputQueue>>>,
    wakeup: Notify,
    pool: MessagePool,
}

impl OutputMultiplexor {
    pub(crate) fn new(config: Arc<Config>) -> Self {
        let pool = MessagePool::new(config.output_message_pool_size, config.output_message_size);
        Self {
            config,
            ready: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            pool,
        }
    }

    pub(crate) fn write(
        &self,
        queue: &Arc<OutputQueue>,
        destination: SocketId,
        data: &[u8],
        bracket: Bracket,
    ) -> Result<()> {
        if queue.push(&self.pool, destination, data, bracket)? {
            self.schedule(queue);
        }
        Ok(())
    }

    pub(crate) fn close(&self, queue: &Arc<OutputQueue>) {
        if queue.close() {
            self.schedule(queue);
        }
    }

    fn schedule(&self, queue: &Arc<OutputQueue>) {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Arc::clone(queue));
        self.wakeup.notify_one();
    }

    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.config.output_max_chunk_size);
        loop {
            let snapshot: Vec<_> = self
                .ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();

            if snapshot.is_empty() {
                tokio::select! {
                    _ = self.wakeup.notified() => continue,
                    _ = cancel.cancelled() => break,
                }
            }

            for queue in snapshot {
                if let Turn::Yield = self.drain_turn(&queue, &mut buf).await {
                    self.ready
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(queue);
                }
            }
        }
        tracing::debug!("output multiplexor stopped");
    }

    /// Gives up on a queue whose connection stopped taking bytes. Anything
    /// still queued is dropped and the writer is released on its next turn.
    pub(crate) fn abandon(&self, queue: &Arc<OutputQueue>) {
        queue.fail(io::ErrorKind::TimedOut);
        self.schedule(queue);
    }

    async fn drain_turn(&self, queue: &Arc<OutputQueue>, buf: &mut BytesMut) -> Turn {
        let mut writer = queue.writer.lock().await;
        let deadline = Instant::now() + self.config.output_max_time_slice;
        let mut sent = 0usize;

        if queue.failure().is_some() {
            writer.take();
            queue.closed.cancel();
            return Turn::Finished;
        }

        // A frame left over from the last turn goes out before anything new
        let leftover = match writer.as_mut() {
            Some(w) => w.finish(deadline).await,
            None => Ok(Progress::Done),
        };
        match leftover {
            Ok(Progress::Done) => {}
            Ok(Progress::Stalled) => return Turn::Yield,
            Err(e) => return self.write_failed(queue, &mut writer, e),
        }

        loop {
            let chunk = match queue.next_chunk(self.config.output_max_chunk_size) {
                Next::Chunk(chunk) => chunk,
                Next::Empty => {
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = w.flush(deadline).await {
                            tracing::debug!("group {} flush failed: {}", queue.group, e);
                        }
                    }
                    return Turn::Finished;
                }
                Next::Close => {
                    if let Some(w) = writer.take() {
                        if let Err(e) = w.shutdown(deadline).await {
                            tracing::debug!("group {} writer shutdown failed: {}", queue.group, e);
                        }
                    }
                    queue.closed.cancel();
                    return Turn::Finished;
                }
            };

            let Some(w) = writer.as_mut() else {
                queue.fail(io::ErrorKind::NotConnected);
                queue.closed.cancel();
                return Turn::Finished;
            };

            buf.clear();
            if let Err(e) = FrameCodec::encode_chunk(chunk.destination, &chunk.data, buf) {
                tracing::error!("group {} dropped unencodable chunk: {}", queue.group, e);
                continue;
            }
            let len = chunk.data.len();
            if chunk.whole {
                self.pool.release(chunk.data);
            }

            match w.write(buf.split().freeze(), deadline).await {
                Ok(Progress::Done) => {
                    tracing::trace!(
                        "group {} wrote {} bytes to {}",
                        queue.group,
                        len,
                        chunk.destination
                    );
                    sent += len;
                }
                Ok(Progress::Stalled) => {
                    tracing::trace!("group {} connection is not taking bytes", queue.group);
                    return Turn::Yield;
                }
                Err(e) => return self.write_failed(queue, &mut writer, e),
            }

            if sent >= self.config.output_max_data_slice || Instant::now() >= deadline {
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush(deadline).await;
                }
                return Turn::Yield;
            }
        }
    }

    /// A failed write keeps its frame for the next turn unless the error is
    /// fatal or the error budget is spent.
    fn write_failed(
        &self,
        queue: &Arc<OutputQueue>,
        writer: &mut Option<FrameWriter>,
        e: io::Error,
    ) -> Turn {
        if is_connection_lost(e.kind()) {
            tracing::error!("group {} connection lost while writing: {}", queue.group, e);
        } else {
            let errors = queue.record_error();
            if errors < self.config.output_max_errors {
                tracing::warn!("group {} transient write error {}: {}", queue.group, errors, e);
                return Turn::Yield;
            }
            tracing::error!(
                "group {} write failed after {} errors: {}",
                queue.group,
                errors,
                e
            );
        }
        queue.fail(e.kind());
        writer.take();
        queue.closed.cancel();
        Turn::Finished
    }
}
