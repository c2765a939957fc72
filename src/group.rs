use crate::{
    config::Config,
    control::{ControlCodec, ControlMessage},
    error::{MuxError, Result},
    frame::Segment,
    mux::{MuxInner, Workers},
    output::{Bracket, OutputQueue},
    protocol::{ControlProtocol, await_response},
    shutdown::{Decrement, Increment, Outcome, Reserve, ShutdownPhase, ShutdownState},
    socket::Acceptor,
    socket_id::{SocketId, SocketIdAllocator},
    stream::{Inbound, OutboundState, VirtualInputStream, VirtualOutputStream},
};
use bytes::{Bytes, BytesMut};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::{codec::Decoder, sync::CancellationToken};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    #[cfg(test)]
    pub(crate) fn new(value: u64) -> Self {
        GroupId(value)
    }

    pub(crate) fn next() -> Self {
        GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload that no virtual socket could take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub segments: u64,
    pub bytes: u64,
}

#[derive(Debug)]
struct InboundEntry {
    remote: SocketId,
    sender: flume::Sender<Inbound>,
}

/// Bytes that arrived for a positive id before anyone registered it.
#[derive(Debug, Default)]
struct PendingEntry {
    chunks: Vec<Bytes>,
    bytes: usize,
    overflowed: bool,
    ended: bool,
}

/// Recently unregistered ids, oldest first.
///
/// Late bytes for these ids are dead letters. The window is bounded; an id
/// also leaves it once the peer reports its socket disconnected.
#[derive(Debug)]
struct RetiredIds {
    ids: HashSet<SocketId>,
    order: VecDeque<SocketId>,
    window: usize,
}

impl RetiredIds {
    fn new(window: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            window,
        }
    }

    fn contains(&self, id: &SocketId) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn insert(&mut self, id: SocketId) {
        if self.window == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &SocketId) {
        if self.ids.remove(id) {
            self.order.retain(|retired| retired != id);
        }
    }
}

#[derive(Debug, Clone)]
enum ReadSide {
    Open,
    Ended,
    Failed(io::ErrorKind, Arc<str>),
}

impl ReadSide {
    fn from_error(error: Option<&MuxError>) -> Self {
        match error {
            Some(e) => ReadSide::Failed(e.io_kind(), Arc::from(e.to_string())),
            None => ReadSide::Ended,
        }
    }

    fn inbound(&self) -> Option<Inbound> {
        match self {
            ReadSide::Open => None,
            ReadSide::Ended => Some(Inbound::End),
            ReadSide::Failed(kind, reason) => Some(Inbound::Failed(*kind, Arc::clone(reason))),
        }
    }
}

#[derive(Debug)]
struct GroupState {
    /// Local id to its inbound buffer.
    inbound: HashMap<SocketId, InboundEntry>,
    /// Remote id to the local view of that destination.
    outbound: HashMap<SocketId, Arc<OutboundState>>,
    pending: HashMap<SocketId, PendingEntry>,
    /// Sum of the buffered bytes in `pending`.
    pending_bytes: usize,
    retired: RetiredIds,
    /// Partially received control messages per system channel.
    system: HashMap<SocketId, BytesMut>,
    /// A local acceptor holds a reference while this is set.
    acceptor_registered: bool,
    /// Dropped when the connection can no longer deliver connects.
    acceptor: Option<flume::Sender<SocketId>>,
    remote_acceptor: bool,
    read_side: ReadSide,
    dead_letters: DeadLetterStats,
    shutdown: ShutdownState,
}

impl GroupState {
    fn new(config: &Config) -> Self {
        Self {
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            pending: HashMap::new(),
            pending_bytes: 0,
            retired: RetiredIds::new(config.input_retired_window),
            system: HashMap::new(),
            acceptor_registered: false,
            acceptor: None,
            remote_acceptor: false,
            read_side: ReadSide::Open,
            dead_letters: DeadLetterStats::default(),
            shutdown: ShutdownState::new(config.shutdown_refusals_maximum),
        }
    }

    fn dead_letter(&mut self, group: GroupId, destination: SocketId, len: usize) {
        self.dead_letters.segments += 1;
        self.dead_letters.bytes += len as u64;
        tracing::warn!(
            "group {} dead-lettered {} bytes for {}",
            group,
            len,
            destination
        );
    }
}

/// State shared by a group's handle, its streams and the worker tasks.
pub(crate) struct GroupShared {
    id: GroupId,
    config: Arc<Config>,
    workers: Arc<Workers>,
    allocator: Arc<SocketIdAllocator>,
    mux: Weak<MuxInner>,
    runtime: tokio::runtime::Handle,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    queue: Arc<OutputQueue>,
    state: Mutex<GroupState>,
    /// Signalled on every reference-count or shutdown-phase change.
    changed: Notify,
    protocol: ControlProtocol,
    read_cancel: CancellationToken,
    terminated: CancellationToken,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for GroupShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupShared")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("terminated", &self.terminated.is_cancelled())
            .finish()
    }
}

/// Addresses and teardown hook of the real connection behind a group.
pub(crate) struct Endpoint {
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) closer: Option<Box<dyn FnOnce() + Send>>,
}

impl GroupShared {
    pub(crate) fn new(
        id: GroupId,
        mux: &Arc<MuxInner>,
        workers: Arc<Workers>,
        queue: Arc<OutputQueue>,
        endpoint: Endpoint,
    ) -> Arc<Self> {
        let config = Arc::clone(&mux.config);
        Arc::new(Self {
            id,
            state: Mutex::new(GroupState::new(&config)),
            config,
            workers,
            allocator: Arc::clone(&mux.allocator),
            mux: Arc::downgrade(mux),
            runtime: mux.runtime.clone(),
            local_addr: endpoint.local_addr,
            peer_addr: endpoint.peer_addr,
            queue,
            changed: Notify::new(),
            protocol: ControlProtocol::new(),
            read_cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            closer: Mutex::new(endpoint.closer),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn allocator(&self) -> &Arc<SocketIdAllocator> {
        &self.allocator
    }

    pub(crate) fn read_cancel(&self) -> &CancellationToken {
        &self.read_cancel
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub(crate) fn defer<F>(&self, action: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.workers.deferred.defer(action);
    }

    /// Routes one decoded segment. An error is fatal to the group.
    pub(crate) fn deliver(self: &Arc<Self>, segment: Segment) -> Result<()> {
        let Segment {
            destination, data, ..
        } = segment;
        tracing::trace!(
            "group {} received {} bytes for {}",
            self.id,
            data.len(),
            destination
        );

        if destination.is_user() {
            self.deliver_data(destination, data);
            return Ok(());
        }

        match destination {
            SocketId::CONTROL
            | SocketId::SERVER_ACCEPT
            | SocketId::ACCEPT_ANSWER
            | SocketId::ACCEPT_VERIFY
            | SocketId::BACK_CHANNEL => self.deliver_control(destination, &data),
            _ => {
                self.lock().dead_letter(self.id, destination, data.len());
                Ok(())
            }
        }
    }

    fn deliver_data(&self, local: SocketId, data: Bytes) {
        let len = data.len();
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(entry) = state.inbound.get(&local) {
            if entry.sender.send(Inbound::Data(data)).is_ok() {
                return;
            }
        } else if !state.retired.contains(&local) && matches!(state.read_side, ReadSide::Open) {
            if !state.pending.contains_key(&local)
                && state.pending.len() >= self.config.input_pending_max_sockets
            {
                tracing::debug!(
                    "group {} buffers for {} unregistered ids, not {}",
                    self.id,
                    state.pending.len(),
                    local
                );
                state.dead_letter(self.id, local, len);
                return;
            }

            let within_budget =
                state.pending_bytes + len <= self.config.input_pending_total_limit;
            let pending = state.pending.entry(local).or_default();
            if !pending.overflowed && !pending.ended {
                if within_budget && pending.bytes + len <= self.config.input_pending_limit {
                    pending.bytes += len;
                    pending.chunks.push(data);
                    state.pending_bytes += len;
                    tracing::debug!(
                        "group {} buffered {} bytes for unregistered {}",
                        self.id,
                        len,
                        local
                    );
                    return;
                }
                pending.overflowed = true;
                tracing::warn!(
                    "group {} pending buffer for {} is full ({} bytes buffered in the group)",
                    self.id,
                    local,
                    state.pending_bytes
                );
            }
        }

        state.dead_letter(self.id, local, len);
    }

    fn deliver_control(self: &Arc<Self>, channel: SocketId, data: &[u8]) -> Result<()> {
        let messages = {
            let mut state = self.lock();
            let buf = state.system.entry(channel).or_default();
            buf.extend_from_slice(data);

            let mut codec = ControlCodec;
            let mut messages = Vec::new();
            while let Some(message) = codec.decode(buf)? {
                messages.push(message);
            }
            messages
        };

        for message in messages {
            if message.channel() != channel {
                return Err(MuxError::ProtocolViolation(format!(
                    "{:?} received on channel {}",
                    message, channel
                )));
            }
            tracing::trace!("group {} control message {:?}", self.id, message);
            self.handle_control(message);
        }
        Ok(())
    }

    fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        match message {
            ControlMessage::Connect { client } => self.on_connect_request(client),
            ControlMessage::Connected { client, assigned } => {
                self.protocol.complete_connect(client, Ok(assigned));
            }
            ControlMessage::ConnectRefused { client } => {
                self.protocol
                    .complete_connect(client, Err(MuxError::ConnectRefused(client)));
            }
            ControlMessage::ConnectVerified { assigned } => self.protocol.complete_verify(assigned),
            ControlMessage::Response { request, accepted } => {
                self.protocol.complete_request(request, accepted);
            }
            other => {
                if self
                    .workers
                    .back_channel
                    .send((Arc::clone(self), other))
                    .is_err()
                {
                    tracing::error!("group {} back channel task is gone", self.id);
                }
            }
        }
    }

    fn on_connect_request(&self, client: SocketId) {
        let handed_off = {
            let state = self.lock();
            match &state.acceptor {
                Some(acceptor) => acceptor.send(client).is_ok(),
                None => false,
            }
        };
        if handed_off {
            return;
        }

        tracing::debug!("group {} refusing connect from {}: no acceptor", self.id, client);
        if let Err(e) = self.refuse_connect(client) {
            tracing::debug!("group {} could not refuse {}: {}", self.id, client, e);
        }
    }

    /// Handles one message on the back-channel task.
    pub(crate) fn handle_back_channel(self: &Arc<Self>, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::OutputShutdown { id } => {
                self.end_inbound(id, false);
                Ok(())
            }
            ControlMessage::Disconnect { id } => {
                self.end_inbound(id, true);
                Ok(())
            }
            ControlMessage::RegisterRemoteServer { request } => {
                let accepted = !std::mem::replace(&mut self.lock().remote_acceptor, true);
                tracing::debug!("group {} peer registered an acceptor", self.id);
                self.send_control(ControlMessage::Response { request, accepted }, Bracket::None)
            }
            ControlMessage::UnregisterRemoteServer { request } => {
                let accepted = std::mem::replace(&mut self.lock().remote_acceptor, false);
                tracing::debug!("group {} peer unregistered its acceptor", self.id);
                self.send_control(ControlMessage::Response { request, accepted }, Bracket::None)
            }
            ControlMessage::RequestManagerShutdown { request } => {
                let accepted = self.lock().shutdown.on_peer_request();
                tracing::debug!(
                    "group {} peer asked to shut down, answering {}",
                    self.id,
                    accepted
                );
                let answered =
                    self.send_control(ControlMessage::Response { request, accepted }, Bracket::None);
                if accepted {
                    self.changed.notify_waiters();
                    self.terminate(None);
                }
                answered
            }
            other => Err(MuxError::ProtocolViolation(format!(
                "unexpected back-channel message {:?}",
                other
            ))),
        }
    }

    /// The peer will write nothing more to `local`; with `disconnect` its
    /// socket is gone and writes to it fail too.
    fn end_inbound(&self, local: SocketId, disconnect: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(entry) = state.inbound.get(&local) {
            if disconnect {
                if let Some(outbound) = state.outbound.get(&entry.remote) {
                    outbound.mark_peer_closed();
                }
            }
            let _ = entry.sender.send(Inbound::End);
        } else if state.retired.contains(&local) {
            if disconnect {
                state.retired.remove(&local);
            }
        } else if state.pending.contains_key(&local)
            || state.pending.len() < self.config.input_pending_max_sockets
        {
            state.pending.entry(local).or_default().ended = true;
        }
        tracing::debug!(
            "group {} peer {} {}",
            self.id,
            if disconnect { "disconnected" } else { "shut down output to" },
            local
        );
    }

    /// EOF or a read failure on the real connection.
    pub(crate) fn on_read_closed(self: &Arc<Self>, error: Option<MuxError>) {
        if self.is_terminated() {
            return;
        }
        if let Some(e) = &error {
            if e.is_fatal() {
                self.terminate(Some(e));
                return;
            }
        }

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !matches!(state.read_side, ReadSide::Open) {
                return;
            }
            state.read_side = ReadSide::from_error(error.as_ref());
            if let Some(event) = state.read_side.inbound() {
                for entry in state.inbound.values() {
                    let _ = entry.sender.send(event.clone());
                }
            }
            state.acceptor = None;
        }

        match &error {
            Some(e) => tracing::warn!("group {} read side failed: {}", self.id, e),
            None => tracing::debug!("group {} peer closed the connection", self.id),
        }
        self.protocol.fail_all();
        self.changed.notify_waiters();
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(MuxError::GroupShutdown);
        }
        if let Some(kind) = self.queue.failure() {
            return Err(MuxError::WriteFailed(kind));
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, destination: SocketId, data: &[u8], bracket: Bracket) -> Result<()> {
        self.workers
            .output
            .write(&self.queue, destination, data, bracket)
    }

    fn send_control(&self, message: ControlMessage, bracket: Bracket) -> Result<()> {
        let mut buf = BytesMut::with_capacity(ControlMessage::MAX_ENCODED_LEN);
        message.encode(&mut buf);
        tracing::trace!("group {} sending {:?}", self.id, message);
        self.enqueue(message.channel(), &buf, bracket)
    }

    /// Sends a back-channel request and waits for the peer's answer.
    async fn request<F>(&self, make: F, timeout: Duration) -> Result<bool>
    where
        F: FnOnce(u32) -> ControlMessage,
    {
        let (request, rx) = self.protocol.start_request();
        if let Err(e) = self.send_control(make(request), Bracket::None) {
            self.protocol.cancel_request(request);
            return Err(e);
        }
        let result = await_response(rx, timeout).await;
        if result.is_err() {
            self.protocol.cancel_request(request);
        }
        result
    }

    pub(crate) fn notify_output_shutdown(&self, destination: SocketId) -> Result<()> {
        self.send_control(
            ControlMessage::OutputShutdown { id: destination },
            Bracket::After(destination),
        )
    }

    pub(crate) fn notify_disconnect(&self, destination: SocketId) -> Result<()> {
        if let Some(outbound) = self.lock().outbound.get(&destination) {
            outbound.mark_closed();
        }
        self.send_control(
            ControlMessage::Disconnect { id: destination },
            Bracket::After(destination),
        )
    }

    fn peer_unreachable(&self) -> bool {
        self.is_terminated()
            || self.queue.failure().is_some()
            || !matches!(self.lock().read_side, ReadSide::Open)
    }

    async fn increment(&self) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = self.lock().shutdown.try_increment();
            match decision {
                Increment::Done => {
                    self.changed.notify_waiters();
                    return Ok(());
                }
                Increment::Shutdown => return Err(MuxError::GroupShutdown),
                Increment::Wait => notified.await,
            }
        }
    }

    fn decrement(self: &Arc<Self>) -> Result<()> {
        let decision = self.lock().shutdown.try_decrement()?;
        self.changed.notify_waiters();
        if let Decrement::Negotiate(generation) = decision {
            self.start_negotiation(generation);
        }
        Ok(())
    }

    pub(crate) async fn register_virtual_socket(
        self: &Arc<Self>,
        local: SocketId,
        remote: SocketId,
    ) -> Result<(VirtualInputStream, VirtualOutputStream)> {
        if !local.is_user() || !remote.is_user() {
            return Err(MuxError::ProtocolViolation(format!(
                "cannot register system id ({} -> {})",
                local, remote
            )));
        }
        self.increment().await?;

        let registered = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.inbound.contains_key(&local) {
                Err(MuxError::SocketAlreadyRegistered(local))
            } else {
                let (tx, rx) = flume::unbounded();
                if let Some(pending) = state.pending.remove(&local) {
                    state.pending_bytes -= pending.bytes;
                    for chunk in pending.chunks {
                        let _ = tx.send(Inbound::Data(chunk));
                    }
                    if pending.overflowed {
                        let _ = tx.send(Inbound::Failed(
                            io::ErrorKind::InvalidData,
                            Arc::from("bytes lost before the socket was registered"),
                        ));
                    } else if pending.ended {
                        let _ = tx.send(Inbound::End);
                    }
                }
                if let Some(event) = state.read_side.inbound() {
                    let _ = tx.send(event);
                }

                state.retired.remove(&local);
                state.inbound.insert(local, InboundEntry { remote, sender: tx });
                let outbound = Arc::new(OutboundState::default());
                state.outbound.insert(remote, Arc::clone(&outbound));
                Ok((rx, outbound))
            }
        };

        match registered {
            Ok((rx, outbound)) => {
                tracing::debug!("group {} registered {} -> {}", self.id, local, remote);
                Ok((
                    VirtualInputStream::new(local, rx),
                    VirtualOutputStream::new(remote, Arc::clone(self), outbound),
                ))
            }
            Err(e) => {
                self.decrement()?;
                Err(e)
            }
        }
    }

    pub(crate) fn unregister_virtual_socket(self: &Arc<Self>, local: SocketId) -> Result<()> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state
                .inbound
                .remove(&local)
                .ok_or(MuxError::SocketNotRegistered(local))?;
            if let Some(outbound) = state.outbound.remove(&entry.remote) {
                outbound.mark_closed();
            }
            state.retired.insert(local);
        }
        tracing::debug!("group {} unregistered {}", self.id, local);
        self.decrement()
    }

    pub(crate) async fn register_acceptor(self: &Arc<Self>) -> Result<flume::Receiver<SocketId>> {
        if self.lock().acceptor_registered {
            return Err(MuxError::AcceptorAlreadyRegistered);
        }
        self.increment().await?;

        let (tx, rx) = flume::unbounded();
        let conflict = {
            let mut state = self.lock();
            if state.acceptor_registered {
                true
            } else {
                state.acceptor_registered = true;
                state.acceptor = Some(tx);
                false
            }
        };
        if conflict {
            self.decrement()?;
            return Err(MuxError::AcceptorAlreadyRegistered);
        }

        let timeout = self.config.shutdown_request_timeout;
        match self
            .request(|request| ControlMessage::RegisterRemoteServer { request }, timeout)
            .await
        {
            Ok(true) => tracing::debug!("group {} acceptor announced", self.id),
            Ok(false) => tracing::debug!("group {} peer already knew of an acceptor", self.id),
            Err(e) => tracing::warn!("group {} acceptor announcement failed: {}", self.id, e),
        }
        Ok(rx)
    }

    pub(crate) async fn unregister_acceptor(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.lock();
            if !std::mem::replace(&mut state.acceptor_registered, false) {
                return Err(MuxError::NoAcceptor);
            }
            state.acceptor = None;
        }
        if !self.peer_unreachable() {
            let timeout = self.config.shutdown_request_timeout;
            if let Err(e) = self
                .request(|request| ControlMessage::UnregisterRemoteServer { request }, timeout)
                .await
            {
                tracing::debug!("group {} acceptor withdrawal unanswered: {}", self.id, e);
            }
        }
        self.decrement()
    }

    pub(crate) async fn send_connect(
        self: &Arc<Self>,
        local: SocketId,
        timeout: Duration,
    ) -> Result<SocketId> {
        let rx = self.protocol.expect_connect(local)?;
        if let Err(e) = self.send_control(ControlMessage::Connect { client: local }, Bracket::None) {
            self.protocol.cancel_connect(local);
            return Err(e);
        }
        match await_response(rx, timeout).await {
            Ok(answer) => answer,
            Err(e) => {
                self.protocol.cancel_connect(local);
                Err(e)
            }
        }
    }

    pub(crate) fn send_connect_verified(&self, assigned: SocketId) -> Result<()> {
        self.send_control(ControlMessage::ConnectVerified { assigned }, Bracket::None)
    }

    pub(crate) fn refuse_connect(&self, client: SocketId) -> Result<()> {
        self.send_control(ControlMessage::ConnectRefused { client }, Bracket::None)
    }

    /// Registers `assigned` for `client`, answers the connect and waits for
    /// the client to confirm it registered its side.
    pub(crate) async fn answer_connect(
        self: &Arc<Self>,
        assigned: SocketId,
        client: SocketId,
    ) -> Result<(VirtualInputStream, VirtualOutputStream)> {
        let verified = self.protocol.expect_verify(assigned);
        let streams = match self.register_virtual_socket(assigned, client).await {
            Ok(streams) => streams,
            Err(e) => {
                self.protocol.cancel_verify(assigned);
                let _ = self.refuse_connect(client);
                return Err(e);
            }
        };

        let answered =
            self.send_control(ControlMessage::Connected { client, assigned }, Bracket::None);
        let result = match answered {
            Ok(()) => await_response(verified, self.config.connect_timeout).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!("group {} accepted {} as {}", self.id, client, assigned);
                Ok(streams)
            }
            Err(e) => {
                tracing::debug!(
                    "group {} connect from {} not verified: {}",
                    self.id,
                    client,
                    e
                );
                self.protocol.cancel_verify(assigned);
                drop(streams);
                let _ = self.unregister_virtual_socket(assigned);
                Err(e)
            }
        }
    }

    fn start_negotiation(self: &Arc<Self>, generation: u64) {
        tracing::debug!("group {} unreferenced, negotiating shutdown", self.id);
        self.runtime.spawn(Arc::clone(self).negotiate(generation));
    }

    async fn negotiate(self: Arc<Self>, generation: u64) {
        loop {
            let accepted = if self.peer_unreachable() {
                None
            } else {
                let timeout = self.config.shutdown_request_timeout;
                match self
                    .request(|request| ControlMessage::RequestManagerShutdown { request }, timeout)
                    .await
                {
                    Ok(accepted) => Some(accepted),
                    Err(e) => {
                        tracing::debug!("group {} shutdown request failed: {}", self.id, e);
                        None
                    }
                }
            };

            let outcome = self.lock().shutdown.on_response(generation, accepted);
            self.changed.notify_waiters();
            match outcome {
                Outcome::Commit { forced } => {
                    if forced {
                        tracing::warn!("group {} shutting down without peer agreement", self.id);
                    }
                    self.terminate(None);
                    return;
                }
                Outcome::Retry => {
                    tracing::debug!("group {} peer refused shutdown", self.id);
                    tokio::time::sleep(self.config.shutdown_monitor_period).await;
                    let resend = self.lock().shutdown.on_recheck(generation);
                    if !resend {
                        return;
                    }
                }
                Outcome::Stale => return,
            }
        }
    }

    pub(crate) async fn request_shutdown(self: &Arc<Self>, timeout: Duration) -> Result<bool> {
        if self.is_terminated() {
            return Err(MuxError::GroupShutdown);
        }
        let accepted = self
            .request(|request| ControlMessage::RequestManagerShutdown { request }, timeout)
            .await?;
        if accepted {
            tracing::debug!("group {} peer agreed to shut down", self.id);
            self.terminate(None);
        }
        Ok(accepted)
    }

    pub(crate) async fn reserve(self: &Arc<Self>) -> Option<Reservation> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = self.lock().shutdown.reserve();
            match decision {
                Reserve::Reserved => {
                    self.changed.notify_waiters();
                    return Some(Reservation {
                        group: Arc::clone(self),
                        active: true,
                    });
                }
                Reserve::Unavailable => return None,
                Reserve::Wait => notified.await,
            }
        }
    }

    fn unreserve(self: &Arc<Self>) {
        let negotiate = self.lock().shutdown.unreserve();
        self.changed.notify_waiters();
        if let Some(generation) = negotiate {
            self.start_negotiation(generation);
        }
    }

    fn acquire_reserved(&self) {
        self.lock().shutdown.acquire_reserved();
        self.changed.notify_waiters();
    }

    /// Terminal shutdown. Streams see `error`, or end of stream without one.
    pub(crate) fn terminate(self: &Arc<Self>, error: Option<&MuxError>) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.shutdown.commit() {
                return;
            }
            let event = ReadSide::from_error(error).inbound().unwrap_or(Inbound::End);
            for entry in state.inbound.values() {
                let _ = entry.sender.send(event.clone());
            }
            state.pending.clear();
            state.pending_bytes = 0;
            state.system.clear();
            state.acceptor = None;
        }

        if let Some(mux) = self.mux.upgrade() {
            mux.registry.remove(self);
        }
        self.terminated.cancel();
        self.protocol.fail_all();
        self.changed.notify_waiters();
        self.workers.output.close(&self.queue);

        match error {
            Some(e) => tracing::error!("group {} failed: {}", self.id, e),
            None => tracing::info!("group {} shut down", self.id),
        }

        let group = Arc::clone(self);
        self.workers.deferred.defer(async move {
            let drained = tokio::time::timeout(
                group.config.shutdown_request_timeout,
                group.queue.closed().cancelled(),
            )
            .await;
            if drained.is_err() {
                tracing::warn!("group {} output did not drain before close", group.id);
                group.workers.output.abandon(&group.queue);
            }
            group.read_cancel.cancel();
            let closer = group
                .closer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(closer) = closer {
                closer();
            }
            tracing::debug!("group {} released its connection", group.id);
        });
    }
}

/// Pins a group against shutdown while a caller decides to reuse it.
///
/// Dropping the reservation releases the pin; [`Reservation::acquire`]
/// converts it into a reference.
#[derive(Debug)]
pub struct Reservation {
    group: Arc<GroupShared>,
    active: bool,
}

impl Reservation {
    pub fn acquire(mut self) -> ConnectionGroup {
        self.active = false;
        self.group.acquire_reserved();
        ConnectionGroup::new(Arc::clone(&self.group))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            self.group.unreserve();
        }
    }
}

/// Handle to the virtual sockets sharing one real connection.
///
/// The handle that [`Mux::attach`](crate::Mux::attach) or
/// [`Mux::connect_to_peer`](crate::Mux::connect_to_peer) returns owns one
/// reference; call [`release`](Self::release) when done with it so the
/// group can shut down once its sockets are gone.
#[derive(Debug, Clone)]
pub struct ConnectionGroup {
    pub(crate) shared: Arc<GroupShared>,
}

impl ConnectionGroup {
    pub(crate) fn new(shared: Arc<GroupShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> GroupId {
        self.shared.id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Registers `local`, whose bytes go to the peer's `remote`.
    pub async fn register_virtual_socket(
        &self,
        local: SocketId,
        remote: SocketId,
    ) -> Result<(VirtualInputStream, VirtualOutputStream)> {
        self.shared.register_virtual_socket(local, remote).await
    }

    pub fn unregister_virtual_socket(&self, local: SocketId) -> Result<()> {
        self.shared.unregister_virtual_socket(local)
    }

    /// Starts accepting connects from the peer and announces it.
    pub async fn register_acceptor(&self) -> Result<Acceptor> {
        let requests = self.shared.register_acceptor().await?;
        Ok(Acceptor::new(self.clone(), requests))
    }

    pub async fn unregister_acceptor(&self) -> Result<()> {
        self.shared.unregister_acceptor().await
    }

    /// Asks the peer's acceptor to pair with `local`; returns the peer's id.
    pub async fn send_connect(&self, local: SocketId, timeout: Duration) -> Result<SocketId> {
        self.shared.send_connect(local, timeout).await
    }

    pub async fn answer_connect(
        &self,
        assigned: SocketId,
        client: SocketId,
    ) -> Result<(VirtualInputStream, VirtualOutputStream)> {
        self.shared.answer_connect(assigned, client).await
    }

    pub fn notify_output_shutdown(&self, destination: SocketId) -> Result<()> {
        self.shared.notify_output_shutdown(destination)
    }

    pub fn notify_disconnect(&self, destination: SocketId) -> Result<()> {
        self.shared.notify_disconnect(destination)
    }

    /// Asks the peer to agree to shut the connection down. On agreement
    /// this end shuts down as well.
    pub async fn request_shutdown(&self, timeout: Duration) -> Result<bool> {
        self.shared.request_shutdown(timeout).await
    }

    /// `None` if the group is shutting down and cannot be reused.
    pub async fn reserve(&self) -> Option<Reservation> {
        self.shared.reserve().await
    }

    pub async fn acquire(&self) -> Result<()> {
        self.shared.increment().await
    }

    pub fn release(&self) -> Result<()> {
        self.shared.decrement()
    }

    /// Terminates at once, without asking the peer. Registered streams fail.
    pub fn close(&self) {
        self.shared.terminate(Some(&MuxError::GroupShutdown));
    }

    /// Resolves once the group has shut down.
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_terminated()
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.shared.lock().shutdown.phase()
    }

    pub fn references(&self) -> u32 {
        self.shared.lock().shutdown.references()
    }

    pub fn has_remote_acceptor(&self) -> bool {
        self.shared.lock().remote_acceptor
    }

    pub fn is_registered(&self, local: SocketId) -> bool {
        self.shared.lock().inbound.contains_key(&local)
    }

    pub fn registered_ids(&self) -> Vec<SocketId> {
        let mut ids: Vec<_> = self.shared.lock().inbound.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn dead_letters(&self) -> DeadLetterStats {
        self.shared.lock().dead_letters
    }

    /// Unregistered ids with buffered input, and the bytes buffered for them.
    pub fn pending_input(&self) -> (usize, usize) {
        let state = self.shared.lock();
        (state.pending.len(), state.pending_bytes)
    }

    /// Unregistered ids whose late bytes are still dead-lettered.
    pub fn retired_count(&self) -> usize {
        self.shared.lock().retired.len()
    }

    /// Bytes queued for the wire and not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.shared.queue.queued_bytes()
    }
}
