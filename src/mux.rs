use crate::{
    config::Config,
    deferred::DeferredActions,
    error::{MuxError, Result},
    group::{ConnectionGroup, Endpoint, GroupId, GroupShared},
    input::{GroupReader, InputDemultiplexor, spawn_blocking_reader},
    output::{FrameSink, FrameWriter, OutputMultiplexor, OutputQueue},
    protocol::{BackChannelMessage, run_back_channel},
    registry::GroupRegistry,
    socket_id::SocketIdAllocator,
    transport::Transport,
};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

/// The shared worker tasks: output draining, readiness-driven input,
/// back-channel handling and deferred actions.
///
/// Every live group holds an `Arc<Workers>`; the tasks stop when the last
/// one is dropped.
pub(crate) struct Workers {
    pub(crate) output: Arc<OutputMultiplexor>,
    pub(crate) input: Arc<InputDemultiplexor>,
    pub(crate) back_channel: flume::Sender<BackChannelMessage>,
    pub(crate) deferred: DeferredActions,
    cancel: CancellationToken,
}

impl Workers {
    fn start(config: &Arc<Config>, runtime: &tokio::runtime::Handle) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let output = Arc::new(OutputMultiplexor::new(Arc::clone(config)));
        let input = Arc::new(InputDemultiplexor::new());
        let (back_channel, back_channel_rx) = flume::unbounded();
        let (deferred, deferred_rx) = DeferredActions::new();

        runtime.spawn(Arc::clone(&output).run(cancel.clone()));
        runtime.spawn(Arc::clone(&input).run(cancel.clone()));
        runtime.spawn(run_back_channel(back_channel_rx, cancel.clone()));
        runtime.spawn(DeferredActions::run(deferred_rx, cancel.clone()));
        tracing::debug!("worker tasks started");

        Arc::new(Self {
            output,
            input,
            back_channel,
            deferred,
            cancel,
        })
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct WorkerSlot {
    workers: Option<Arc<Workers>>,
    idle_ticks: u32,
}

pub(crate) struct MuxInner {
    pub(crate) config: Arc<Config>,
    pub(crate) allocator: Arc<SocketIdAllocator>,
    pub(crate) registry: GroupRegistry,
    pub(crate) runtime: tokio::runtime::Handle,
    workers: Mutex<WorkerSlot>,
    monitor: CancellationToken,
}

impl MuxInner {
    fn workers(&self) -> Arc<Workers> {
        let mut slot = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        slot.idle_ticks = 0;
        Arc::clone(
            slot.workers
                .get_or_insert_with(|| Workers::start(&self.config, &self.runtime)),
        )
    }

    /// Stops the workers after two consecutive idle ticks.
    fn check_idle(&self) {
        let mut slot = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let idle = match &slot.workers {
            Some(workers) => Arc::strong_count(workers) == 1,
            None => return,
        };
        if !idle {
            slot.idle_ticks = 0;
            return;
        }
        slot.idle_ticks += 1;
        if slot.idle_ticks >= 2 {
            slot.workers = None;
            slot.idle_ticks = 0;
            tracing::debug!("worker tasks idle, stopping");
        }
    }

    fn workers_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .workers
            .is_some()
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.monitor.cancel();
    }
}

async fn idle_monitor(inner: Weak<MuxInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_idle();
            }
        }
    }
}

/// Process-scoped multiplexing context.
///
/// Owns the virtual socket id space, the address-indexed group registry and
/// the shared worker tasks. Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("groups", &self.inner.registry.len())
            .field("sockets_in_use", &self.inner.allocator.in_use())
            .finish()
    }
}

impl Mux {
    /// Creates a context. Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MuxError::Config(format!("no Tokio runtime: {}", e)))?;

        let config = Arc::new(config);
        let monitor = CancellationToken::new();
        let inner = Arc::new(MuxInner {
            allocator: Arc::new(SocketIdAllocator::new(config.max_socket_id)),
            registry: GroupRegistry::new(),
            runtime: runtime.clone(),
            workers: Mutex::new(WorkerSlot::default()),
            monitor: monitor.clone(),
            config,
        });

        runtime.spawn(idle_monitor(
            Arc::downgrade(&inner),
            inner.config.static_threads_monitor_period,
            monitor,
        ));
        Ok(Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn allocator(&self) -> &Arc<SocketIdAllocator> {
        &self.inner.allocator
    }

    /// Wraps an established connection in a new group.
    ///
    /// A `shareable` group may be handed out again by
    /// [`connect_to_peer`](Self::connect_to_peer) for the same peer address.
    pub fn attach(&self, transport: impl Into<Transport>, shareable: bool) -> Result<ConnectionGroup> {
        let transport = transport.into();
        let workers = self.inner.workers();
        let id = GroupId::next();
        let local_addr = transport.local_addr();
        let peer_addr = transport.peer_addr();

        let group = match transport {
            Transport::Async(transport) => {
                let queue = Arc::new(OutputQueue::new(
                    id,
                    FrameWriter::new(FrameSink::Async(transport.writer)),
                ));
                let endpoint = Endpoint {
                    local_addr,
                    peer_addr,
                    closer: None,
                };
                let group = GroupShared::new(id, &self.inner, Arc::clone(&workers), queue, endpoint);
                workers
                    .input
                    .register(GroupReader::new(Arc::clone(&group), transport.reader));
                group
            }
            Transport::Blocking(transport) => {
                let sink = FrameSink::Blocking(Arc::new(Mutex::new(transport.writer)));
                let writer = FrameWriter::new(sink);
                let queue = Arc::new(OutputQueue::new(id, writer));
                let endpoint = Endpoint {
                    local_addr,
                    peer_addr,
                    closer: transport.closer,
                };
                let group = GroupShared::new(id, &self.inner, Arc::clone(&workers), queue, endpoint);
                spawn_blocking_reader(Arc::clone(&group), transport.reader)?;
                group
            }
        };

        self.inner.registry.insert(&group, shareable);
        tracing::info!(
            "group {} attached ({:?} -> {:?})",
            id,
            local_addr,
            peer_addr
        );
        Ok(ConnectionGroup::new(group))
    }

    /// Returns a group connected to `remote`, reusing a shareable one when
    /// possible. The caller owns one reference on the returned group.
    pub async fn connect_to_peer(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<ConnectionGroup> {
        for candidate in self.inner.registry.find_shareable(remote, local) {
            if let Some(reservation) = candidate.reserve().await {
                tracing::debug!("reusing group {} for {}", candidate.id(), remote);
                return Ok(reservation.acquire());
            }
        }

        let stream = tokio::time::timeout(timeout, connect_tcp(remote, local))
            .await
            .map_err(|_| MuxError::Timeout)??;
        stream.set_nodelay(true)?;
        self.attach(stream, true)
    }

    pub fn group(&self, id: GroupId) -> Option<ConnectionGroup> {
        self.inner.registry.get(id).map(ConnectionGroup::new)
    }

    pub fn groups(&self) -> Vec<ConnectionGroup> {
        self.inner
            .registry
            .groups()
            .into_iter()
            .map(ConnectionGroup::new)
            .collect()
    }

    pub fn groups_by_local(&self, local: &SocketAddr) -> Vec<ConnectionGroup> {
        self.inner
            .registry
            .by_local(local)
            .into_iter()
            .map(ConnectionGroup::new)
            .collect()
    }

    pub fn groups_by_remote(&self, remote: &SocketAddr) -> Vec<ConnectionGroup> {
        self.inner
            .registry
            .by_remote(remote)
            .into_iter()
            .map(ConnectionGroup::new)
            .collect()
    }

    /// True while the shared worker tasks are running.
    pub fn workers_running(&self) -> bool {
        self.inner.workers_running()
    }
}

async fn connect_tcp(remote: SocketAddr, local: Option<SocketAddr>) -> Result<TcpStream> {
    let Some(local) = local else {
        return Ok(TcpStream::connect(remote).await?);
    };
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    Ok(socket.connect(remote).await?)
}
