use crate::{
    control::ControlMessage,
    error::{MuxError, Result},
    group::GroupShared,
    socket_id::SocketId,
};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Outstanding exchanges of one group's control protocol.
///
/// Back-channel requests are matched to their `Response` by request id;
/// connects by the client's socket id and verifications by the assigned id.
#[derive(Debug, Default)]
pub(crate) struct ControlProtocol {
    next_request: AtomicU32,
    requests: DashMap<u32, oneshot::Sender<bool>>,
    connects: DashMap<SocketId, oneshot::Sender<Result<SocketId>>>,
    verifications: DashMap<SocketId, oneshot::Sender<()>>,
}

impl ControlProtocol {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start_request(&self) -> (u32, oneshot::Receiver<bool>) {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request, tx);
        (request, rx)
    }

    pub(crate) fn complete_request(&self, request: u32, accepted: bool) {
        match self.requests.remove(&request) {
            Some((_, tx)) => {
                let _ = tx.send(accepted);
            }
            None => tracing::debug!("response to unknown request {}", request),
        }
    }

    pub(crate) fn cancel_request(&self, request: u32) {
        self.requests.remove(&request);
    }

    pub(crate) fn expect_connect(
        &self,
        client: SocketId,
    ) -> Result<oneshot::Receiver<Result<SocketId>>> {
        let (tx, rx) = oneshot::channel();
        match self.connects.entry(client) {
            Entry::Occupied(_) => Err(MuxError::SocketAlreadyRegistered(client)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    pub(crate) fn complete_connect(&self, client: SocketId, result: Result<SocketId>) {
        match self.connects.remove(&client) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!("connect answer for unknown client {}", client),
        }
    }

    pub(crate) fn cancel_connect(&self, client: SocketId) {
        self.connects.remove(&client);
    }

    pub(crate) fn expect_verify(&self, assigned: SocketId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.verifications.insert(assigned, tx);
        rx
    }

    pub(crate) fn complete_verify(&self, assigned: SocketId) {
        match self.verifications.remove(&assigned) {
            Some((_, tx)) => {
                let _ = tx.send(());
            }
            None => tracing::debug!("unexpected verification for {}", assigned),
        }
    }

    pub(crate) fn cancel_verify(&self, assigned: SocketId) {
        self.verifications.remove(&assigned);
    }

    /// Wakes every waiter with a failure; the group can no longer answer.
    pub(crate) fn fail_all(&self) {
        self.requests.clear();
        self.verifications.clear();
        let clients: Vec<SocketId> = self.connects.iter().map(|entry| *entry.key()).collect();
        for client in clients {
            self.complete_connect(client, Err(MuxError::GroupShutdown));
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.requests.len() + self.connects.len() + self.verifications.len()
    }
}

/// Waits for a response with a deadline.
pub(crate) async fn await_response<T>(
    rx: oneshot::Receiver<T>,
    timeout: Duration,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(MuxError::Disconnected),
        Err(_) => Err(MuxError::Timeout),
    }
}

pub(crate) type BackChannelMessage = (Arc<GroupShared>, ControlMessage);

/// Process-wide task handling back-channel messages from every group.
pub(crate) async fn run_back_channel(
    messages: flume::Receiver<BackChannelMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv_async() => match message {
                Ok((group, message)) => {
                    if let Err(e) = group.handle_back_channel(message) {
                        tracing::debug!("group {} back channel: {}", group.id(), e);
                    }
                }
                Err(_) => break,
            },
        }
    }
    tracing::debug!("back channel task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_response_matching() {
        let protocol = ControlProtocol::new();
        let (first, first_rx) = protocol.start_request();
        let (second, second_rx) = protocol.start_request();
        assert_ne!(first, second);

        protocol.complete_request(second, false);
        protocol.complete_request(first, true);

        assert!(await_response(first_rx, Duration::from_secs(1)).await.unwrap());
        assert!(!await_response(second_rx, Duration::from_secs(1)).await.unwrap());
        assert_eq!(protocol.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let protocol = ControlProtocol::new();
        let (request, rx) = protocol.start_request();

        let result = await_response(rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(MuxError::Timeout)));
        protocol.cancel_request(request);
        assert_eq!(protocol.outstanding(), 0);

        // A late answer is ignored
        protocol.complete_request(request, true);
    }

    #[tokio::test]
    async fn test_connect_answers() {
        let protocol = ControlProtocol::new();
        let accepted = protocol.expect_connect(SocketId::new(3)).unwrap();
        let refused = protocol.expect_connect(SocketId::new(4)).unwrap();
        assert!(protocol.expect_connect(SocketId::new(3)).is_err());

        protocol.complete_connect(SocketId::new(3), Ok(SocketId::new(90)));
        protocol.complete_connect(
            SocketId::new(4),
            Err(MuxError::ConnectRefused(SocketId::new(4))),
        );

        let assigned = await_response(accepted, Duration::from_secs(1)).await.unwrap();
        assert_eq!(assigned.unwrap(), SocketId::new(90));
        let answer = await_response(refused, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(answer, Err(MuxError::ConnectRefused(_))));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let protocol = ControlProtocol::new();
        let (_, request_rx) = protocol.start_request();
        let connect_rx = protocol.expect_connect(SocketId::new(8)).unwrap();
        let verify_rx = protocol.expect_verify(SocketId::new(9));

        protocol.fail_all();

        assert!(matches!(
            await_response(request_rx, Duration::from_secs(1)).await,
            Err(MuxError::Disconnected)
        ));
        assert!(matches!(
            await_response(connect_rx, Duration::from_secs(1)).await,
            Ok(Err(MuxError::GroupShutdown))
        ));
        assert!(verify_rx.await.is_err());
        assert_eq!(protocol.outstanding(), 0);
    }
}
