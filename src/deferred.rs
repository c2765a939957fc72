use futures::future::BoxFuture;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Slow cleanup moved off time-critical paths.
///
/// Actions run one at a time, in submission order, on the deferred-action task.
#[derive(Debug, Clone)]
pub(crate) struct DeferredActions {
    tx: flume::Sender<BoxFuture<'static, ()>>,
}

impl DeferredActions {
    pub(crate) fn new() -> (Self, flume::Receiver<BoxFuture<'static, ()>>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn defer<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(action)).is_err() {
            tracing::debug!("deferred action dropped; task is gone");
        }
    }

    pub(crate) async fn run(
        actions: flume::Receiver<BoxFuture<'static, ()>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                action = actions.recv_async() => match action {
                    Ok(action) => action.await,
                    Err(_) => break,
                },
            }
        }
        tracing::debug!("deferred action task stopped");
    }
}
