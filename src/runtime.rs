use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning a timeout
/// error.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into())
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Handle to a background worker. Once all handles have been dropped, the
/// worker will stop on its next check.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

/// Listener used to determine when all handles have been dropped.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _sender: sender },
            WorkerHandleListener { receiver },
        )
    }

    /// Returns whether any handles are still alive.
    ///
    /// No messages are ever sent on the channel, so the only observable
    /// signal from `try_recv` is disconnection.
    pub(crate) fn is_alive(&mut self) -> bool {
        !matches!(
            self.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }

    /// Listen until all handles are dropped.
    /// This will not return until all handles are dropped, so make sure to only poll this via
    /// select or with a timeout.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }
}
