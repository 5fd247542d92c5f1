use crate::client_error;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::oneshot;

/// The resolving half, kept by the connection task.
pub(crate) type PromiseResolver<T> = oneshot::Sender<Result<T>>;

/// Handle for the eventual result of one client operation.
///
/// The operation resolves or fails exactly once on the connection task;
/// waiting with a timeout does not invalidate the handle.
pub struct Promise<T> {
    rx: oneshot::Receiver<Result<T>>,
}

pub(crate) fn promise<T>() -> (PromiseResolver<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();

    (tx, Promise { rx })
}

impl<T> Promise<T> {
    /// Waits until the operation resolves or fails.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => client_error!(None, 501, "Connection closed by peer", 0),
        }
    }

    /// Waits at most `timeout`. Returns `Ok(None)` if there is no result yet;
    /// the promise stays valid and can be waited again.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            result = &mut self.rx => {
                match result {
                    Ok(result) => result.map(Some),
                    Err(_) => client_error!(None, 501, "Connection closed by peer", 0),
                }
            }
            _ = &mut sleep => Ok(None),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Promise")
    }
}
