//! One-shot results of worker-side operations

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::inference::ContextId;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Result of a command queued on a context worker
///
/// Dropping it does not cancel the command.
#[must_use = "a Pending does nothing unless waited on"]
pub struct Pending<T> {
    context_id: ContextId,
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel(context_id: ContextId) -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { context_id, rx })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Blocks until the worker answers. Must not be called from within an
    /// async runtime.
    pub fn wait(self) -> Result<T, EngineError> {
        let id = self.context_id;
        self.rx
            .blocking_recv()
            .unwrap_or(Err(EngineError::ContextNotFound(id)))
    }

    pub async fn wait_async(self) -> Result<T, EngineError> {
        let id = self.context_id;
        self.rx
            .await
            .unwrap_or(Err(EngineError::ContextNotFound(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_wait_receives_reply() {
        let (tx, pending) = Pending::<u32>::channel(4);
        std::thread::spawn(move || {
            let _ = tx.send(Ok(7));
        });
        assert_eq!(pending.wait().unwrap(), 7);
    }

    #[test]
    fn test_dropped_reply_means_context_gone() {
        let (tx, pending) = Pending::<u32>::channel(9);
        drop(tx);
        let err = pending.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContextNotFound);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let (tx, pending) = Pending::<String>::channel(1);
        let _ = tx.send(Ok("ok".into()));
        assert_eq!(pending.wait_async().await.unwrap(), "ok");
    }
}
