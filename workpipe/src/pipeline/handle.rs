//! Caller-side handle for one submitted work item.

use super::item::{ItemId, WorkItem};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

pub(crate) type ItemReply<P> = oneshot::Sender<WorkpipeResult<WorkItem<P>>>;

/// Resolves to the submitted item once no further stage claims it.
///
/// The handle only holds the receiving side of a reply channel and the
/// item's cancel flag, never a reference to the pipeline, so dropping the
/// pipeline first is fine: pending handles then resolve with
/// [`WorkpipeError::Shutdown`] or with a cancelled item.
#[derive(Debug)]
pub struct WorkHandle<P> {
    id: ItemId,
    cancelled: Arc<AtomicBool>,
    rx: oneshot::Receiver<WorkpipeResult<WorkItem<P>>>,
}

impl<P> WorkHandle<P> {
    pub(crate) fn new(
        id: ItemId,
        cancelled: Arc<AtomicBool>,
        rx: oneshot::Receiver<WorkpipeResult<WorkItem<P>>>,
    ) -> Self {
        Self { id, cancelled, rx }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Stop routing the item to further stages.
    ///
    /// A stage that is already running is not interrupted; it can observe the
    /// request through `StageContext::is_cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl<P> Future for WorkHandle<P> {
    type Output = WorkpipeResult<WorkItem<P>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkpipeError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_with_item() {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem::new(5u8);
        let handle = WorkHandle::new(item.id(), Arc::new(AtomicBool::new(false)), rx);
        let id = handle.id();
        tx.send(Ok(item)).unwrap();

        let item = handle.await.unwrap();
        assert_eq!(item.id(), id);
        assert_eq!(*item.payload(), 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_shutdown() {
        let (tx, rx) = oneshot::channel::<WorkpipeResult<WorkItem<u8>>>();
        let handle = WorkHandle::new(1, Arc::new(AtomicBool::new(false)), rx);
        drop(tx);
        assert!(matches!(handle.await, Err(WorkpipeError::Shutdown)));
    }

    #[test]
    fn test_cancel_sets_shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = oneshot::channel::<WorkpipeResult<WorkItem<u8>>>();
        let handle = WorkHandle::new(1, Arc::clone(&flag), rx);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(flag.load(Ordering::SeqCst));
    }
}
